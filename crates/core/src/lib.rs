//! Shared data model for the chatvault storage engine.
//!
//! Objects are split into ordered chunks, each chunk stored as an attachment
//! on a chat platform message. Only the `(channel, message)` pair of a chunk
//! is durable; its download URL is a cache that expires.

pub mod chunk;
pub mod object;
pub mod progress;
pub mod scan;
pub mod types;

pub use chunk::{
    ChunkRecord, MessageRef, StoredBytes, chunk_file_name, chunk_offsets, is_contiguous,
    parse_chunk_sequence,
};
pub use object::{ObjectMeta, ObjectRecord, ObjectStatus, expected_chunk_count};
pub use progress::{
    EgressProgress, IngestProgress, IngestStage, ProgressSender, ScanProgress, progress_channel,
};
pub use scan::{ChunkProbeResult, HealthScanRecord, ProbeOutcome, ScanScope, ScanStatus};
pub use types::{ChannelId, MessageId, ObjectId, ScanId};
