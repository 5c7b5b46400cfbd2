//! Upload path: split, encrypt, batch, send, persist, and roll back on failure.

pub mod controller;
mod dispatch;
mod pipeline;
mod rollback;
mod session;
pub mod split;

pub use controller::{AdaptiveController, Adjustment};
pub use dispatch::PreparedChunk;
pub use session::{IngestService, UploadTicket};
pub use split::{ChunkReader, PlainChunk, effective_chunk_size, split_bytes};
