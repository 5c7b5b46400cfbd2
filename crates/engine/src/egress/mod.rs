//! Download path: refresh URLs, fetch chunks into an offset-addressed sink,
//! decrypt.

mod decrypt;
mod download;
mod fetch;
mod resolver;
mod sink;

pub use decrypt::{ChunkSpan, chunk_spans, decrypt, sealed_parts};
pub use download::{DownloadReport, Downloader};
pub use fetch::{FetchReport, fetch_to_offset};
pub use resolver::{Resolution, UrlResolver};
pub(crate) use resolver::match_attachment;
pub use sink::{FileSink, MemorySink, OffsetSink};
