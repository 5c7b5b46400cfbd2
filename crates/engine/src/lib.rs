//! Storage pipelines of chatvault.
//!
//! Objects are split into chunks, optionally encrypted, and posted as
//! message attachments through a [`chatvault_pool::ConnectionPool`]; the
//! chunk map lives in a [`chatvault_state::MetadataStore`].
//!
//! - [`IngestService`] uploads objects, either through explicit
//!   start/submit/finish sessions or by streaming a reader, and rolls back
//!   every posted message when an upload fails.
//! - [`Downloader`] refreshes attachment URLs, fetches chunks concurrently
//!   into offset-addressed storage and decrypts them in sequence order.
//! - [`HealthScanner`] probes chunk URLs in bounded batches and explains
//!   why chunks are unreachable.

pub mod config;
pub mod egress;
pub mod error;
pub mod health;
pub mod ingest;

pub use config::{EgressConfig, IngestConfig, ScanConfig};
pub use egress::{
    DownloadReport, Downloader, FetchReport, FileSink, MemorySink, OffsetSink, Resolution, UrlResolver,
    fetch_to_offset,
};
pub use error::EngineError;
pub use health::{Check, ChunkDiagnostic, Diagnosis, DiagnosticReport, HealthScanner};
pub use ingest::{AdaptiveController, IngestService, PlainChunk, UploadTicket};
