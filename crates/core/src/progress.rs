//! Structured progress reporting.
//!
//! Producers hold a [`ProgressSender`] and emit typed records; a consumer
//! subscribes once by keeping the receiver returned from [`progress_channel`].
//! Emitting never blocks and never fails: a dropped receiver simply turns the
//! sender into a no-op.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{ObjectId, ScanId};

/// Sending half of a progress subscription.
#[derive(Debug)]
pub struct ProgressSender<T> {
    tx: Option<mpsc::UnboundedSender<T>>,
}

impl<T> Clone for ProgressSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Default for ProgressSender<T> {
    fn default() -> Self {
        Self::disabled()
    }
}

impl<T> ProgressSender<T> {
    /// A sender that discards every record.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit a record to the subscriber, if any.
    pub fn emit(&self, record: T) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(record);
        }
    }
}

/// Create a connected sender/receiver pair.
pub fn progress_channel<T>() -> (ProgressSender<T>, mpsc::UnboundedReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx: Some(tx) }, rx)
}

/// Stage of an ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    /// Chunks are being encrypted.
    Encrypting,
    /// Batches are being sent.
    Uploading,
    /// Chunk rows are being validated and the object finalized.
    Finalizing,
    /// The object is complete.
    Done,
}

/// Progress record emitted by the ingest pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestProgress {
    /// Object being ingested.
    pub object_id: ObjectId,
    /// Current stage.
    pub stage: IngestStage,
    /// Chunks stored so far.
    pub chunks_done: u32,
    /// Chunks expected in total.
    pub chunks_total: u32,
    /// Running percentage, `0.0..=100.0`.
    pub percent: f64,
}

impl IngestProgress {
    /// Build a record, deriving the percentage from the chunk counts.
    pub fn new(object_id: ObjectId, stage: IngestStage, done: u32, total: u32) -> Self {
        Self {
            object_id,
            stage,
            chunks_done: done,
            chunks_total: total,
            percent: percent(u64::from(done), u64::from(total)),
        }
    }
}

/// Progress record emitted while reassembling an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressProgress {
    /// Chunks written to the sink.
    pub chunks_done: usize,
    /// Chunks to fetch.
    pub chunks_total: usize,
    /// Bytes written so far.
    pub bytes_written: u64,
    /// Bytes expected.
    pub bytes_total: u64,
}

/// Progress record emitted by a running health scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Scan identifier.
    pub scan_id: ScanId,
    /// Chunks probed.
    pub checked: u64,
    /// Chunks selected.
    pub total: u64,
    /// Healthy so far.
    pub healthy: u64,
    /// Unhealthy so far.
    pub unhealthy: u64,
    /// Errors so far.
    pub errors: u64,
}

/// `done / total` as a percentage; an empty total counts as finished.
#[allow(clippy::cast_precision_loss)]
pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (done as f64 / total as f64 * 100.0).min(100.0)
}
