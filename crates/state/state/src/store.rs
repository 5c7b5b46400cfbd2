use async_trait::async_trait;
use chatvault_core::{ChunkProbeResult, ChunkRecord, HealthScanRecord, ObjectId, ObjectRecord, ScanId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// A refreshed download URL for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkUrlUpdate {
    pub object_id: ObjectId,
    pub sequence: u32,
    pub url: String,
    pub refreshed_at: DateTime<Utc>,
}

/// Trait for persisting object, chunk and scan metadata.
///
/// Every write is a single-row, auto-committing operation and re-writing the
/// same row is harmless. Implementations must be `Send + Sync` and safe for
/// concurrent access.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new object. Fails with [`StateError::AlreadyExists`] if the id is taken.
    async fn insert_object(&self, record: &ObjectRecord) -> Result<(), StateError>;

    /// Get an object by id.
    async fn get_object(&self, id: &ObjectId) -> Result<Option<ObjectRecord>, StateError>;

    /// Replace an existing object. Fails with [`StateError::NotFound`] if absent.
    async fn update_object(&self, record: &ObjectRecord) -> Result<(), StateError>;

    /// Delete an object and all of its chunks. Returns `true` if the object existed.
    async fn delete_object(&self, id: &ObjectId) -> Result<bool, StateError>;

    /// List objects, optionally restricted to one folder, oldest first.
    async fn list_objects(&self, folder: Option<&str>) -> Result<Vec<ObjectRecord>, StateError>;

    /// Insert chunk rows, overwriting any row with the same `(object_id, sequence)`.
    async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<(), StateError>;

    /// All chunks of an object ordered by sequence.
    async fn get_chunks(&self, object_id: &ObjectId) -> Result<Vec<ChunkRecord>, StateError>;

    /// Apply refreshed URLs. Returns how many rows were updated.
    async fn update_chunk_urls(&self, updates: &[ChunkUrlUpdate]) -> Result<usize, StateError>;

    /// Remove every chunk of an object. Returns how many rows were removed.
    async fn delete_chunks(&self, object_id: &ObjectId) -> Result<usize, StateError>;

    /// Insert a new scan record.
    async fn insert_scan(&self, scan: &HealthScanRecord) -> Result<(), StateError>;

    /// Replace a scan record's counters and status.
    async fn update_scan(&self, scan: &HealthScanRecord) -> Result<(), StateError>;

    /// Append a batch of probe results to a scan.
    async fn append_scan_results(
        &self,
        scan_id: &ScanId,
        results: &[ChunkProbeResult],
    ) -> Result<(), StateError>;

    /// Get a scan by id.
    async fn get_scan(&self, scan_id: &ScanId) -> Result<Option<HealthScanRecord>, StateError>;

    /// Every result recorded for a scan, in insertion order.
    async fn get_scan_results(&self, scan_id: &ScanId) -> Result<Vec<ChunkProbeResult>, StateError>;
}
