use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chatvault_core::{ChunkProbeResult, ChunkRecord, HealthScanRecord, ObjectId, ObjectRecord, ScanId};
use chatvault_state::{ChunkUrlUpdate, MetadataStore, StateError};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// In-memory metadata store backed by [`DashMap`].
///
/// Suitable for tests and single-process use. The whole store can be written
/// to and read back from a JSON snapshot file.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    objects: DashMap<ObjectId, ObjectRecord>,
    chunks: DashMap<ObjectId, BTreeMap<u32, ChunkRecord>>,
    scans: DashMap<ScanId, HealthScanRecord>,
    scan_results: DashMap<ScanId, Vec<ChunkProbeResult>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    objects: Vec<ObjectRecord>,
    #[serde(default)]
    chunks: Vec<ChunkRecord>,
    #[serde(default)]
    scans: Vec<HealthScanRecord>,
    #[serde(default)]
    scan_results: BTreeMap<ScanId, Vec<ChunkProbeResult>>,
}

impl MemoryMetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from a snapshot file. A missing file yields an empty store.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no snapshot, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&raw)?;
        let store = Self::new();
        for record in snapshot.objects {
            store.objects.insert(record.id.clone(), record);
        }
        for chunk in snapshot.chunks {
            store
                .chunks
                .entry(chunk.object_id.clone())
                .or_default()
                .insert(chunk.sequence, chunk);
        }
        for scan in snapshot.scans {
            store.scans.insert(scan.id.clone(), scan);
        }
        for (id, results) in snapshot.scan_results {
            store.scan_results.insert(id, results);
        }
        info!(
            path = %path.display(),
            objects = store.objects.len(),
            scans = store.scans.len(),
            "snapshot loaded"
        );
        Ok(store)
    }

    /// Write the whole store to `path`, replacing it atomically.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), StateError> {
        let path = path.as_ref();
        let mut objects: Vec<_> = self.objects.iter().map(|e| e.value().clone()).collect();
        objects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let mut chunks: Vec<_> = self
            .chunks
            .iter()
            .flat_map(|e| e.value().values().cloned().collect::<Vec<_>>())
            .collect();
        chunks.sort_by(|a, b| a.object_id.cmp(&b.object_id).then(a.sequence.cmp(&b.sequence)));
        let mut scans: Vec<_> = self.scans.iter().map(|e| e.value().clone()).collect();
        scans.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        let scan_results = self
            .scan_results
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let snapshot = Snapshot {
            objects,
            chunks,
            scans,
            scan_results,
        };
        let raw = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "snapshot saved");
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert_object(&self, record: &ObjectRecord) -> Result<(), StateError> {
        match self.objects.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(StateError::AlreadyExists(record.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get_object(&self, id: &ObjectId) -> Result<Option<ObjectRecord>, StateError> {
        Ok(self.objects.get(id).map(|r| r.value().clone()))
    }

    async fn update_object(&self, record: &ObjectRecord) -> Result<(), StateError> {
        match self.objects.get_mut(&record.id) {
            Some(mut existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StateError::NotFound(record.id.to_string())),
        }
    }

    async fn delete_object(&self, id: &ObjectId) -> Result<bool, StateError> {
        self.chunks.remove(id);
        Ok(self.objects.remove(id).is_some())
    }

    async fn list_objects(&self, folder: Option<&str>) -> Result<Vec<ObjectRecord>, StateError> {
        let mut out: Vec<_> = self
            .objects
            .iter()
            .filter(|e| folder.is_none_or(|f| e.value().folder.as_deref() == Some(f)))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<(), StateError> {
        for chunk in chunks {
            self.chunks
                .entry(chunk.object_id.clone())
                .or_default()
                .insert(chunk.sequence, chunk.clone());
        }
        Ok(())
    }

    async fn get_chunks(&self, object_id: &ObjectId) -> Result<Vec<ChunkRecord>, StateError> {
        Ok(self
            .chunks
            .get(object_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_chunk_urls(&self, updates: &[ChunkUrlUpdate]) -> Result<usize, StateError> {
        let mut updated = 0;
        for update in updates {
            if let Some(mut rows) = self.chunks.get_mut(&update.object_id)
                && let Some(chunk) = rows.get_mut(&update.sequence)
            {
                chunk.url.clone_from(&update.url);
                chunk.url_refreshed_at = Some(update.refreshed_at);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete_chunks(&self, object_id: &ObjectId) -> Result<usize, StateError> {
        Ok(self
            .chunks
            .remove(object_id)
            .map_or(0, |(_, rows)| rows.len()))
    }

    async fn insert_scan(&self, scan: &HealthScanRecord) -> Result<(), StateError> {
        self.scans.insert(scan.id.clone(), scan.clone());
        Ok(())
    }

    async fn update_scan(&self, scan: &HealthScanRecord) -> Result<(), StateError> {
        match self.scans.get_mut(&scan.id) {
            Some(mut existing) => {
                *existing = scan.clone();
                Ok(())
            }
            None => Err(StateError::NotFound(scan.id.to_string())),
        }
    }

    async fn append_scan_results(
        &self,
        scan_id: &ScanId,
        results: &[ChunkProbeResult],
    ) -> Result<(), StateError> {
        self.scan_results
            .entry(scan_id.clone())
            .or_default()
            .extend_from_slice(results);
        Ok(())
    }

    async fn get_scan(&self, scan_id: &ScanId) -> Result<Option<HealthScanRecord>, StateError> {
        Ok(self.scans.get(scan_id).map(|s| s.value().clone()))
    }

    async fn get_scan_results(&self, scan_id: &ScanId) -> Result<Vec<ChunkProbeResult>, StateError> {
        Ok(self
            .scan_results
            .get(scan_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chatvault_core::{ChannelId, MessageId, ObjectMeta, ScanScope, StoredBytes};

    use super::*;

    #[tokio::test]
    async fn conformance() {
        let store = MemoryMetadataStore::new();
        chatvault_state::testing::run_store_conformance_tests(&store)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta").join("store.json");

        let store = MemoryMetadataStore::new();
        let record = ObjectRecord::from_meta(
            ObjectId::new("o1"),
            &ObjectMeta::new("a.bin", 5, "me").with_folder("docs"),
            5,
        );
        store.insert_object(&record).await.unwrap();
        store
            .insert_chunks(&[ChunkRecord {
                object_id: record.id.clone(),
                sequence: 1,
                message_id: MessageId::new("m1"),
                channel_id: ChannelId::new("c1"),
                attachment_index: 0,
                url: "https://cdn.test/a".into(),
                size: 21,
                plain_size: 5,
                iv: Some(StoredBytes::text("AAAAAAAAAAAAAAAA")),
                tag: None,
                url_refreshed_at: None,
            }])
            .await
            .unwrap();
        let scan = HealthScanRecord::start(ScanId::new("s1"), ScanScope::All);
        store.insert_scan(&scan).await.unwrap();
        store.save(&path).await.unwrap();

        let loaded = MemoryMetadataStore::load(&path).await.unwrap();
        assert_eq!(loaded.get_object(&record.id).await.unwrap(), Some(record.clone()));
        let chunks = loaded.get_chunks(&record.id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].iv, Some(StoredBytes::text("AAAAAAAAAAAAAAAA")));
        assert!(loaded.get_scan(&scan.id).await.unwrap().is_some());
        assert_eq!(loaded.list_objects(Some("docs")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryMetadataStore::load(dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(store.list_objects(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let err = MemoryMetadataStore::load(&path).await.unwrap_err();
        assert!(matches!(err, StateError::Serialization(_)));
    }
}
