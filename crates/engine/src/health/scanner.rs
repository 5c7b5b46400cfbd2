use std::sync::Arc;

use chatvault_core::{
    ChunkProbeResult, ChunkRecord, HealthScanRecord, ObjectStatus, ProgressSender, ScanId, ScanProgress, ScanScope,
    ScanStatus,
};
use chatvault_platform::CdnClient;
use chatvault_pool::ConnectionPool;
use chatvault_state::MetadataStore;
use dashmap::DashMap;
use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::probe::probe_chunk;
use crate::config::ScanConfig;
use crate::egress::UrlResolver;
use crate::error::EngineError;

/// Audits stored chunks by probing their attachment URLs.
///
/// Scans run in bounded batches with a pause between batches, flush each
/// batch of results to the store as it completes, and can be cancelled by
/// id. Cancelled scans keep everything already flushed.
#[derive(Clone)]
pub struct HealthScanner {
    pub(super) inner: Arc<ScannerInner>,
}

pub(super) struct ScannerInner {
    pub(super) pool: ConnectionPool,
    pub(super) store: Arc<dyn MetadataStore>,
    pub(super) cdn: Arc<dyn CdnClient>,
    pub(super) resolver: UrlResolver,
    pub(super) config: ScanConfig,
    active: DashMap<ScanId, CancellationToken>,
}

impl std::fmt::Debug for HealthScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthScanner")
            .field("config", &self.inner.config)
            .field("active", &self.inner.active.len())
            .finish_non_exhaustive()
    }
}

impl HealthScanner {
    pub fn new(
        pool: ConnectionPool,
        store: Arc<dyn MetadataStore>,
        cdn: Arc<dyn CdnClient>,
        config: ScanConfig,
    ) -> Self {
        let resolver = UrlResolver::new(pool.clone(), Arc::clone(&store), config.concurrency);
        Self {
            inner: Arc::new(ScannerInner {
                pool,
                store,
                cdn,
                resolver,
                config,
                active: DashMap::new(),
            }),
        }
    }

    /// Run a scan to completion (or cancellation) and return its final record.
    pub async fn run_scan(
        &self,
        scope: ScanScope,
        progress: ProgressSender<ScanProgress>,
    ) -> Result<HealthScanRecord, EngineError> {
        let (record, cancel) = self.open(scope).await?;
        let id = record.id.clone();
        let result = self.inner.execute(record, &cancel, &progress).await;
        self.inner.active.remove(&id);
        result
    }

    /// Start a scan in the background and return its id at once.
    ///
    /// The scan record exists in the store before this returns.
    pub async fn start_scan(
        &self,
        scope: ScanScope,
        progress: ProgressSender<ScanProgress>,
    ) -> Result<ScanId, EngineError> {
        let (record, cancel) = self.open(scope).await?;
        let id = record.id.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let id = record.id.clone();
            if let Err(e) = inner.execute(record, &cancel, &progress).await {
                warn!(scan_id = %id, error = %e, "background scan failed");
            }
            inner.active.remove(&id);
        });
        Ok(id)
    }

    /// Ask a running scan to stop. Returns `false` if no such scan is running.
    pub fn cancel_scan(&self, scan_id: &ScanId) -> bool {
        match self.inner.active.get(scan_id) {
            Some(token) => {
                token.cancel();
                info!(scan_id = %scan_id, "scan cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, scan_id: &ScanId) -> bool {
        self.inner.active.contains_key(scan_id)
    }

    pub async fn get_scan(&self, scan_id: &ScanId) -> Result<HealthScanRecord, EngineError> {
        self.inner
            .store
            .get_scan(scan_id)
            .await?
            .ok_or_else(|| EngineError::ScanNotFound(scan_id.clone()))
    }

    async fn open(&self, scope: ScanScope) -> Result<(HealthScanRecord, CancellationToken), EngineError> {
        if let ScanScope::Sample { percent } = scope
            && !(percent > 0.0 && percent <= 100.0)
        {
            return Err(EngineError::InvalidInput(format!(
                "sample percent must be in (0, 100], got {percent}"
            )));
        }
        let record = HealthScanRecord::start(ScanId::generate(), scope);
        self.inner.store.insert_scan(&record).await?;
        let cancel = CancellationToken::new();
        self.inner.active.insert(record.id.clone(), cancel.clone());
        Ok((record, cancel))
    }
}

impl ScannerInner {
    #[instrument(skip_all, fields(scan_id = %record.id))]
    async fn execute(
        &self,
        mut record: HealthScanRecord,
        cancel: &CancellationToken,
        progress: &ProgressSender<ScanProgress>,
    ) -> Result<HealthScanRecord, EngineError> {
        match self.probe_all(&mut record, cancel, progress).await {
            Ok(finished) => {
                let status = if finished {
                    ScanStatus::Completed
                } else {
                    ScanStatus::Cancelled
                };
                record.finish(status, None);
                self.store.update_scan(&record).await?;
                info!(
                    scan_id = %record.id,
                    status = ?record.status,
                    checked = record.checked,
                    healthy = record.healthy,
                    unhealthy = record.unhealthy,
                    errors = record.errors,
                    "scan finished"
                );
                Ok(record)
            }
            Err(e) => {
                record.finish(ScanStatus::Error, Some(e.to_string()));
                if let Err(store_err) = self.store.update_scan(&record).await {
                    warn!(scan_id = %record.id, error = %store_err, "could not record scan failure");
                }
                Err(e)
            }
        }
    }

    /// Probe every target batch by batch. Returns `false` when cancelled.
    async fn probe_all(
        &self,
        record: &mut HealthScanRecord,
        cancel: &CancellationToken,
        progress: &ProgressSender<ScanProgress>,
    ) -> Result<bool, EngineError> {
        let targets = self.select_targets(&record.scope).await?;
        record.total = targets.len() as u64;
        self.store.update_scan(record).await?;
        info!(scan_id = %record.id, targets = targets.len(), "scan started");

        let batch_size = self.config.concurrency.max(1);
        let batches = targets.len().div_ceil(batch_size);
        let mut last_emit: Option<Instant> = None;

        for (index, batch) in targets.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let results = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(false),
                results = self.probe_batch(batch) => results,
            };

            for result in &results {
                record.record(result);
            }
            self.store.append_scan_results(&record.id, &results).await?;
            self.store.update_scan(record).await?;
            debug!(scan_id = %record.id, batch = index + 1, batches, "batch flushed");

            if last_emit.is_none_or(|t| t.elapsed() >= self.config.progress_interval) {
                progress.emit(snapshot(record));
                last_emit = Some(Instant::now());
            }

            if index + 1 < batches && !self.config.batch_delay.is_zero() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(false),
                    () = tokio::time::sleep(self.config.batch_delay) => {}
                }
            }
        }
        progress.emit(snapshot(record));
        Ok(true)
    }

    async fn probe_batch(&self, batch: &[ChunkRecord]) -> Vec<ChunkProbeResult> {
        let resolution = self.resolver.resolve(batch.to_vec()).await;
        let timeout = self.config.probe_timeout;
        let cdn = self.cdn.as_ref();
        join_all(resolution.chunks.iter().enumerate().map(|(i, chunk)| {
            probe_chunk(cdn, chunk, resolution.fallbacks.contains(&i), timeout)
        }))
        .await
    }

    /// Chunks covered by `scope`, in a stable order.
    pub(super) async fn select_targets(&self, scope: &ScanScope) -> Result<Vec<ChunkRecord>, EngineError> {
        let objects = match scope {
            ScanScope::Object { object_id } => vec![
                self.store
                    .get_object(object_id)
                    .await?
                    .ok_or_else(|| EngineError::ObjectNotFound(object_id.clone()))?,
            ],
            ScanScope::Folder { folder } => self.store.list_objects(Some(folder.as_str())).await?,
            ScanScope::All | ScanScope::Sample { .. } => self.store.list_objects(None).await?,
        };

        let mut chunks = Vec::new();
        for object in objects {
            if object.status == ObjectStatus::Uploading && !matches!(scope, ScanScope::Object { .. }) {
                continue;
            }
            chunks.extend(self.store.get_chunks(&object.id).await?);
        }

        if let ScanScope::Sample { .. } = scope {
            let picked = scope.sample_size(chunks.len());
            let mut sample: Vec<ChunkRecord> = chunks
                .choose_multiple(&mut rand::thread_rng(), picked)
                .cloned()
                .collect();
            sample.sort_by(|a, b| (&a.object_id, a.sequence).cmp(&(&b.object_id, b.sequence)));
            return Ok(sample);
        }
        Ok(chunks)
    }
}

fn snapshot(record: &HealthScanRecord) -> ScanProgress {
    ScanProgress {
        scan_id: record.id.clone(),
        checked: record.checked,
        total: record.total,
        healthy: record.healthy,
        unhealthy: record.unhealthy,
        errors: record.errors,
    }
}
