use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chatvault_core::{
    ChunkRecord, IngestProgress, IngestStage, MessageRef, ObjectId, ObjectMeta, ObjectRecord, ObjectStatus,
    ProgressSender, is_contiguous,
};
use chatvault_crypto::{ChunkCodec, ChunkedHeader, EncryptionHeader};
use chatvault_pool::{ConnectionPool, DeleteReport};
use chatvault_state::MetadataStore;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::dispatch::{SentLedger, into_batches, prepare_chunk, send_batch};
use super::pipeline::Pipeline;
use super::rollback::rollback;
use super::split::{PlainChunk, effective_chunk_size};
use crate::config::IngestConfig;
use crate::error::EngineError;

/// Parameters a client needs to drive an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadTicket {
    pub object_id: ObjectId,
    /// Plaintext bytes per chunk after clamping.
    pub chunk_size: u64,
    /// Chunks per message.
    pub batch_size: usize,
    /// Identities ready to send.
    pub pool_size: usize,
}

struct UploadSession {
    record: ObjectRecord,
    header: Option<ChunkedHeader>,
    stored: AtomicU32,
    /// Sequences accepted by `submit`, whether or not their send has returned.
    claimed: Mutex<HashSet<u32>>,
    cancel: CancellationToken,
    ledger: SentLedger,
    progress: ProgressSender<IngestProgress>,
}

impl UploadSession {
    /// Reserve the sequences of `chunks`. Nothing is reserved if any of
    /// them repeats an earlier submit or another chunk in the same call.
    fn claim(&self, chunks: &[PlainChunk]) -> Result<(), EngineError> {
        let mut claimed = self.claimed.lock();
        let mut batch = HashSet::with_capacity(chunks.len());
        for chunk in chunks {
            if claimed.contains(&chunk.sequence) || !batch.insert(chunk.sequence) {
                return Err(EngineError::DuplicateSequence {
                    object_id: self.record.id.clone(),
                    sequence: chunk.sequence,
                });
            }
        }
        claimed.extend(batch);
        Ok(())
    }

    fn emit(&self, stage: IngestStage) {
        self.progress.emit(IngestProgress::new(
            self.record.id.clone(),
            stage,
            self.stored.load(Ordering::SeqCst),
            self.record.expected_chunks(),
        ));
    }
}

struct IngestInner {
    pool: ConnectionPool,
    store: Arc<dyn MetadataStore>,
    codec: Option<ChunkCodec>,
    config: IngestConfig,
    sessions: DashMap<ObjectId, Arc<UploadSession>>,
}

/// Uploads objects as chunked messages and tracks open upload sessions.
///
/// A session opens with [`start`](Self::start), receives chunks through
/// [`submit`](Self::submit) and closes with [`finish`](Self::finish) or
/// [`cancel`](Self::cancel). Any failure along the way rolls the object
/// back: every message already created is deleted along with its metadata.
///
/// [`put`](Self::put) runs a whole upload from a byte source in one call.
#[derive(Clone)]
pub struct IngestService {
    inner: Arc<IngestInner>,
}

impl std::fmt::Debug for IngestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestService")
            .field("sessions", &self.inner.sessions.len())
            .field("encrypting", &self.encrypts())
            .finish_non_exhaustive()
    }
}

impl IngestService {
    pub fn new(
        pool: ConnectionPool,
        store: Arc<dyn MetadataStore>,
        codec: Option<ChunkCodec>,
        config: IngestConfig,
    ) -> Self {
        Self {
            inner: Arc::new(IngestInner {
                pool,
                store,
                codec,
                config,
                sessions: DashMap::new(),
            }),
        }
    }

    /// Whether new uploads are encrypted.
    pub fn encrypts(&self) -> bool {
        self.inner.config.encrypt && self.inner.codec.is_some()
    }

    /// Number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    pub async fn start(&self, meta: ObjectMeta) -> Result<UploadTicket, EngineError> {
        self.start_with_progress(meta, ProgressSender::disabled()).await
    }

    /// Open an upload session and insert the object row in `Uploading` state.
    #[instrument(skip_all, fields(name = %meta.name, size = meta.size))]
    pub async fn start_with_progress(
        &self,
        meta: ObjectMeta,
        progress: ProgressSender<IngestProgress>,
    ) -> Result<UploadTicket, EngineError> {
        let pool_size = self.inner.pool.connections()?.len();
        let chunk_size = effective_chunk_size(meta.chunk_size.unwrap_or(self.inner.config.chunk_size));

        let header = match &self.inner.codec {
            Some(codec) if self.inner.config.encrypt => Some(codec.new_header(chunk_size)),
            _ => None,
        };
        let object_id = ObjectId::generate();
        let mut record = ObjectRecord::from_meta(object_id.clone(), &meta, chunk_size);
        record.encryption = header
            .as_ref()
            .map(|h| EncryptionHeader::Chunked(h.clone()).to_json());
        self.inner.store.insert_object(&record).await?;

        let session = Arc::new(UploadSession {
            record,
            header,
            stored: AtomicU32::new(0),
            claimed: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            ledger: SentLedger::default(),
            progress,
        });
        session.emit(IngestStage::Encrypting);
        info!(
            object_id = %object_id,
            chunk_size,
            chunks = session.record.expected_chunks(),
            encrypted = session.header.is_some(),
            "upload started"
        );
        self.inner.sessions.insert(object_id.clone(), session);

        Ok(UploadTicket {
            object_id,
            chunk_size,
            batch_size: self.inner.config.effective_batch_size(),
            pool_size,
        })
    }

    /// Encrypt, send and persist a group of chunks. Returns how many were stored.
    ///
    /// Chunks may arrive in any order and across any number of calls, but
    /// each sequence only once. Malformed or repeated chunks are rejected
    /// before anything is sent and leave the session open; a failure after
    /// sending rolls the whole object back.
    #[instrument(skip_all, fields(object_id = %object_id, chunks = chunks.len()))]
    pub async fn submit(&self, object_id: &ObjectId, chunks: Vec<PlainChunk>) -> Result<u32, EngineError> {
        let session = self.session(object_id)?;
        if session.cancel.is_cancelled() {
            return Err(EngineError::Cancelled(object_id.clone()));
        }
        validate(&session.record, &chunks)?;
        session.claim(&chunks)?;

        match self.send_chunks(&session, chunks).await {
            Ok(stored) => {
                if session.cancel.is_cancelled() {
                    self.abort(&session).await;
                    return Err(EngineError::Cancelled(object_id.clone()));
                }
                Ok(stored)
            }
            Err(e) => {
                warn!(object_id = %object_id, error = %e, "upload failed, rolling back");
                self.abort(&session).await;
                Err(e)
            }
        }
    }

    async fn send_chunks(&self, session: &UploadSession, chunks: Vec<PlainChunk>) -> Result<u32, EngineError> {
        let object_id = &session.record.id;
        let encryption = self.encryption_for(session);
        let prepared = try_join_all(
            chunks
                .into_iter()
                .map(|chunk| prepare_chunk(object_id, encryption, chunk)),
        )
        .await?;
        session.emit(IngestStage::Uploading);

        let pool = &self.inner.pool;
        let store = self.inner.store.as_ref();
        let batches = into_batches(prepared, self.inner.config.effective_batch_size());
        let stored = pool
            .dispatch_parallel(batches, |conn, batch| async move {
                let rows = send_batch(pool, &conn, object_id, batch, &session.ledger).await?;
                store.insert_chunks(&rows).await?;
                let count = u32::try_from(rows.len()).unwrap_or(u32::MAX);
                session.stored.fetch_add(count, Ordering::SeqCst);
                session.emit(IngestStage::Uploading);
                Ok::<u32, EngineError>(count)
            })
            .await?;
        Ok(stored.into_iter().sum())
    }

    /// Validate the stored chunks and mark the object complete.
    ///
    /// An incomplete object is rolled back.
    #[instrument(skip_all, fields(object_id = %object_id))]
    pub async fn finish(&self, object_id: &ObjectId) -> Result<ObjectRecord, EngineError> {
        let session = self.session(object_id)?;
        if session.cancel.is_cancelled() {
            return Err(EngineError::Cancelled(object_id.clone()));
        }
        session.emit(IngestStage::Finalizing);

        let chunks = match self.inner.store.get_chunks(object_id).await {
            Ok(chunks) => chunks,
            Err(e) => {
                self.abort(&session).await;
                return Err(e.into());
            }
        };
        let expected = session.record.expected_chunks();
        if !complete(&chunks, expected) {
            let found = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
            warn!(object_id = %object_id, expected, found, "finishing an incomplete object");
            self.abort(&session).await;
            return Err(EngineError::Incomplete {
                object_id: object_id.clone(),
                expected,
                found,
            });
        }

        let mut record = session.record.clone();
        record.chunk_count = expected;
        record.status = ObjectStatus::Complete;
        record.updated_at = Utc::now();
        if let Err(e) = self.inner.store.update_object(&record).await {
            self.abort(&session).await;
            return Err(e.into());
        }
        self.inner.sessions.remove(object_id);
        session.emit(IngestStage::Done);
        info!(
            object_id = %object_id,
            chunks = expected,
            messages = session.ledger.len(),
            "upload complete"
        );
        Ok(record)
    }

    /// Abandon an upload and delete everything it created.
    ///
    /// A `submit` still in flight notices the cancellation when its sends
    /// return and cleans up whatever they added.
    #[instrument(skip_all, fields(object_id = %object_id))]
    pub async fn cancel(&self, object_id: &ObjectId) -> Result<DeleteReport, EngineError> {
        let session = self.session(object_id)?;
        session.cancel.cancel();
        info!(object_id = %object_id, "upload cancelled");
        Ok(self.abort(&session).await)
    }

    /// Upload a whole object from `reader` through the adaptive pipeline.
    pub async fn put<R>(&self, meta: ObjectMeta, reader: R) -> Result<ObjectRecord, EngineError>
    where
        R: AsyncRead + Unpin,
    {
        self.put_with_progress(meta, reader, ProgressSender::disabled()).await
    }

    #[instrument(skip_all, fields(name = %meta.name, size = meta.size))]
    pub async fn put_with_progress<R>(
        &self,
        meta: ObjectMeta,
        reader: R,
        progress: ProgressSender<IngestProgress>,
    ) -> Result<ObjectRecord, EngineError>
    where
        R: AsyncRead + Unpin,
    {
        let ticket = self.start_with_progress(meta, progress).await?;
        let session = self.session(&ticket.object_id)?;

        let pipeline = Pipeline {
            pool: &self.inner.pool,
            store: self.inner.store.as_ref(),
            object_id: &ticket.object_id,
            encryption: self.encryption_for(&session),
            ledger: &session.ledger,
            cancel: &session.cancel,
            progress: &session.progress,
            config: &self.inner.config,
            expected_chunks: session.record.expected_chunks(),
        };
        match pipeline.run(reader, ticket.chunk_size).await {
            Ok(stored) => {
                session.stored.store(stored, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(object_id = %ticket.object_id, error = %e, "upload failed, rolling back");
                self.abort(&session).await;
                return Err(e);
            }
        }
        self.finish(&ticket.object_id).await
    }

    /// Delete a stored object: its messages, chunk rows and object row.
    #[instrument(skip_all, fields(object_id = %object_id))]
    pub async fn delete_object(&self, object_id: &ObjectId) -> Result<DeleteReport, EngineError> {
        if self.inner.store.get_object(object_id).await?.is_none() {
            return Err(EngineError::ObjectNotFound(object_id.clone()));
        }
        if let Some((_, session)) = self.inner.sessions.remove(object_id) {
            session.cancel.cancel();
        }
        let chunks = self.inner.store.get_chunks(object_id).await?;
        let refs = dedup_refs(&chunks);
        let report = self.inner.pool.bulk_delete(&refs).await;
        self.inner.store.delete_chunks(object_id).await?;
        self.inner.store.delete_object(object_id).await?;
        info!(
            object_id = %object_id,
            deleted = report.deleted,
            already_gone = report.already_gone,
            failed = report.failed.len(),
            "object deleted"
        );
        Ok(report)
    }

    fn session(&self, object_id: &ObjectId) -> Result<Arc<UploadSession>, EngineError> {
        self.inner
            .sessions
            .get(object_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| EngineError::SessionNotFound(object_id.clone()))
    }

    fn encryption_for<'a>(&'a self, session: &'a UploadSession) -> Option<(&'a ChunkCodec, &'a ChunkedHeader)> {
        self.inner.codec.as_ref().zip(session.header.as_ref())
    }

    async fn abort(&self, session: &UploadSession) -> DeleteReport {
        let object_id = &session.record.id;
        self.inner.sessions.remove(object_id);
        rollback(
            &self.inner.pool,
            self.inner.store.as_ref(),
            object_id,
            session.ledger.snapshot(),
        )
        .await
    }
}

fn validate(record: &ObjectRecord, chunks: &[PlainChunk]) -> Result<(), EngineError> {
    let expected = record.expected_chunks();
    for chunk in chunks {
        if chunk.sequence == 0 || chunk.sequence > expected {
            return Err(EngineError::SequenceOutOfRange {
                object_id: record.id.clone(),
                sequence: chunk.sequence,
                expected,
            });
        }
        let size = chunk.data.len() as u64;
        if size > record.chunk_size {
            return Err(EngineError::ChunkTooLarge {
                sequence: chunk.sequence,
                size,
                limit: record.chunk_size,
            });
        }
    }
    Ok(())
}

fn complete(chunks: &[ChunkRecord], expected: u32) -> bool {
    usize::try_from(expected).is_ok_and(|n| n == chunks.len()) && is_contiguous(chunks)
}

fn dedup_refs(chunks: &[ChunkRecord]) -> Vec<MessageRef> {
    let mut refs: Vec<_> = chunks.iter().map(ChunkRecord::message_ref).collect();
    refs.sort_by(|a, b| (&a.channel_id, &a.message_id).cmp(&(&b.channel_id, &b.message_id)));
    refs.dedup();
    refs
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chatvault_core::progress_channel;
    use chatvault_crypto::{CodecConfig, SecretString};
    use chatvault_platform::{BotCredential, MockPlatform};
    use chatvault_pool::PoolConfig;
    use chatvault_state_memory::MemoryMetadataStore;

    use super::*;
    use crate::ingest::split::split_bytes;

    async fn service(platform: &MockPlatform, codec: Option<ChunkCodec>) -> (IngestService, Arc<MemoryMetadataStore>) {
        let pool = ConnectionPool::init(
            Arc::new(platform.clone()),
            vec![BotCredential::new("t1"), BotCredential::new("t2")],
            PoolConfig::new(["c1"]).with_login_delay(Duration::ZERO),
        )
        .await
        .unwrap();
        let store = Arc::new(MemoryMetadataStore::new());
        let config = IngestConfig::default().with_batch_size(2);
        let service = IngestService::new(pool, store.clone(), codec, config);
        (service, store)
    }

    fn codec() -> ChunkCodec {
        ChunkCodec::new(
            SecretString::new("hunter2".to_owned()),
            CodecConfig::default().with_pbkdf2_iterations(1_000),
        )
    }

    #[tokio::test]
    async fn session_lifecycle_stores_a_complete_object() {
        let platform = MockPlatform::new(["c1"]);
        let (service, store) = service(&platform, None).await;
        let data = Bytes::from(vec![3u8; 250]);
        let ticket = service
            .start(ObjectMeta::new("a.bin", 250, "me").with_chunk_size(100))
            .await
            .unwrap();
        assert_eq!(ticket.chunk_size, 100);
        assert_eq!(ticket.batch_size, 2);
        assert_eq!(ticket.pool_size, 2);

        let mut chunks = split_bytes(&data, ticket.chunk_size);
        let last = chunks.split_off(2);
        assert_eq!(service.submit(&ticket.object_id, last).await.unwrap(), 1);
        assert_eq!(service.submit(&ticket.object_id, chunks).await.unwrap(), 2);

        let record = service.finish(&ticket.object_id).await.unwrap();
        assert_eq!(record.status, ObjectStatus::Complete);
        assert_eq!(record.chunk_count, 3);
        assert!(record.encryption.is_none());
        assert_eq!(store.get_object(&ticket.object_id).await.unwrap(), Some(record));
        assert_eq!(service.active_sessions(), 0);
    }

    #[tokio::test]
    async fn encrypted_rows_carry_iv_and_tag() {
        let platform = MockPlatform::new(["c1"]);
        let (service, store) = service(&platform, Some(codec())).await;
        let ticket = service
            .start(ObjectMeta::new("a.bin", 10, "me").with_chunk_size(100))
            .await
            .unwrap();
        service
            .submit(&ticket.object_id, vec![PlainChunk::new(1, vec![1u8; 10])])
            .await
            .unwrap();
        let record = service.finish(&ticket.object_id).await.unwrap();
        assert!(record.is_encrypted());

        let chunks = store.get_chunks(&ticket.object_id).await.unwrap();
        assert_eq!(chunks[0].plain_size, 10);
        assert_eq!(chunks[0].size, 10 + 16);
        assert!(chunks[0].iv.is_some());
        assert!(chunks[0].tag.is_some());
    }

    #[tokio::test]
    async fn out_of_range_chunks_are_rejected_without_rollback() {
        let platform = MockPlatform::new(["c1"]);
        let (service, _store) = service(&platform, None).await;
        let ticket = service
            .start(ObjectMeta::new("a.bin", 100, "me").with_chunk_size(100))
            .await
            .unwrap();
        let err = service
            .submit(&ticket.object_id, vec![PlainChunk::new(2, vec![0u8; 5])])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SequenceOutOfRange { sequence: 2, expected: 1, .. }));
        let err = service
            .submit(&ticket.object_id, vec![PlainChunk::new(1, vec![0u8; 101])])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ChunkTooLarge { size: 101, .. }));
        assert_eq!(service.active_sessions(), 1);
        assert_eq!(platform.send_count(), 0);
    }

    #[tokio::test]
    async fn repeated_sequences_are_rejected_before_sending() {
        let platform = MockPlatform::new(["c1"]);
        let (service, store) = service(&platform, None).await;
        let ticket = service
            .start(ObjectMeta::new("a.bin", 8, "me").with_chunk_size(4))
            .await
            .unwrap();
        service
            .submit(&ticket.object_id, vec![PlainChunk::new(1, vec![1u8; 4])])
            .await
            .unwrap();
        let err = service
            .submit(&ticket.object_id, vec![PlainChunk::new(1, vec![2u8; 4])])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateSequence { sequence: 1, .. }));
        let err = service
            .submit(
                &ticket.object_id,
                vec![PlainChunk::new(2, vec![3u8; 4]), PlainChunk::new(2, vec![4u8; 4])],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateSequence { sequence: 2, .. }));
        assert_eq!(platform.message_count(), 1);

        // The rejected call reserved nothing, so sequence 2 is still open.
        service
            .submit(&ticket.object_id, vec![PlainChunk::new(2, vec![3u8; 4])])
            .await
            .unwrap();
        let record = service.finish(&ticket.object_id).await.unwrap();
        let rows = store.get_chunks(&record.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(platform.message_count(), 2);
        let mut referenced: Vec<_> = rows.iter().map(|r| r.message_id.clone()).collect();
        referenced.sort();
        let mut remote = platform.message_ids();
        remote.sort();
        assert_eq!(referenced, remote);
    }

    #[tokio::test]
    async fn finishing_with_missing_chunks_rolls_back() {
        let platform = MockPlatform::new(["c1"]);
        let (service, store) = service(&platform, None).await;
        let ticket = service
            .start(ObjectMeta::new("a.bin", 300, "me").with_chunk_size(100))
            .await
            .unwrap();
        service
            .submit(&ticket.object_id, vec![PlainChunk::new(1, vec![0u8; 100])])
            .await
            .unwrap();
        let err = service.finish(&ticket.object_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Incomplete { expected: 3, found: 1, .. }));
        assert_eq!(platform.message_count(), 0);
        assert!(store.get_object(&ticket.object_id).await.unwrap().is_none());
        assert!(store.get_chunks(&ticket.object_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_sessions_are_reported() {
        let platform = MockPlatform::new(["c1"]);
        let (service, _store) = service(&platform, None).await;
        let id = ObjectId::new("nope");
        assert!(matches!(
            service.finish(&id).await.unwrap_err(),
            EngineError::SessionNotFound(_)
        ));
        assert!(matches!(
            service.cancel(&id).await.unwrap_err(),
            EngineError::SessionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn put_emits_stages_in_order() {
        let platform = MockPlatform::new(["c1"]);
        let (service, store) = service(&platform, Some(codec())).await;
        let (progress, mut rx) = progress_channel();
        let data = vec![5u8; 350];
        let record = service
            .put_with_progress(
                ObjectMeta::new("b.bin", 350, "me").with_chunk_size(100),
                &data[..],
                progress,
            )
            .await
            .unwrap();
        assert_eq!(record.chunk_count, 4);
        assert_eq!(store.get_chunks(&record.id).await.unwrap().len(), 4);

        let mut stages = Vec::new();
        while let Ok(p) = rx.try_recv() {
            if stages.last() != Some(&p.stage) {
                stages.push(p.stage);
            }
        }
        assert_eq!(
            stages,
            vec![
                IngestStage::Encrypting,
                IngestStage::Uploading,
                IngestStage::Finalizing,
                IngestStage::Done
            ]
        );
    }

    #[tokio::test]
    async fn delete_object_removes_messages_and_rows() {
        let platform = MockPlatform::new(["c1"]);
        let (service, store) = service(&platform, None).await;
        let data = vec![1u8; 500];
        let record = service
            .put(ObjectMeta::new("c.bin", 500, "me").with_chunk_size(100), &data[..])
            .await
            .unwrap();
        let sent = platform.message_count();
        assert!(sent >= 3);

        let report = service.delete_object(&record.id).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.deleted, sent);
        assert_eq!(platform.message_count(), 0);
        assert!(store.get_object(&record.id).await.unwrap().is_none());
        assert!(matches!(
            service.delete_object(&record.id).await.unwrap_err(),
            EngineError::ObjectNotFound(_)
        ));
    }
}
