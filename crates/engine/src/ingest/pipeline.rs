use std::collections::VecDeque;
use std::future::Future;

use chatvault_core::{ChunkRecord, IngestProgress, IngestStage, ObjectId, ProgressSender};
use chatvault_crypto::{ChunkCodec, ChunkedHeader};
use chatvault_pool::ConnectionPool;
use chatvault_state::MetadataStore;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::controller::{AdaptiveController, Adjustment};
use super::dispatch::{PreparedChunk, SentLedger, prepare_chunk, send_batch};
use super::split::ChunkReader;
use crate::config::IngestConfig;
use crate::error::EngineError;

/// Everything one streaming upload needs, borrowed from its session.
pub(crate) struct Pipeline<'a> {
    pub pool: &'a ConnectionPool,
    pub store: &'a dyn MetadataStore,
    pub object_id: &'a ObjectId,
    pub encryption: Option<(&'a ChunkCodec, &'a ChunkedHeader)>,
    pub ledger: &'a SentLedger,
    pub cancel: &'a CancellationToken,
    pub progress: &'a ProgressSender<IngestProgress>,
    pub config: &'a IngestConfig,
    pub expected_chunks: u32,
}

impl Pipeline<'_> {
    /// Stream `reader` through encryption into concurrent sends.
    ///
    /// Encryption runs ahead of the senders into a bounded buffer. Each
    /// send takes up to one batch from the buffer. After every completion
    /// the adaptive controller sees the buffer occupancy and may change the
    /// number of concurrent sends and the encrypt-ahead depth.
    ///
    /// On error or cancellation no new work starts, sends already in flight
    /// finish so that every created message lands in the ledger, and then
    /// the error is returned. Rollback is the caller's job.
    #[instrument(skip_all, fields(object_id = %self.object_id))]
    pub async fn run<R>(&self, reader: R, chunk_size: u64) -> Result<u32, EngineError>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = ChunkReader::new(reader, chunk_size);
        let pool_size = self.pool.connections()?.len();
        let initial = match self.config.initial_concurrency {
            0 => pool_size,
            n => n,
        };
        let mut controller = AdaptiveController::new(
            initial,
            self.config.initial_buffer,
            pool_size,
            self.config.max_in_memory_chunks,
        );
        let batch_size = self.config.effective_batch_size();

        let mut encrypting = FuturesUnordered::new();
        let mut buffer: VecDeque<PreparedChunk> = VecDeque::new();
        let mut sending = FuturesUnordered::new();
        let mut source_done = false;
        let mut stored = 0u32;

        self.progress.emit(IngestProgress::new(
            self.object_id.clone(),
            IngestStage::Encrypting,
            0,
            self.expected_chunks,
        ));

        let outcome: Result<(), EngineError> = async {
            loop {
                if self.cancel.is_cancelled() {
                    return Err(EngineError::Cancelled(self.object_id.clone()));
                }

                while !source_done && buffer.len() + encrypting.len() < controller.buffer_target() {
                    match reader.next_chunk().await? {
                        Some(chunk) => encrypting.push(prepare_chunk(self.object_id, self.encryption, chunk)),
                        None => source_done = true,
                    }
                }

                let drained = source_done && encrypting.is_empty();
                let ready = batch_size.min(controller.buffer_target());
                while sending.len() < controller.concurrency()
                    && !buffer.is_empty()
                    && (buffer.len() >= ready || drained)
                {
                    let take = buffer.len().min(batch_size);
                    let batch: Vec<PreparedChunk> = buffer.drain(..take).collect();
                    let conn = self.pool.select()?;
                    let busy = conn.acquire();
                    sending.push(async move {
                        let _busy = busy;
                        let rows = send_batch(self.pool, &conn, self.object_id, batch, self.ledger).await?;
                        self.store.insert_chunks(&rows).await?;
                        Ok::<Vec<ChunkRecord>, EngineError>(rows)
                    });
                }

                if drained && buffer.is_empty() && sending.is_empty() {
                    return Ok(());
                }

                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        return Err(EngineError::Cancelled(self.object_id.clone()));
                    }
                    Some(sent) = sending.next(), if !sending.is_empty() => {
                        let rows = sent?;
                        stored += u32::try_from(rows.len()).unwrap_or(u32::MAX);
                        self.progress.emit(IngestProgress::new(
                            self.object_id.clone(),
                            IngestStage::Uploading,
                            stored,
                            self.expected_chunks,
                        ));
                    }
                    Some(prepared) = encrypting.next(), if !encrypting.is_empty() => {
                        buffer.push_back(prepared?);
                    }
                }

                match controller.tick(buffer.len()) {
                    Adjustment::None => {}
                    change => debug!(
                        ?change,
                        concurrency = controller.concurrency(),
                        buffer_target = controller.buffer_target(),
                        "adjusted upload parallelism"
                    ),
                }
            }
        }
        .await;

        if let Err(e) = outcome {
            debug!(in_flight = sending.len(), error = %e, "draining sends before failing");
            drain(&mut sending).await;
            return Err(e);
        }
        Ok(stored)
    }
}

async fn drain<F: Future>(set: &mut FuturesUnordered<F>) {
    while set.next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chatvault_core::progress_channel;
    use chatvault_platform::{BotCredential, MockPlatform};
    use chatvault_pool::PoolConfig;
    use chatvault_state_memory::MemoryMetadataStore;

    use super::*;

    async fn pool(platform: &MockPlatform, bots: usize) -> ConnectionPool {
        let credentials = (1..=bots).map(|i| BotCredential::new(format!("t{i}"))).collect();
        ConnectionPool::init(
            Arc::new(platform.clone()),
            credentials,
            PoolConfig::new(["c1"]).with_login_delay(Duration::ZERO),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn streams_every_chunk_and_stores_rows() {
        let platform = MockPlatform::new(["c1"]);
        let pool = pool(&platform, 2).await;
        let store = MemoryMetadataStore::new();
        let ledger = SentLedger::default();
        let cancel = CancellationToken::new();
        let (progress, mut rx) = progress_channel();
        let config = IngestConfig::default().with_batch_size(2);
        let object_id = ObjectId::new("obj");
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let pipeline = Pipeline {
            pool: &pool,
            store: &store,
            object_id: &object_id,
            encryption: None,
            ledger: &ledger,
            cancel: &cancel,
            progress: &progress,
            config: &config,
            expected_chunks: 10,
        };
        let stored = pipeline.run(&data[..], 100).await.unwrap();
        assert_eq!(stored, 10);

        let chunks = store.get_chunks(&object_id).await.unwrap();
        let sequences: Vec<u32> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, (1..=10).collect::<Vec<_>>());
        assert_eq!(ledger.len(), platform.message_count());

        drop(progress);
        let mut last = None;
        while let Some(p) = rx.recv().await {
            last = Some(p);
        }
        let last = last.unwrap();
        assert_eq!(last.stage, IngestStage::Uploading);
        assert_eq!(last.chunks_done, 10);
    }

    #[tokio::test]
    async fn send_failure_waits_for_siblings_and_keeps_the_ledger() {
        let platform = MockPlatform::new(["c1"]);
        let pool = pool(&platform, 2).await;
        platform.drop_attachments_on_next_send(1);
        let store = MemoryMetadataStore::new();
        let ledger = SentLedger::default();
        let cancel = CancellationToken::new();
        let progress = ProgressSender::disabled();
        let config = IngestConfig::default().with_batch_size(2);
        let object_id = ObjectId::new("obj");
        let data = vec![9u8; 400];

        let pipeline = Pipeline {
            pool: &pool,
            store: &store,
            object_id: &object_id,
            encryption: None,
            ledger: &ledger,
            cancel: &cancel,
            progress: &progress,
            config: &config,
            expected_chunks: 4,
        };
        let err = pipeline.run(&data[..], 100).await.unwrap_err();
        assert!(matches!(err, EngineError::AttachmentCountMismatch { .. }));
        assert_eq!(ledger.len(), platform.message_count());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_sending() {
        let platform = MockPlatform::new(["c1"]);
        let pool = pool(&platform, 1).await;
        let store = MemoryMetadataStore::new();
        let ledger = SentLedger::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let progress = ProgressSender::disabled();
        let config = IngestConfig::default();
        let object_id = ObjectId::new("obj");

        let pipeline = Pipeline {
            pool: &pool,
            store: &store,
            object_id: &object_id,
            encryption: None,
            ledger: &ledger,
            cancel: &cancel,
            progress: &progress,
            config: &config,
            expected_chunks: 1,
        };
        let err = pipeline.run(&b"abc"[..], 100).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(_)));
        assert_eq!(platform.send_count(), 0);
    }
}
