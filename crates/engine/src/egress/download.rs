use std::sync::Arc;

use chatvault_core::{ChunkRecord, EgressProgress, ObjectId, ObjectRecord, ProgressSender, is_contiguous};
use chatvault_crypto::{ChunkCodec, ChunkedHeader, EncryptionHeader, SealedPart};
use chatvault_platform::CdnClient;
use chatvault_pool::ConnectionPool;
use chatvault_state::MetadataStore;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::decrypt::{ChunkSpan, chunk_spans};
use super::fetch::fetch_to_offset;
use super::resolver::UrlResolver;
use super::sink::Spool;
use crate::config::EgressConfig;
use crate::error::EngineError;

/// Outcome of a whole-object download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub object_id: ObjectId,
    /// Plaintext bytes written.
    pub bytes: u64,
    pub chunks: usize,
    /// Some chunks were fetched from cached, possibly stale URLs.
    pub degraded: bool,
}

/// Reassembles stored objects: resolve URLs, fetch by offset, decrypt.
#[derive(Clone)]
pub struct Downloader {
    store: Arc<dyn MetadataStore>,
    cdn: Arc<dyn CdnClient>,
    codec: Option<ChunkCodec>,
    resolver: UrlResolver,
    config: EgressConfig,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("config", &self.config)
            .field("decrypts", &self.codec.is_some())
            .finish_non_exhaustive()
    }
}

impl Downloader {
    pub fn new(
        pool: ConnectionPool,
        store: Arc<dyn MetadataStore>,
        cdn: Arc<dyn CdnClient>,
        codec: Option<ChunkCodec>,
        config: EgressConfig,
    ) -> Self {
        let resolver = UrlResolver::new(pool, Arc::clone(&store), config.resolve_concurrency);
        Self {
            store,
            cdn,
            codec,
            resolver,
            config,
        }
    }

    pub fn resolver(&self) -> &UrlResolver {
        &self.resolver
    }

    /// Write the plaintext of `object_id` to `writer`.
    ///
    /// The chunk rows must be complete and contiguous. Nothing is written
    /// to `writer` until every chunk has been fetched, so a failed or
    /// cancelled download leaves it untouched. Ciphertext is reassembled in
    /// memory up to `memory_limit` bytes and in a temporary file beyond
    /// that. Chunks are then decrypted one at a time on the codec's CPU
    /// pool. Legacy objects are a single AEAD stream and are always opened
    /// whole in memory.
    #[instrument(skip_all, fields(object_id = %object_id))]
    pub async fn download<W>(
        &self,
        object_id: &ObjectId,
        writer: &mut W,
        cancel: &CancellationToken,
        progress: &ProgressSender<EgressProgress>,
    ) -> Result<DownloadReport, EngineError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let record = self
            .store
            .get_object(object_id)
            .await?
            .ok_or_else(|| EngineError::ObjectNotFound(object_id.clone()))?;
        let chunks = self.store.get_chunks(object_id).await?;
        check_complete(&record, &chunks)?;

        let header = record
            .encryption
            .as_deref()
            .map(EncryptionHeader::parse)
            .transpose()?;
        let codec = match (&header, &self.codec) {
            (None, _) => None,
            (Some(_), Some(codec)) => Some(codec),
            (Some(_), None) => return Err(EngineError::KeyRequired(object_id.clone())),
        };

        let resolution = self.resolver.resolve(chunks).await;
        let total: u64 = resolution.chunks.iter().map(|c| c.size).sum();
        let spool = Spool::new(total, self.config.memory_limit).await?;
        if spool.is_file() {
            debug!(object_id = %object_id, bytes = total, "spooling ciphertext to a temporary file");
        }
        let fetched = fetch_to_offset(
            self.cdn.as_ref(),
            &resolution.chunks,
            spool.sink(),
            &self.config,
            cancel,
            progress,
        )
        .await?;
        let spans = chunk_spans(&resolution.chunks, total)?;

        let bytes = match (header, codec) {
            (Some(EncryptionHeader::Chunked(header)), Some(codec)) => {
                write_decrypted(codec, &header, &spool, spans, writer).await?
            }
            (Some(EncryptionHeader::Legacy { pbkdf2_iterations }), Some(codec)) => {
                let stream = spool.read_at(0, total).await?;
                let plain = codec.decrypt_legacy(pbkdf2_iterations, stream).await?;
                writer.write_all(&plain).await?;
                plain.len() as u64
            }
            _ => {
                let mut written = 0u64;
                for span in spans {
                    let data = spool.read_at(span.offset, span.len).await?;
                    writer.write_all(&data).await?;
                    written += span.len;
                }
                written
            }
        };
        writer.flush().await?;

        info!(
            object_id = %object_id,
            bytes,
            chunks = fetched.chunks,
            degraded = resolution.degraded,
            "object downloaded"
        );
        Ok(DownloadReport {
            object_id: object_id.clone(),
            bytes,
            chunks: fetched.chunks,
            degraded: resolution.degraded,
        })
    }
}

/// Decrypt spooled chunks in sequence order, one CPU-pool job per chunk.
async fn write_decrypted<W>(
    codec: &ChunkCodec,
    header: &ChunkedHeader,
    spool: &Spool,
    spans: Vec<ChunkSpan>,
    writer: &mut W,
) -> Result<u64, EngineError>
where
    W: AsyncWrite + Unpin + Send,
{
    // Derived once here; every chunk below hits the key cache.
    codec.key_for(header).await?;
    let mut written = 0u64;
    for span in spans {
        let data = spool.read_at(span.offset, span.len).await?;
        let part = SealedPart {
            sequence: span.sequence,
            iv: span.iv,
            data,
        };
        let plain = codec.decrypt_one(header, part).await?;
        writer.write_all(&plain).await?;
        written += plain.len() as u64;
    }
    Ok(written)
}

fn check_complete(record: &ObjectRecord, chunks: &[ChunkRecord]) -> Result<(), EngineError> {
    let expected = match record.chunk_count {
        0 => record.expected_chunks(),
        n => n,
    };
    let found = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
    if found != expected || !is_contiguous(chunks) {
        return Err(EngineError::Incomplete {
            object_id: record.id.clone(),
            expected,
            found,
        });
    }
    Ok(())
}
