use std::collections::HashMap;
use std::sync::Arc;

use chatvault_core::{ChunkRecord, MessageRef};
use chatvault_platform::{Attachment, Message};
use chatvault_pool::{ConnectionPool, PoolError};
use chatvault_state::{ChunkUrlUpdate, MetadataStore};
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

/// Chunks with refreshed URLs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    /// The input chunks, in input order, with fresh URLs where available.
    pub chunks: Vec<ChunkRecord>,
    /// Positions in `chunks` that kept their cached URL because
    /// re-resolution failed.
    pub fallbacks: Vec<usize>,
    /// Set when any chunk fell back to its cached URL.
    pub degraded: bool,
}

/// Refreshes expiring attachment URLs from their origin messages.
#[derive(Clone)]
pub struct UrlResolver {
    pool: ConnectionPool,
    store: Arc<dyn MetadataStore>,
    concurrency: usize,
}

impl std::fmt::Debug for UrlResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlResolver")
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl UrlResolver {
    pub fn new(pool: ConnectionPool, store: Arc<dyn MetadataStore>, concurrency: usize) -> Self {
        Self {
            pool,
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Re-fetch each chunk's origin message and take the current URL.
    ///
    /// Every distinct message is fetched once. A chunk whose message cannot
    /// be fetched, or whose attachment cannot be matched, keeps its cached
    /// URL and is listed in [`Resolution::fallbacks`]; this never fails.
    /// Changed URLs are written back to the store.
    #[instrument(skip_all, fields(chunks = chunks.len()))]
    pub async fn resolve(&self, mut chunks: Vec<ChunkRecord>) -> Resolution {
        let mut groups: HashMap<MessageRef, Vec<usize>> = HashMap::new();
        for (i, chunk) in chunks.iter().enumerate() {
            groups.entry(chunk.message_ref()).or_default().push(i);
        }

        let fetched: Vec<(Vec<usize>, Result<Message, PoolError>)> = stream::iter(groups)
            .map(|(message, indices)| async move {
                let result = self
                    .pool
                    .fetch_message(&message.message_id, Some(&message.channel_id))
                    .await;
                (indices, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let now = Utc::now();
        let mut fallbacks = Vec::new();
        let mut updates = Vec::new();
        for (indices, result) in fetched {
            match result {
                Ok(message) => {
                    for i in indices {
                        let chunk = &mut chunks[i];
                        match match_attachment(&message, chunk) {
                            Some(attachment) => {
                                if attachment.url != chunk.url {
                                    chunk.url.clone_from(&attachment.url);
                                    chunk.url_refreshed_at = Some(now);
                                    updates.push(ChunkUrlUpdate {
                                        object_id: chunk.object_id.clone(),
                                        sequence: chunk.sequence,
                                        url: chunk.url.clone(),
                                        refreshed_at: now,
                                    });
                                }
                            }
                            None => {
                                debug!(sequence = chunk.sequence, message_id = %message.id, "no matching attachment");
                                fallbacks.push(i);
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, chunks = indices.len(), "origin message fetch failed, keeping cached URLs");
                    fallbacks.extend(indices);
                }
            }
        }

        if !updates.is_empty() {
            match self.store.update_chunk_urls(&updates).await {
                Ok(written) => debug!(written, "refreshed chunk URLs stored"),
                Err(e) => warn!(error = %e, "could not store refreshed URLs"),
            }
        }

        fallbacks.sort_unstable();
        let degraded = !fallbacks.is_empty();
        if degraded {
            info!(fallbacks = fallbacks.len(), "resolved with cached URL fallback");
        }
        Resolution {
            chunks,
            fallbacks,
            degraded,
        }
    }
}

/// Find a chunk's attachment by file name, or by its position when the
/// platform renamed the file.
pub(crate) fn match_attachment<'a>(message: &'a Message, chunk: &ChunkRecord) -> Option<&'a Attachment> {
    let name = chunk.file_name();
    message
        .attachments
        .iter()
        .find(|a| a.filename == name)
        .or_else(|| {
            usize::try_from(chunk.attachment_index)
                .ok()
                .and_then(|i| message.attachments.get(i))
        })
}
