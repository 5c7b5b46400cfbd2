use bytes::Bytes;
use chatvault_core::{ChunkRecord, MessageRef, ObjectId, chunk_file_name};
use chatvault_crypto::{ChunkCodec, ChunkedHeader, encode_stored_bytes};
use chatvault_platform::OutgoingFile;
use chatvault_pool::{BotConnection, ConnectionPool};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::split::PlainChunk;
use crate::error::EngineError;

/// A chunk ready to upload: named, and encrypted if the object is.
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub sequence: u32,
    pub file_name: String,
    pub data: Bytes,
    pub plain_size: u64,
    pub iv: Option<Vec<u8>>,
    pub tag: Option<Vec<u8>>,
}

/// Name and, when `encryption` is set, encrypt one chunk.
pub async fn prepare_chunk(
    object_id: &ObjectId,
    encryption: Option<(&ChunkCodec, &ChunkedHeader)>,
    chunk: PlainChunk,
) -> Result<PreparedChunk, EngineError> {
    let file_name = chunk_file_name(object_id, chunk.sequence);
    let plain_size = chunk.data.len() as u64;
    match encryption {
        Some((codec, header)) => {
            let sealed = codec
                .encrypt(header, chunk.data)
                .await
                .map_err(|e| e.for_chunk(chunk.sequence))?;
            Ok(PreparedChunk {
                sequence: chunk.sequence,
                file_name,
                data: Bytes::from(sealed.data),
                plain_size,
                iv: Some(sealed.iv),
                tag: Some(sealed.tag),
            })
        }
        None => Ok(PreparedChunk {
            sequence: chunk.sequence,
            file_name,
            data: chunk.data,
            plain_size,
            iv: None,
            tag: None,
        }),
    }
}

/// Group chunks into per-message batches of at most `batch_size`, in sequence order.
pub fn into_batches(mut chunks: Vec<PreparedChunk>, batch_size: usize) -> Vec<Vec<PreparedChunk>> {
    chunks.sort_by_key(|c| c.sequence);
    let mut batches = Vec::with_capacity(chunks.len().div_ceil(batch_size.max(1)));
    let mut iter = chunks.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size.max(1)).collect());
    }
    batches
}

/// Every message created for one object, whether or not its chunks were stored.
#[derive(Debug, Default)]
pub struct SentLedger {
    messages: Mutex<Vec<MessageRef>>,
}

impl SentLedger {
    pub fn record(&self, message: MessageRef) {
        self.messages.lock().push(message);
    }

    pub fn snapshot(&self) -> Vec<MessageRef> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

/// Upload one batch as a single message on `conn` and build its chunk rows.
///
/// The message is recorded in `ledger` as soon as it exists. Returned
/// attachments are matched to the batch by position; any count mismatch
/// fails the batch.
pub async fn send_batch(
    pool: &ConnectionPool,
    conn: &BotConnection,
    object_id: &ObjectId,
    batch: Vec<PreparedChunk>,
    ledger: &SentLedger,
) -> Result<Vec<ChunkRecord>, EngineError> {
    let files = batch
        .iter()
        .map(|c| OutgoingFile::new(c.file_name.clone(), c.data.clone()))
        .collect();
    let message = pool.send_on(conn, files).await?;
    ledger.record(MessageRef::new(message.channel_id.clone(), message.id.clone()));

    if message.attachments.len() != batch.len() {
        warn!(
            message_id = %message.id,
            sent = batch.len(),
            received = message.attachments.len(),
            "attachment count mismatch"
        );
        return Err(EngineError::AttachmentCountMismatch {
            message_id: message.id,
            sent: batch.len(),
            received: message.attachments.len(),
        });
    }

    let rows = batch
        .into_iter()
        .zip(&message.attachments)
        .zip(0u32..)
        .map(|((chunk, attachment), index)| {
            if attachment.filename != chunk.file_name {
                debug!(
                    sent = %chunk.file_name,
                    stored = %attachment.filename,
                    "platform renamed attachment"
                );
            }
            ChunkRecord {
                object_id: object_id.clone(),
                sequence: chunk.sequence,
                message_id: message.id.clone(),
                channel_id: message.channel_id.clone(),
                attachment_index: index,
                url: attachment.url.clone(),
                size: chunk.data.len() as u64,
                plain_size: chunk.plain_size,
                iv: chunk.iv.as_deref().map(encode_stored_bytes),
                tag: chunk.tag.as_deref().map(encode_stored_bytes),
                url_refreshed_at: None,
            }
        })
        .collect();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chatvault_platform::{BotCredential, MockPlatform};
    use chatvault_pool::PoolConfig;

    use super::*;

    fn prepared(sequence: u32) -> PreparedChunk {
        PreparedChunk {
            sequence,
            file_name: format!("o.part{sequence}"),
            data: Bytes::from(vec![sequence as u8; 4]),
            plain_size: 4,
            iv: None,
            tag: None,
        }
    }

    async fn pool(platform: &MockPlatform) -> ConnectionPool {
        ConnectionPool::init(
            Arc::new(platform.clone()),
            vec![BotCredential::new("t1")],
            PoolConfig::new(["c1"]).with_login_delay(Duration::ZERO),
        )
        .await
        .unwrap()
    }

    #[test]
    fn batches_respect_size_and_order() {
        let chunks = vec![prepared(3), prepared(1), prepared(2), prepared(5), prepared(4)];
        let sequences: Vec<Vec<u32>> = into_batches(chunks, 2)
            .iter()
            .map(|b| b.iter().map(|c| c.sequence).collect())
            .collect();
        assert_eq!(sequences, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test]
    async fn rows_are_matched_by_position() {
        let platform = MockPlatform::new(["c1"]);
        let pool = pool(&platform).await;
        let conn = pool.select().unwrap();
        let ledger = SentLedger::default();

        let rows = send_batch(&pool, &conn, &ObjectId::new("o"), vec![prepared(1), prepared(2)], &ledger)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].sequence, 2);
        assert_eq!(rows[1].attachment_index, 1);
        assert!(rows[1].url.contains("o.part2"));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn count_mismatch_fails_but_records_the_message() {
        let platform = MockPlatform::new(["c1"]);
        platform.drop_attachments_on_next_send(1);
        let pool = pool(&platform).await;
        let conn = pool.select().unwrap();
        let ledger = SentLedger::default();

        let err = send_batch(&pool, &conn, &ObjectId::new("o"), vec![prepared(1), prepared(2)], &ledger)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::AttachmentCountMismatch { sent: 2, received: 1, .. }
        ));
        assert_eq!(ledger.len(), 1);
    }
}
