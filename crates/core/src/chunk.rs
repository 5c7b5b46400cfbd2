use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, MessageId, ObjectId};

/// A byte field as it comes back from the metadata store.
///
/// Current writers always emit [`StoredBytes::Text`] holding base64. Older
/// rows carry the raw byte array, a serialized buffer object, or decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredBytes {
    /// A JSON array of byte values.
    Array(Vec<u8>),
    /// A serialized buffer object: `{"type":"Buffer","data":[..]}`.
    Buffer {
        /// Buffer contents.
        data: Vec<u8>,
    },
    /// Text: base64, a JSON array literal, or comma-separated decimals.
    Text(String),
}

impl StoredBytes {
    /// Wrap already-encoded text.
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

/// Durable identity of a remote message: the only thing that survives URL expiry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    /// Channel the message lives in.
    pub channel_id: ChannelId,
    /// Message snowflake.
    pub message_id: MessageId,
}

impl MessageRef {
    /// Build a reference from its parts.
    pub fn new(channel_id: impl Into<ChannelId>, message_id: impl Into<MessageId>) -> Self {
        Self {
            channel_id: channel_id.into(),
            message_id: message_id.into(),
        }
    }
}

/// One stored slice of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Owning object.
    pub object_id: ObjectId,
    /// 1-based sequence number.
    pub sequence: u32,
    /// Message that carries the attachment.
    pub message_id: MessageId,
    /// Channel the message was posted to.
    pub channel_id: ChannelId,
    /// Position of the attachment inside its message.
    #[serde(default)]
    pub attachment_index: u32,
    /// Last known download URL. Volatile: it expires and must be re-derived.
    pub url: String,
    /// Bytes stored remotely (ciphertext plus tag when encrypted).
    pub size: u64,
    /// Plaintext bytes this chunk decodes to.
    pub plain_size: u64,
    /// Per-chunk IV for chunked encryption.
    #[serde(default)]
    pub iv: Option<StoredBytes>,
    /// Per-chunk authentication tag for chunked encryption.
    #[serde(default)]
    pub tag: Option<StoredBytes>,
    /// When `url` was last refreshed from the origin message.
    #[serde(default)]
    pub url_refreshed_at: Option<DateTime<Utc>>,
}

impl ChunkRecord {
    /// Durable message reference of this chunk.
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            channel_id: self.channel_id.clone(),
            message_id: self.message_id.clone(),
        }
    }

    /// Attachment file name this chunk was uploaded under.
    pub fn file_name(&self) -> String {
        chunk_file_name(&self.object_id, self.sequence)
    }
}

/// Attachment file name for chunk `sequence` of `object_id`.
pub fn chunk_file_name(object_id: &ObjectId, sequence: u32) -> String {
    format!("{object_id}.part{sequence}")
}

/// Parse a name produced by [`chunk_file_name`] back into its sequence.
///
/// The platform may rewrite characters it dislikes, so only the trailing
/// `.part<n>` suffix is trusted.
pub fn parse_chunk_sequence(file_name: &str) -> Option<u32> {
    let (_, suffix) = file_name.rsplit_once(".part")?;
    suffix.parse().ok()
}

/// Byte offset of every chunk, computed from declared stored sizes.
///
/// `chunks` must be ordered by sequence.
pub fn chunk_offsets(chunks: &[ChunkRecord]) -> Vec<u64> {
    let mut offset = 0u64;
    chunks
        .iter()
        .map(|chunk| {
            let start = offset;
            offset += chunk.size;
            start
        })
        .collect()
}

/// Check that sequences run `1..=n` with no gaps or duplicates.
pub fn is_contiguous(chunks: &[ChunkRecord]) -> bool {
    let mut sequences: Vec<u32> = chunks.iter().map(|c| c.sequence).collect();
    sequences.sort_unstable();
    sequences
        .iter()
        .enumerate()
        .all(|(i, &seq)| usize::try_from(seq).is_ok_and(|s| s == i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(sequence: u32, size: u64) -> ChunkRecord {
        ChunkRecord {
            object_id: ObjectId::new("obj"),
            sequence,
            message_id: MessageId::new("m"),
            channel_id: ChannelId::new("c"),
            attachment_index: 0,
            url: String::new(),
            size,
            plain_size: size,
            iv: None,
            tag: None,
            url_refreshed_at: None,
        }
    }

    #[test]
    fn file_name_roundtrip() {
        let id = ObjectId::new("0190-abc");
        let name = chunk_file_name(&id, 12);
        assert_eq!(name, "0190-abc.part12");
        assert_eq!(parse_chunk_sequence(&name), Some(12));
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert_eq!(parse_chunk_sequence("image.png"), None);
        assert_eq!(parse_chunk_sequence("x.partial"), None);
    }

    #[test]
    fn offsets_are_prefix_sums() {
        let chunks = vec![chunk(1, 10), chunk(2, 10), chunk(3, 4)];
        assert_eq!(chunk_offsets(&chunks), vec![0, 10, 20]);
    }

    #[test]
    fn contiguity() {
        assert!(is_contiguous(&[chunk(2, 1), chunk(1, 1), chunk(3, 1)]));
        assert!(!is_contiguous(&[chunk(1, 1), chunk(3, 1)]));
        assert!(!is_contiguous(&[chunk(1, 1), chunk(1, 1)]));
        assert!(!is_contiguous(&[chunk(0, 1)]));
    }

    #[test]
    fn stored_bytes_accepts_every_shape() {
        let arr: StoredBytes = serde_json::from_str("[1,2,3]").unwrap();
        assert_eq!(arr, StoredBytes::Array(vec![1, 2, 3]));

        let buf: StoredBytes = serde_json::from_str(r#"{"type":"Buffer","data":[9]}"#).unwrap();
        assert_eq!(buf, StoredBytes::Buffer { data: vec![9] });

        let text: StoredBytes = serde_json::from_str(r#""AQID""#).unwrap();
        assert_eq!(text, StoredBytes::text("AQID"));
    }
}
