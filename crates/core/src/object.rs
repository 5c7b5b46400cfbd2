use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ObjectId;

/// Caller-supplied description of an object about to be ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Logical file name.
    pub name: String,

    /// Optional folder the object is filed under.
    #[serde(default)]
    pub folder: Option<String>,

    /// Declared plaintext size in bytes.
    pub size: u64,

    /// MIME type reported by the uploader.
    #[serde(default = "default_mime_type")]
    pub mime_type: String,

    /// Owner of the object.
    pub owner: String,

    /// Requested chunk size. Clamped by the ingest pipeline.
    #[serde(default)]
    pub chunk_size: Option<u64>,

    /// Versioned encryption header (JSON) when the object is encrypted.
    #[serde(default)]
    pub encryption: Option<String>,
}

fn default_mime_type() -> String {
    "application/octet-stream".to_owned()
}

impl ObjectMeta {
    /// Describe a plaintext object of `size` bytes.
    pub fn new(name: impl Into<String>, size: u64, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            folder: None,
            size,
            mime_type: default_mime_type(),
            owner: owner.into(),
            chunk_size: None,
            encryption: None,
        }
    }

    /// Set the folder.
    #[must_use]
    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Set the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Request a specific chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Attach an encryption header.
    #[must_use]
    pub fn with_encryption(mut self, header_json: impl Into<String>) -> Self {
        self.encryption = Some(header_json.into());
        self
    }
}

/// Lifecycle state of an object row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    /// Chunks are still being appended.
    Uploading,
    /// All chunks are stored and contiguous.
    Complete,
}

/// A logical file composed of ordered chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Object identifier.
    pub id: ObjectId,
    /// Logical file name.
    pub name: String,
    /// Optional folder.
    pub folder: Option<String>,
    /// Total plaintext size in bytes.
    pub size: u64,
    /// MIME type.
    pub mime_type: String,
    /// Number of chunks once finalized (0 while uploading).
    pub chunk_count: u32,
    /// Plaintext bytes per chunk (the last chunk may be shorter).
    pub chunk_size: u64,
    /// Encryption header JSON, `None` for plaintext objects.
    pub encryption: Option<String>,
    /// Owner.
    pub owner: String,
    /// Lifecycle state.
    pub status: ObjectStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    /// Build a fresh `Uploading` record from caller metadata.
    pub fn from_meta(id: ObjectId, meta: &ObjectMeta, chunk_size: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: meta.name.clone(),
            folder: meta.folder.clone(),
            size: meta.size,
            mime_type: meta.mime_type.clone(),
            chunk_count: 0,
            chunk_size,
            encryption: meta.encryption.clone(),
            owner: meta.owner.clone(),
            status: ObjectStatus::Uploading,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of chunks the declared size splits into.
    pub fn expected_chunks(&self) -> u32 {
        expected_chunk_count(self.size, self.chunk_size)
    }

    /// Whether the object carries an encryption header.
    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }
}

/// `ceil(size / chunk_size)`, with an empty object still occupying one chunk.
pub fn expected_chunk_count(size: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 || size == 0 {
        return 1;
    }
    u32::try_from(size.div_ceil(chunk_size)).unwrap_or(u32::MAX)
}
