use chatvault_core::{MessageId, ObjectId, ScanId};
use chatvault_crypto::CryptoError;
use chatvault_executor::{Classify, RetryClass};
use chatvault_platform::PlatformError;
use chatvault_pool::PoolError;
use chatvault_state::StateError;
use thiserror::Error;

/// Errors raised by the ingest, egress and scan pipelines.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("metadata store: {0}")]
    State(#[from] StateError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    #[error("no upload in progress for object {0}")]
    SessionNotFound(ObjectId),

    #[error("upload of object {0} was cancelled")]
    Cancelled(ObjectId),

    #[error("message {message_id} came back with {received} attachments, {sent} were sent")]
    AttachmentCountMismatch {
        message_id: MessageId,
        sent: usize,
        received: usize,
    },

    #[error("chunk {sequence} is outside object {object_id} (expects {expected} chunks)")]
    SequenceOutOfRange {
        object_id: ObjectId,
        sequence: u32,
        expected: u32,
    },

    #[error("chunk {sequence} of object {object_id} was already submitted")]
    DuplicateSequence { object_id: ObjectId, sequence: u32 },

    #[error("chunk {sequence} is {size} bytes, larger than the {limit} byte chunk size")]
    ChunkTooLarge { sequence: u32, size: u64, limit: u64 },

    #[error("object {object_id} is incomplete: {found} of {expected} chunks stored")]
    Incomplete {
        object_id: ObjectId,
        expected: u32,
        found: u32,
    },

    #[error("chunk {sequence} failed after {attempts} attempts: {source}")]
    ChunkFailed {
        sequence: u32,
        attempts: u32,
        #[source]
        source: PlatformError,
    },

    #[error("download cancelled")]
    DownloadCancelled,

    #[error("object {0} is encrypted but no password is configured")]
    KeyRequired(ObjectId),

    #[error("scan {0} not found")]
    ScanNotFound(ScanId),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    /// Returns `true` if a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.classify().is_retryable()
    }
}

impl Classify for EngineError {
    fn classify(&self) -> RetryClass {
        match self {
            Self::Pool(e) => e.classify(),
            Self::Platform(e) | Self::ChunkFailed { source: e, .. } => e.classify(),
            _ => RetryClass::Fatal,
        }
    }
}
