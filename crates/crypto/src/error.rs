use thiserror::Error;

/// Errors raised by key derivation, chunk encryption and header parsing.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key derivation failed or the derived key could not be used.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The encryption header is malformed or uses an unknown format.
    #[error("invalid encryption header: {0}")]
    InvalidHeader(String),

    /// A chunk's IV does not have the length the header declares.
    #[error("IV length mismatch: expected {expected} bytes, got {actual}")]
    IvLengthMismatch {
        /// Length declared by the header.
        expected: usize,
        /// Length found on the chunk.
        actual: usize,
    },

    /// Ciphertext is shorter than the authentication tag.
    #[error("ciphertext truncated: {0} bytes")]
    Truncated(usize),

    /// AEAD authentication failed: wrong key or corrupted data.
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// A chunk in an ordered sequence failed to decrypt.
    #[error("chunk {sequence}: {source}")]
    Chunk {
        /// 1-based sequence number of the failing chunk.
        sequence: u32,
        /// Underlying failure.
        #[source]
        source: Box<CryptoError>,
    },

    /// The CPU worker pool could not run the job.
    #[error("crypto worker failed: {0}")]
    Worker(String),
}

impl CryptoError {
    /// Attach a chunk sequence number to this error.
    #[must_use]
    pub fn for_chunk(self, sequence: u32) -> Self {
        match self {
            already @ Self::Chunk { .. } => already,
            other => Self::Chunk {
                sequence,
                source: Box::new(other),
            },
        }
    }
}
