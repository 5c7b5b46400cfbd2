//! Chunk encryption for chatvault.
//!
//! Objects are encrypted with AES-256-GCM under a key derived from the vault
//! password with PBKDF2-HMAC-SHA256. Two layouts exist:
//!
//! - **chunked**: every chunk is sealed independently with its own random IV;
//!   each upload is `ciphertext || tag`. The object's header records the salt,
//!   IV tier, tag length, chunk size and KDF strength.
//! - **legacy**: the whole object is one AEAD stream prefixed by
//!   `salt(32) || iv(16) || tag(16)`.
//!
//! Derived keys and [`ChunkCodec`] never print their secrets.

pub mod cipher;
pub mod codec;
pub mod error;
pub mod flexible;
pub mod header;
pub mod kdf;
pub mod pool;

pub use cipher::{IvLength, SealedChunk, TAG_LEN, decrypt_chunk, encrypt_chunk};
pub use codec::{ChunkCodec, CodecConfig, DecryptedChunks, SealedPart};
pub use error::CryptoError;
pub use flexible::{decode_flexible_text, decode_stored_bytes, encode_stored_bytes};
pub use header::{
    CHUNKED_VERSION, ChunkedHeader, EncryptionHeader, LEGACY_PREFIX_LEN, LegacyPrefix,
};
pub use kdf::{DEFAULT_PBKDF2_ITERATIONS, DerivedKey, KeyCache, derive_key};
pub use pool::CpuPool;

// Re-export so consumers don't need a direct `secrecy` dependency.
pub use secrecy::{ExposeSecret, SecretString};
