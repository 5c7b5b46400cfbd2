use std::fmt;
use std::iter::FusedIterator;
use std::time::Duration;

use bytes::Bytes;
use secrecy::SecretString;
use tracing::debug;

use crate::cipher::{self, IvLength, SealedChunk, TAG_LEN};
use crate::error::CryptoError;
use crate::header::{
    CHUNKED_VERSION, ChunkedHeader, EncryptionHeader, LEGACY_IV_LEN, LegacyPrefix,
};
use crate::kdf::{DEFAULT_PBKDF2_ITERATIONS, DerivedKey, KeyCache, SALT_LEN};
use crate::pool::CpuPool;

/// Codec tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    /// PBKDF2 iterations written into new headers.
    pub pbkdf2_iterations: u32,
    /// IV tier for new objects.
    pub iv_length: IvLength,
    /// How long a derived key stays cached.
    pub key_cache_ttl: Duration,
    /// Maximum number of cached keys.
    pub key_cache_capacity: u64,
    /// Concurrent CPU-bound jobs.
    pub workers: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            iv_length: IvLength::Twelve,
            key_cache_ttl: Duration::from_secs(30 * 60),
            key_cache_capacity: 256,
            workers: CpuPool::default().size(),
        }
    }
}

impl CodecConfig {
    /// Set the KDF strength for new objects.
    #[must_use]
    pub fn with_pbkdf2_iterations(mut self, iterations: u32) -> Self {
        self.pbkdf2_iterations = iterations;
        self
    }

    /// Set the IV tier for new objects.
    #[must_use]
    pub fn with_iv_length(mut self, iv_length: IvLength) -> Self {
        self.iv_length = iv_length;
        self
    }

    /// Set the key cache TTL.
    #[must_use]
    pub fn with_key_cache_ttl(mut self, ttl: Duration) -> Self {
        self.key_cache_ttl = ttl;
        self
    }

    /// Set the CPU worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

/// One stored chunk waiting to be decrypted.
#[derive(Debug, Clone)]
pub struct SealedPart {
    /// 1-based sequence number.
    pub sequence: u32,
    /// IV decoded from the chunk row.
    pub iv: Vec<u8>,
    /// Downloaded `ciphertext || tag`.
    pub data: Bytes,
}

/// Encrypts and decrypts object chunks under one vault password.
#[derive(Clone)]
pub struct ChunkCodec {
    config: CodecConfig,
    keys: KeyCache,
    cpu: CpuPool,
}

impl fmt::Debug for ChunkCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCodec")
            .field("config", &self.config)
            .field("password", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl ChunkCodec {
    /// Create a codec for `password`.
    pub fn new(password: SecretString, config: CodecConfig) -> Self {
        let cpu = CpuPool::new(config.workers);
        let keys = KeyCache::new(
            password,
            config.key_cache_ttl,
            config.key_cache_capacity,
            cpu.clone(),
        );
        Self { config, keys, cpu }
    }

    /// The codec's configuration.
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// A fresh chunked header with a random salt.
    pub fn new_header(&self, chunk_size: u64) -> ChunkedHeader {
        ChunkedHeader {
            version: CHUNKED_VERSION,
            salt: cipher::random_bytes(SALT_LEN),
            iv_length: self.config.iv_length,
            tag_length: TAG_LEN,
            chunk_size,
            pbkdf2_iterations: self.config.pbkdf2_iterations,
        }
    }

    /// The key for `header`, from cache or derived on the CPU pool.
    pub async fn key_for(&self, header: &ChunkedHeader) -> Result<DerivedKey, CryptoError> {
        self.keys.get(&header.salt, header.pbkdf2_iterations).await
    }

    /// Encrypt one chunk on the CPU pool.
    pub async fn encrypt(
        &self,
        header: &ChunkedHeader,
        plaintext: Bytes,
    ) -> Result<SealedChunk, CryptoError> {
        let key = self.key_for(header).await?;
        let iv_length = header.iv_length;
        self.cpu
            .run(move || cipher::encrypt_chunk(&key, iv_length, &plaintext))
            .await
            .and_then(|sealed| sealed)
    }

    /// Decrypt one chunk on the CPU pool.
    pub async fn decrypt_one(
        &self,
        header: &ChunkedHeader,
        part: SealedPart,
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.key_for(header).await?;
        let iv_length = header.iv_length;
        let sequence = part.sequence;
        self.cpu
            .run(move || cipher::decrypt_chunk(&key, iv_length, &part.iv, &part.data))
            .await
            .and_then(|opened| opened)
            .map_err(|e| e.for_chunk(sequence))
    }

    /// Lazily decrypt an ordered sequence of chunks.
    ///
    /// The returned iterator yields plaintext in input order. The first
    /// failure is yielded as an error and ends the sequence.
    /// Every step runs on the calling thread, off the CPU pool.
    pub fn decrypt_chunks<I>(
        &self,
        key: DerivedKey,
        header: &ChunkedHeader,
        parts: I,
    ) -> DecryptedChunks<I::IntoIter>
    where
        I: IntoIterator<Item = SealedPart>,
    {
        DecryptedChunks {
            key,
            iv_length: header.iv_length,
            parts: parts.into_iter(),
            done: false,
        }
    }

    /// Encrypt a whole object as one legacy AEAD stream.
    ///
    /// Returns the header to store and `prefix || ciphertext` to upload.
    pub async fn encrypt_legacy(
        &self,
        plaintext: Bytes,
    ) -> Result<(EncryptionHeader, Vec<u8>), CryptoError> {
        let salt = cipher::random_bytes(SALT_LEN);
        let iterations = self.config.pbkdf2_iterations;
        let key = self.keys.get(&salt, iterations).await?;
        let sealed = self
            .cpu
            .run(move || {
                let iv = cipher::random_bytes(LEGACY_IV_LEN);
                cipher::seal(&key, &iv, &plaintext).map(|data| (iv, data))
            })
            .await
            .and_then(|sealed| sealed)?;
        let (iv, mut data) = sealed;
        let body_len = data.len() - TAG_LEN;
        let mut prefix = LegacyPrefix {
            salt: [0; SALT_LEN],
            iv: [0; LEGACY_IV_LEN],
            tag: [0; TAG_LEN],
        };
        prefix.salt.copy_from_slice(&salt);
        prefix.iv.copy_from_slice(&iv);
        prefix.tag.copy_from_slice(&data[body_len..]);
        data.truncate(body_len);

        let mut stream = prefix.to_bytes();
        stream.extend_from_slice(&data);
        Ok((
            EncryptionHeader::Legacy {
                pbkdf2_iterations: iterations,
            },
            stream,
        ))
    }

    /// Decrypt a legacy `prefix || ciphertext` stream.
    pub async fn decrypt_legacy(
        &self,
        pbkdf2_iterations: u32,
        stream: Bytes,
    ) -> Result<Vec<u8>, CryptoError> {
        let (prefix, _) = LegacyPrefix::split(&stream)?;
        let key = self.keys.get(&prefix.salt, pbkdf2_iterations).await?;
        debug!(bytes = stream.len(), "decrypting legacy stream");
        self.cpu
            .run(move || {
                let (prefix, body) = LegacyPrefix::split(&stream)?;
                let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
                sealed.extend_from_slice(body);
                sealed.extend_from_slice(&prefix.tag);
                cipher::open(&key, &prefix.iv, &sealed)
            })
            .await
            .and_then(|opened| opened)
    }
}

/// Lazy, ordered, single-pass plaintext sequence produced by
/// [`ChunkCodec::decrypt_chunks`].
pub struct DecryptedChunks<I> {
    key: DerivedKey,
    iv_length: IvLength,
    parts: I,
    done: bool,
}

impl<I> fmt::Debug for DecryptedChunks<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedChunks")
            .field("iv_length", &self.iv_length)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<I: Iterator<Item = SealedPart>> Iterator for DecryptedChunks<I> {
    type Item = Result<(u32, Vec<u8>), CryptoError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let Some(part) = self.parts.next() else {
            self.done = true;
            return None;
        };
        match cipher::decrypt_chunk(&self.key, self.iv_length, &part.iv, &part.data) {
            Ok(plain) => Some(Ok((part.sequence, plain))),
            Err(e) => {
                self.done = true;
                Some(Err(e.for_chunk(part.sequence)))
            }
        }
    }
}

impl<I: Iterator<Item = SealedPart>> FusedIterator for DecryptedChunks<I> {}
