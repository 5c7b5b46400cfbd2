use aes_gcm::aead::consts::{U12, U16};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::kdf::DerivedKey;

/// Length of the GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

type Aes256Gcm12 = AesGcm<Aes256, U12>;
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Nonce size tier. Twelve bytes is the GCM fast path; sixteen bytes is
/// hashed through GHASH first and is what older objects use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub enum IvLength {
    /// 96-bit nonce.
    #[default]
    Twelve,
    /// 128-bit nonce.
    Sixteen,
}

impl IvLength {
    /// Length in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Self::Twelve => 12,
            Self::Sixteen => 16,
        }
    }
}

impl TryFrom<usize> for IvLength {
    type Error = CryptoError;

    fn try_from(len: usize) -> Result<Self, Self::Error> {
        match len {
            12 => Ok(Self::Twelve),
            16 => Ok(Self::Sixteen),
            other => Err(CryptoError::InvalidHeader(format!(
                "unsupported IV length {other}"
            ))),
        }
    }
}

impl From<IvLength> for usize {
    fn from(len: IvLength) -> Self {
        len.bytes()
    }
}

/// Output of encrypting one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedChunk {
    /// `ciphertext || tag`, exactly what gets uploaded.
    pub data: Vec<u8>,
    /// The random IV used for this chunk.
    pub iv: Vec<u8>,
    /// The trailing tag, also kept separately on the chunk row.
    pub tag: Vec<u8>,
    /// Plaintext length.
    pub plain_size: u64,
}

/// Generate `len` random bytes from the thread RNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Encrypt one chunk under a fresh random IV of the given tier.
pub fn encrypt_chunk(
    key: &DerivedKey,
    iv_length: IvLength,
    plaintext: &[u8],
) -> Result<SealedChunk, CryptoError> {
    let iv = random_bytes(iv_length.bytes());
    let data = seal(key, &iv, plaintext)?;
    let tag = data[data.len() - TAG_LEN..].to_vec();
    Ok(SealedChunk {
        data,
        iv,
        tag,
        plain_size: plaintext.len() as u64,
    })
}

/// Decrypt `ciphertext || tag` with the given IV.
///
/// The IV must have the length of `iv_length`; anything else is a hard error
/// rather than an attempt under a different tier.
pub fn decrypt_chunk(
    key: &DerivedKey,
    iv_length: IvLength,
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != iv_length.bytes() {
        return Err(CryptoError::IvLengthMismatch {
            expected: iv_length.bytes(),
            actual: iv.len(),
        });
    }
    if data.len() < TAG_LEN {
        return Err(CryptoError::Truncated(data.len()));
    }
    open(key, iv, data)
}

/// AEAD-encrypt with an explicit IV. Output is `ciphertext || tag`.
pub(crate) fn seal(key: &DerivedKey, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let result = match iv.len() {
        12 => Aes256Gcm12::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .encrypt(Nonce::<U12>::from_slice(iv), plaintext),
        16 => Aes256Gcm16::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .encrypt(Nonce::<U16>::from_slice(iv), plaintext),
        other => {
            return Err(CryptoError::EncryptionFailed(format!(
                "unsupported IV length {other}"
            )));
        }
    };
    result.map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// AEAD-decrypt `ciphertext || tag` with an explicit IV.
pub(crate) fn open(key: &DerivedKey, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let result = match iv.len() {
        12 => Aes256Gcm12::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .decrypt(Nonce::<U12>::from_slice(iv), data),
        16 => Aes256Gcm16::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .decrypt(Nonce::<U16>::from_slice(iv), data),
        other => {
            return Err(CryptoError::IvLengthMismatch {
                expected: 12,
                actual: other,
            });
        }
    };
    result.map_err(|_| CryptoError::DecryptionFailed)
}
