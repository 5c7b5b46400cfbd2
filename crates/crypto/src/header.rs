//! Encryption header wire formats.
//!
//! An object's header is stored as JSON alongside its metadata. Two shapes
//! exist, told apart by their discriminator field:
//!
//! - chunked: `{"version":2,"salt":"<b64>","chunkSize":..,"ivLength":12,"tagLength":16,"pbkdf2Iterations":100000}`
//! - legacy whole-object: `{"method":"aes-256-gcm","pbkdf2Iterations":100000}`; the
//!   salt, IV and tag live in a 64-byte binary prefix of the stored stream.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};

use crate::cipher::{IvLength, TAG_LEN};
use crate::error::CryptoError;
use crate::kdf::{DEFAULT_PBKDF2_ITERATIONS, SALT_LEN};

/// Current chunked header version.
pub const CHUNKED_VERSION: u32 = 2;

/// `method` value written on legacy whole-object headers.
pub const LEGACY_METHOD: &str = "aes-256-gcm";

/// IV length used by legacy whole-object encryption.
pub const LEGACY_IV_LEN: usize = 16;

/// Size of the binary prefix on legacy streams: `salt(32) || iv(16) || tag(16)`.
pub const LEGACY_PREFIX_LEN: usize = SALT_LEN + LEGACY_IV_LEN + TAG_LEN;

/// Parameters of a chunk-encrypted object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedHeader {
    /// Format version.
    pub version: u32,
    /// KDF salt shared by every chunk of the object.
    pub salt: Vec<u8>,
    /// IV tier used for every chunk.
    pub iv_length: IvLength,
    /// Authentication tag length.
    pub tag_length: usize,
    /// Plaintext bytes per chunk (the last may be shorter).
    pub chunk_size: u64,
    /// KDF strength.
    pub pbkdf2_iterations: u32,
}

/// Binary prefix of a legacy whole-object stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyPrefix {
    /// KDF salt.
    pub salt: [u8; SALT_LEN],
    /// Stream IV.
    pub iv: [u8; LEGACY_IV_LEN],
    /// Authentication tag for the whole stream.
    pub tag: [u8; TAG_LEN],
}

impl LegacyPrefix {
    /// Split a legacy stream into its prefix and ciphertext body.
    pub fn split(stream: &[u8]) -> Result<(Self, &[u8]), CryptoError> {
        if stream.len() < LEGACY_PREFIX_LEN {
            return Err(CryptoError::InvalidHeader(format!(
                "legacy stream is {} bytes, shorter than its {LEGACY_PREFIX_LEN}-byte header",
                stream.len()
            )));
        }
        let (head, body) = stream.split_at(LEGACY_PREFIX_LEN);
        let mut prefix = Self {
            salt: [0; SALT_LEN],
            iv: [0; LEGACY_IV_LEN],
            tag: [0; TAG_LEN],
        };
        prefix.salt.copy_from_slice(&head[..SALT_LEN]);
        prefix
            .iv
            .copy_from_slice(&head[SALT_LEN..SALT_LEN + LEGACY_IV_LEN]);
        prefix.tag.copy_from_slice(&head[SALT_LEN + LEGACY_IV_LEN..]);
        Ok((prefix, body))
    }

    /// Serialize to the 64-byte binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LEGACY_PREFIX_LEN);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.tag);
        out
    }
}

/// An object's encryption header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionHeader {
    /// One AEAD stream for the whole object.
    Legacy {
        /// KDF strength.
        pbkdf2_iterations: u32,
    },
    /// Independently encrypted chunks.
    Chunked(ChunkedHeader),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iv_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pbkdf2_iterations: Option<u32>,
}

impl EncryptionHeader {
    /// Parse the JSON wire form, dispatching on `version` or `method`.
    pub fn parse(json: &str) -> Result<Self, CryptoError> {
        let wire: WireHeader = serde_json::from_str(json)
            .map_err(|e| CryptoError::InvalidHeader(format!("not valid header JSON: {e}")))?;
        let iterations = wire.pbkdf2_iterations.unwrap_or(DEFAULT_PBKDF2_ITERATIONS);

        if let Some(version) = wire.version {
            let salt = wire
                .salt
                .ok_or_else(|| CryptoError::InvalidHeader("chunked header has no salt".into()))
                .and_then(|s| {
                    B64.decode(s.trim())
                        .map_err(|e| CryptoError::InvalidHeader(format!("bad salt: {e}")))
                })?;
            if salt.is_empty() {
                return Err(CryptoError::InvalidHeader("salt is empty".into()));
            }
            let chunk_size = wire
                .chunk_size
                .filter(|&n| n > 0)
                .ok_or_else(|| CryptoError::InvalidHeader("missing chunkSize".into()))?;
            let iv_length = IvLength::try_from(wire.iv_length.unwrap_or(12))?;
            let tag_length = wire.tag_length.unwrap_or(TAG_LEN);
            if tag_length != TAG_LEN {
                return Err(CryptoError::InvalidHeader(format!(
                    "unsupported tag length {tag_length}"
                )));
            }
            return Ok(Self::Chunked(ChunkedHeader {
                version,
                salt,
                iv_length,
                tag_length,
                chunk_size,
                pbkdf2_iterations: iterations,
            }));
        }

        match wire.method.as_deref() {
            Some(m) if m.eq_ignore_ascii_case(LEGACY_METHOD) => Ok(Self::Legacy {
                pbkdf2_iterations: iterations,
            }),
            Some(other) => Err(CryptoError::InvalidHeader(format!(
                "unknown method {other:?}"
            ))),
            None => Err(CryptoError::InvalidHeader(
                "header has neither version nor method".into(),
            )),
        }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> String {
        let wire = match self {
            Self::Legacy { pbkdf2_iterations } => WireHeader {
                method: Some(LEGACY_METHOD.to_owned()),
                pbkdf2_iterations: Some(*pbkdf2_iterations),
                ..WireHeader::default()
            },
            Self::Chunked(h) => WireHeader {
                version: Some(h.version),
                salt: Some(B64.encode(&h.salt)),
                chunk_size: Some(h.chunk_size),
                iv_length: Some(h.iv_length.bytes()),
                tag_length: Some(h.tag_length),
                pbkdf2_iterations: Some(h.pbkdf2_iterations),
                ..WireHeader::default()
            },
        };
        // A struct of plain optional scalars always serializes.
        serde_json::to_string(&wire).unwrap_or_default()
    }

    /// The chunked parameters, if this is a chunked header.
    pub fn as_chunked(&self) -> Option<&ChunkedHeader> {
        match self {
            Self::Chunked(h) => Some(h),
            Self::Legacy { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked() -> ChunkedHeader {
        ChunkedHeader {
            version: CHUNKED_VERSION,
            salt: vec![9; SALT_LEN],
            iv_length: IvLength::Sixteen,
            tag_length: TAG_LEN,
            chunk_size: 8 * 1024 * 1024,
            pbkdf2_iterations: 250_000,
        }
    }

    #[test]
    fn chunked_json_uses_camel_case_fields() {
        let json = EncryptionHeader::Chunked(chunked()).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["chunkSize"], 8 * 1024 * 1024);
        assert_eq!(value["ivLength"], 16);
        assert_eq!(value["tagLength"], 16);
        assert_eq!(value["pbkdf2Iterations"], 250_000);
        assert!(value.get("method").is_none());
    }

    #[test]
    fn parse_dispatches_on_version() {
        let json = EncryptionHeader::Chunked(chunked()).to_json();
        assert_eq!(
            EncryptionHeader::parse(&json).unwrap(),
            EncryptionHeader::Chunked(chunked())
        );
    }

    #[test]
    fn parse_dispatches_on_method() {
        let parsed = EncryptionHeader::parse(r#"{"method":"AES-256-GCM"}"#).unwrap();
        assert_eq!(
            parsed,
            EncryptionHeader::Legacy {
                pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS
            }
        );
    }

    #[test]
    fn chunked_defaults_fill_missing_tiers() {
        let json = r#"{"version":1,"salt":"AAECAw==","chunkSize":1024}"#;
        let header = EncryptionHeader::parse(json).unwrap();
        let h = header.as_chunked().unwrap();
        assert_eq!(h.iv_length, IvLength::Twelve);
        assert_eq!(h.tag_length, TAG_LEN);
        assert_eq!(h.pbkdf2_iterations, DEFAULT_PBKDF2_ITERATIONS);
        assert_eq!(h.salt, vec![0, 1, 2, 3]);
    }

    #[test]
    fn rejects_malformed_headers() {
        for bad in [
            "not json",
            "{}",
            r#"{"method":"rot13"}"#,
            r#"{"version":2,"chunkSize":10}"#,
            r#"{"version":2,"salt":"AAEC","chunkSize":10,"ivLength":8}"#,
            r#"{"version":2,"salt":"AAEC","chunkSize":0}"#,
        ] {
            assert!(EncryptionHeader::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn legacy_prefix_splits_stream() {
        let prefix = LegacyPrefix {
            salt: [1; SALT_LEN],
            iv: [2; LEGACY_IV_LEN],
            tag: [3; TAG_LEN],
        };
        let mut stream = prefix.to_bytes();
        stream.extend_from_slice(b"body");
        let (parsed, body) = LegacyPrefix::split(&stream).unwrap();
        assert_eq!(parsed, prefix);
        assert_eq!(body, b"body");
        assert!(LegacyPrefix::split(&stream[..10]).is_err());
    }
}
