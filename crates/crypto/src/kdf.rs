use std::fmt;
use std::time::Duration;

use moka::future::Cache;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::pool::CpuPool;

/// Length of a derived AES-256 key.
pub const KEY_LEN: usize = 32;

/// Length of a freshly generated salt.
pub const SALT_LEN: usize = 32;

/// PBKDF2 iterations used when a header does not say otherwise.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;

/// A 32-byte AES-256 key derived from the vault password.
///
/// Zeroized on drop; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// Derive a key with PBKDF2-HMAC-SHA256.
///
/// CPU-bound: call through a [`CpuPool`] or [`KeyCache`] from async code.
pub fn derive_key(
    password: &SecretString,
    salt: &[u8],
    iterations: u32,
) -> Result<DerivedKey, CryptoError> {
    if iterations == 0 {
        return Err(CryptoError::InvalidKey(
            "PBKDF2 iterations must be positive".to_owned(),
        ));
    }
    if salt.is_empty() {
        return Err(CryptoError::InvalidKey("salt is empty".to_owned()));
    }
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.expose_secret().as_bytes(),
        salt,
        iterations,
        &mut key,
    );
    Ok(DerivedKey(key))
}

/// Caches derived keys by `(salt, iterations)` for one password.
///
/// Derivation is deliberately slow, and every chunk of an object shares one
/// salt, so an egress of N chunks would otherwise derive the same key N times.
#[derive(Clone)]
pub struct KeyCache {
    password: SecretString,
    cache: Cache<(Vec<u8>, u32), DerivedKey>,
    cpu: CpuPool,
}

impl fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCache")
            .field("entries", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl KeyCache {
    /// Build a cache holding at most `capacity` keys for `ttl` each.
    pub fn new(password: SecretString, ttl: Duration, capacity: u64, cpu: CpuPool) -> Self {
        Self {
            password,
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            cpu,
        }
    }

    /// Return the key for `salt`, deriving it on the CPU pool on a miss.
    ///
    /// Concurrent misses for the same salt share one derivation.
    pub async fn get(&self, salt: &[u8], iterations: u32) -> Result<DerivedKey, CryptoError> {
        let password = self.password.clone();
        let owned_salt = salt.to_vec();
        let cpu = self.cpu.clone();
        self.cache
            .try_get_with((salt.to_vec(), iterations), async move {
                debug!(iterations, "deriving chunk key");
                cpu.run(move || derive_key(&password, &owned_salt, iterations))
                    .await
                    .and_then(|derived| derived)
            })
            .await
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Drop every cached key.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password() -> SecretString {
        SecretString::new("correct horse battery staple".to_owned())
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_key(&password(), b"salt-salt-salt", 1_000).unwrap();
        let b = derive_key(&password(), b"salt-salt-salt", 1_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn salt_and_iterations_change_the_key() {
        let base = derive_key(&password(), b"salt-a", 1_000).unwrap();
        assert_ne!(base, derive_key(&password(), b"salt-b", 1_000).unwrap());
        assert_ne!(base, derive_key(&password(), b"salt-a", 1_001).unwrap());
    }

    #[test]
    fn rejects_degenerate_parameters() {
        assert!(matches!(
            derive_key(&password(), b"salt", 0),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(matches!(
            derive_key(&password(), b"", 1_000),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn debug_is_redacted() {
        let key = DerivedKey::from_bytes([7u8; KEY_LEN]);
        assert_eq!(format!("{key:?}"), "DerivedKey([REDACTED])");
    }

    #[tokio::test]
    async fn cache_returns_same_key_as_direct_derivation() {
        let cache = KeyCache::new(password(), Duration::from_secs(60), 16, CpuPool::new(1));
        let cached = cache.get(b"object-salt", 1_000).await.unwrap();
        let direct = derive_key(&password(), b"object-salt", 1_000).unwrap();
        assert_eq!(cached, direct);
        // Second lookup is a hit and yields the same key.
        assert_eq!(cache.get(b"object-salt", 1_000).await.unwrap(), direct);
    }

    #[tokio::test]
    async fn cache_surfaces_derivation_errors() {
        let cache = KeyCache::new(password(), Duration::from_secs(60), 16, CpuPool::new(1));
        assert!(cache.get(b"", 1_000).await.is_err());
    }
}
