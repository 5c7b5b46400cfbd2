use std::time::Duration;

use chatvault_platform::{DEFAULT_CHUNK_SIZE, MAX_ATTACHMENTS_PER_MESSAGE};
use serde::Deserialize;

/// Ingest settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Plaintext bytes per chunk before clamping to the attachment ceiling.
    pub chunk_size: u64,
    /// Attachments per message, capped at the platform limit.
    pub batch_size: usize,
    /// Encrypt chunks when a password is configured.
    pub encrypt: bool,
    /// Encrypted chunks buffered ahead of the senders at start.
    pub initial_buffer: usize,
    /// Concurrent sends at start. Zero means one per ready identity.
    pub initial_concurrency: usize,
    /// Hard ceiling on buffered plus in-flight chunks.
    pub max_in_memory_chunks: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: 5,
            encrypt: true,
            initial_buffer: 4,
            initial_concurrency: 0,
            max_in_memory_chunks: 32,
        }
    }
}

impl IngestConfig {
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    #[must_use]
    pub fn with_max_in_memory_chunks(mut self, max: usize) -> Self {
        self.max_in_memory_chunks = max;
        self
    }

    /// Batch size clamped to `1..=MAX_ATTACHMENTS_PER_MESSAGE`.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_ATTACHMENTS_PER_MESSAGE)
    }
}

/// Download settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Chunks fetched at once.
    pub concurrency: usize,
    /// Retries per chunk after the first attempt.
    pub max_retries: u32,
    /// Linear backoff step between retries.
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
    /// Messages re-fetched at once while refreshing URLs.
    pub resolve_concurrency: usize,
    /// Largest ciphertext reassembled in memory. Bigger objects are
    /// spooled to a temporary file.
    pub memory_limit: u64,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            resolve_concurrency: 4,
            memory_limit: 64 * 1024 * 1024,
        }
    }
}

impl EgressConfig {
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }
}

/// Health scan settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Probes in flight at once; also the batch size.
    pub concurrency: usize,
    /// Per-probe timeout.
    #[serde(with = "millis")]
    pub probe_timeout: Duration,
    /// Pause between batches.
    #[serde(with = "millis")]
    pub batch_delay: Duration,
    /// Minimum spacing of progress records.
    #[serde(with = "millis")]
    pub progress_interval: Duration,
    /// Chunks sampled by the diagnostic.
    pub diagnose_samples: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            probe_timeout: Duration::from_secs(10),
            batch_delay: Duration::from_millis(250),
            progress_interval: Duration::from_secs(1),
            diagnose_samples: 5,
        }
    }
}

impl ScanConfig {
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

/// Durations as integer milliseconds in config files.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_is_capped_at_the_platform_limit() {
        assert_eq!(IngestConfig::default().with_batch_size(50).effective_batch_size(), 10);
        assert_eq!(IngestConfig::default().with_batch_size(0).effective_batch_size(), 1);
        assert_eq!(IngestConfig::default().effective_batch_size(), 5);
    }

    #[test]
    fn durations_deserialize_from_millis() {
        let config: ScanConfig =
            serde_json::from_str(r#"{"batch_delay": 50, "concurrency": 2}"#).unwrap();
        assert_eq!(config.batch_delay, Duration::from_millis(50));
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.probe_timeout, Duration::from_secs(10));
    }
}
