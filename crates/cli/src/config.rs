use std::path::{Path, PathBuf};
use std::time::Duration;

use chatvault_engine::{EgressConfig, IngestConfig, ScanConfig};
use chatvault_executor::{RetryPolicy, RetryStrategy};
use chatvault_platform::{BotCredential, DiscordConfig};
use chatvault_pool::PoolConfig;
use serde::Deserialize;

/// Top-level configuration, loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct ChatvaultConfig {
    /// REST endpoint and HTTP settings shared by every identity.
    #[serde(default)]
    pub platform: DiscordConfig,
    /// Bot identities. Tokens are redacted from `Debug` output.
    #[serde(default)]
    pub bots: Vec<BotCredential>,
    #[serde(default)]
    pub pool: PoolSection,
    /// Retry policy for platform calls made through the pool.
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub health: ScanConfig,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

impl ChatvaultConfig {
    /// Read `path`, or fall back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = if path.exists() {
            std::fs::read_to_string(path)?
        } else {
            String::new()
        };
        Ok(toml::from_str(&contents)?)
    }

    /// Pool settings with the retry policy folded in.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(self.pool.channel_ids.iter().map(String::as_str))
            .with_bots_per_channel(self.pool.bots_per_channel)
            .with_login_delay(Duration::from_millis(self.pool.login_delay_ms))
            .with_init_retry(
                self.pool.init_max_attempts,
                Duration::from_millis(self.pool.init_backoff_ms),
            )
            .with_retry(self.retry.policy())
    }
}

/// `[pool]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Channels chunks are stored in.
    pub channel_ids: Vec<String>,
    /// Identities per channel; zero spreads them evenly.
    pub bots_per_channel: usize,
    pub login_delay_ms: u64,
    pub init_max_attempts: u32,
    pub init_backoff_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            channel_ids: Vec::new(),
            bots_per_channel: 0,
            login_delay_ms: 1_000,
            init_max_attempts: 3,
            init_backoff_ms: 5_000,
        }
    }
}

/// `[retry]` section: exponential backoff with optional jitter.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts.max(1))
            .with_strategy(RetryStrategy::Exponential {
                base: Duration::from_millis(self.base_delay_ms),
                max: Duration::from_millis(self.max_delay_ms),
                multiplier: self.multiplier,
                jitter: self.jitter,
            })
    }
}

/// `[store]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// JSON snapshot the metadata store is loaded from and saved to.
    pub snapshot: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            snapshot: PathBuf::from("chatvault-metadata.json"),
        }
    }
}

/// `[telemetry]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}
