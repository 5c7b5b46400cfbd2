use std::time::Duration;

use chatvault_core::ChannelId;
use chatvault_executor::RetryPolicy;

/// Configuration for [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Channels chunks are written to and read from, in assignment order.
    pub channel_ids: Vec<ChannelId>,
    /// Identities per home channel. Zero splits identities evenly.
    pub bots_per_channel: usize,
    /// Pause between consecutive identity logins.
    pub login_delay: Duration,
    /// Attempts per identity before it is given up on.
    pub init_max_attempts: u32,
    /// Fixed wait between an identity's login attempts.
    pub init_backoff: Duration,
    /// Retry policy for sends, fetches and deletes.
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            channel_ids: Vec::new(),
            bots_per_channel: 0,
            login_delay: Duration::from_secs(1),
            init_max_attempts: 3,
            init_backoff: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Start from defaults with the given channels.
    pub fn new<I, S>(channel_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ChannelId>,
    {
        Self {
            channel_ids: channel_ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set identities per home channel.
    #[must_use]
    pub fn with_bots_per_channel(mut self, bots_per_channel: usize) -> Self {
        self.bots_per_channel = bots_per_channel;
        self
    }

    /// Set the delay between logins.
    #[must_use]
    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    /// Set per-identity init attempts and the fixed backoff between them.
    #[must_use]
    pub fn with_init_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.init_max_attempts = max_attempts;
        self.init_backoff = backoff;
        self
    }

    /// Set the retry policy for platform calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Index of the home channel for bot `bot_index` (zero-based).
///
/// Bots are cut into consecutive groups of `bots_per_channel` (or
/// `ceil(bot_count / channel_count)` when that is zero) and group `g` writes
/// to channel `g`. Groups past the last channel stay on the last channel.
pub fn home_channel_index(
    bot_index: usize,
    bot_count: usize,
    channel_count: usize,
    bots_per_channel: usize,
) -> usize {
    if channel_count == 0 {
        return 0;
    }
    let group_size = if bots_per_channel > 0 {
        bots_per_channel
    } else {
        bot_count.div_ceil(channel_count).max(1)
    };
    (bot_index / group_size).min(channel_count - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seven_bots_three_per_channel_two_channels() {
        let homes: Vec<_> = (0..7).map(|i| home_channel_index(i, 7, 2, 3)).collect();
        // Bots 1-3 on A, 4-6 on B, bot 7 overflows and is clamped to B.
        assert_eq!(homes, vec![0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn zero_group_size_splits_evenly() {
        let homes: Vec<_> = (0..5).map(|i| home_channel_index(i, 5, 2, 0)).collect();
        assert_eq!(homes, vec![0, 0, 0, 1, 1]);
        let homes: Vec<_> = (0..3).map(|i| home_channel_index(i, 3, 3, 0)).collect();
        assert_eq!(homes, vec![0, 1, 2]);
    }

    #[test]
    fn more_channels_than_bots() {
        assert_eq!(home_channel_index(0, 1, 4, 0), 0);
        assert_eq!(home_channel_index(1, 2, 4, 1), 1);
    }

    #[test]
    fn no_channels_is_index_zero() {
        assert_eq!(home_channel_index(3, 4, 0, 2), 0);
    }

    #[test]
    fn defaults() {
        let config = PoolConfig::new(["a", "b"]);
        assert_eq!(config.channel_ids.len(), 2);
        assert_eq!(config.login_delay, Duration::from_secs(1));
        assert_eq!(config.init_max_attempts, 3);
        assert_eq!(config.init_backoff, Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 5);
    }
}
