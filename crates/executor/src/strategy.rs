use std::time::Duration;

use rand::Rng;

/// Fraction of the computed delay that jitter may add or remove.
pub const JITTER_RATIO: f64 = 0.2;

/// Backoff curve between attempts of a platform call.
///
/// Every curve is capped: no computed delay exceeds its `max` (jitter included).
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// `base * multiplier^retry`, optionally spread by up to
    /// [`JITTER_RATIO`] in either direction.
    Exponential {
        /// Wait before the first retry.
        base: Duration,
        /// Cap on every wait.
        max: Duration,
        /// Growth per retry.
        multiplier: f64,
        /// When `true`, the delay is scaled by a random factor in
        /// `[1 - JITTER_RATIO, 1 + JITTER_RATIO]`.
        jitter: bool,
    },
    /// `delay * (retry + 1)`, capped at `max`. Used for chunk downloads.
    Linear {
        /// Step added per retry.
        delay: Duration,
        /// Cap on every wait.
        max: Duration,
    },
    /// The same wait before every retry.
    Constant {
        delay: Duration,
    },
}

impl RetryStrategy {
    /// Compute the delay for the given zero-based retry number, jitter included.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use chatvault_executor::RetryStrategy;
    ///
    /// let strategy = RetryStrategy::Constant { delay: Duration::from_secs(1) };
    /// assert_eq!(strategy.delay_for(0), Duration::from_secs(1));
    /// assert_eq!(strategy.delay_for(5), Duration::from_secs(1));
    /// ```
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        match self {
            Self::Exponential {
                jitter: true, max, ..
            } => {
                let factor = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
                apply_jitter(nominal, factor).min(*max)
            }
            _ => nominal,
        }
    }

    /// The delay before jitter is applied.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Exponential {
                base,
                max,
                multiplier,
                ..
            } => {
                // `attempt` is a small retry count, so the cast cannot wrap.
                #[allow(clippy::cast_possible_wrap)]
                let raw = base.as_secs_f64() * multiplier.powi(attempt as i32);
                Duration::from_secs_f64(raw.min(max.as_secs_f64()))
            }
            Self::Linear { delay, max } => {
                let raw = delay.as_secs_f64() * f64::from(attempt + 1);
                Duration::from_secs_f64(raw.min(max.as_secs_f64()))
            }
            Self::Constant { delay } => *delay,
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Scale `delay` by `1 + factor`, never going below zero.
pub fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + factor)).max(0.0))
}
