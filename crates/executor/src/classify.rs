use std::time::Duration;

/// How a failed remote call should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Not worth retrying; surface immediately.
    Fatal,
    /// The platform throttled the call. `retry_after` is the platform's hint,
    /// when it supplied one.
    RateLimited {
        /// Minimum wait requested by the platform.
        retry_after: Option<Duration>,
    },
    /// A network-level hiccup (reset, timeout, DNS).
    Transient,
}

impl RetryClass {
    /// Whether the failure may succeed on a later attempt.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

/// Errors that know how the retry loop should treat them.
pub trait Classify {
    /// Classify this error.
    fn classify(&self) -> RetryClass;
}

const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "ratelimit", "too many requests", "429"];

const TRANSIENT_MARKERS: &[&str] = &[
    "econnreset",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "etimedout",
    "timed out",
    "timeout",
    "enotfound",
    "eai_again",
    "dns error",
    "failed to lookup",
    "socket hang up",
];

/// Classify a failure from its message text alone.
///
/// Used for errors that only surface as text (wrapped transport errors,
/// messages relayed from the platform). Anything unrecognised is fatal.
pub fn classify_message(message: &str) -> RetryClass {
    let lower = message.to_ascii_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        return RetryClass::RateLimited { retry_after: None };
    }
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return RetryClass::Transient;
    }
    RetryClass::Fatal
}
