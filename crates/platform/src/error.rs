use std::time::Duration;

use chatvault_executor::{Classify, RetryClass, classify_message};
use thiserror::Error;

/// Errors returned by platform and CDN calls.
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    /// The platform throttled the request.
    #[error("rate limited{}", retry_after_suffix(.retry_after))]
    RateLimited {
        /// Wait the platform asked for, when it said.
        retry_after: Option<Duration>,
    },

    /// A network or transport-level error occurred.
    #[error("connection error: {0}")]
    Connection(String),

    /// The request did not complete within the allowed duration.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The platform answered with a non-success status.
    #[error("platform API error (HTTP {status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Body or error message returned by the platform.
        message: String,
    },

    /// The channel, message or attachment does not exist (or is not visible).
    #[error("not found: {0}")]
    NotFound(String),

    /// The credential was rejected or lacks permission.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The response could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The client was given invalid configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

#[allow(clippy::ref_option)]
fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    retry_after.map_or_else(String::new, |d| format!(" (retry after {d:?})"))
}

impl PlatformError {
    /// Returns `true` if the error is transient and the call may succeed on
    /// retry.
    pub fn is_retryable(&self) -> bool {
        self.classify().is_retryable()
    }

    /// Returns `true` for not-found class failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl Classify for PlatformError {
    fn classify(&self) -> RetryClass {
        match self {
            Self::RateLimited { retry_after } => RetryClass::RateLimited {
                retry_after: *retry_after,
            },
            Self::Connection(_) | Self::Timeout(_) => RetryClass::Transient,
            Self::Api { status: 429, .. } => RetryClass::RateLimited { retry_after: None },
            Self::Api { status, .. } if *status >= 500 => RetryClass::Transient,
            Self::Api { message, .. } => classify_message(message),
            Self::NotFound(_)
            | Self::Unauthorized(_)
            | Self::InvalidResponse(_)
            | Self::Configuration(_) => RetryClass::Fatal,
        }
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not report which timeout fired.
            Self::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else if err.is_builder() {
            Self::Configuration(err.to_string())
        } else {
            Self::Connection(err.to_string())
        }
    }
}
