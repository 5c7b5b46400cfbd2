use chatvault_core::{ChannelId, MessageId};
use chatvault_executor::{Classify, RetryClass};
use chatvault_platform::PlatformError;
use thiserror::Error;

/// Errors raised by the connection pool.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The pool was started without any bot credentials.
    #[error("no bot credentials configured")]
    NoCredentials,

    /// The pool was started without any channels.
    #[error("no channels configured")]
    NoChannels,

    /// Every identity failed to come up, or the pool was shut down.
    #[error("no ready connections")]
    NoReadyConnections,

    /// An identity cannot see the channel it was assigned to write to.
    #[error("bot {bot} cannot see its home channel {channel_id}")]
    HomeChannelUnavailable {
        /// Label of the identity.
        bot: String,
        /// The assigned channel.
        channel_id: ChannelId,
    },

    /// No identity could find the message in any channel.
    #[error("message {0} not found in any visible channel")]
    MessageNotFound(MessageId),

    /// The platform call failed after retries.
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl PoolError {
    /// Returns `true` if the failure may go away on a later attempt.
    pub fn is_retryable(&self) -> bool {
        self.classify().is_retryable()
    }
}

impl Classify for PoolError {
    fn classify(&self) -> RetryClass {
        match self {
            Self::Platform(e) => e.classify(),
            _ => RetryClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_fatal() {
        assert!(!PoolError::NoCredentials.is_retryable());
        assert!(!PoolError::NoReadyConnections.is_retryable());
        assert!(!PoolError::MessageNotFound(MessageId::new("1")).is_retryable());
    }

    #[test]
    fn platform_errors_keep_their_class() {
        let err: PoolError = PlatformError::Connection("reset".into()).into();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "connection error: reset");
    }
}
