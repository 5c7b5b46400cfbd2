//! Failure classification and retry for calls against the chat platform.

pub mod classify;
pub mod config;
pub mod retry;
pub mod strategy;

pub use classify::{Classify, RetryClass, classify_message};
pub use config::RetryPolicy;
pub use retry::RetryExecutor;
pub use strategy::{JITTER_RATIO, RetryStrategy, apply_jitter};
