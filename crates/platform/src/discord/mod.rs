//! Discord REST implementation of [`PlatformClient`](crate::PlatformClient).

pub mod client;
pub mod config;

pub use client::{DiscordClient, DiscordClientFactory};
pub use config::{DEFAULT_API_BASE, DiscordConfig};
