//! Multi-identity connection pool.
//!
//! A [`ConnectionPool`] logs in a set of bot credentials, gives each one a
//! home channel to upload to, and spreads sends, fetches and deletes across
//! them. Every dispatched operation holds a [`BusyGuard`] on its connection
//! so the least-busy selection sees live load.

pub mod config;
pub mod connection;
mod delete;
pub mod error;
mod fetch;
mod pool;

pub use config::{PoolConfig, home_channel_index};
pub use connection::{BotConnection, BotStatus, BusyGuard};
pub use delete::DeleteReport;
pub use error::PoolError;
pub use pool::ConnectionPool;
