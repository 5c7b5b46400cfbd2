//! The chat platform chatvault stores its chunks on.
//!
//! [`PlatformClient`] is one authenticated bot identity; [`CdnClient`]
//! downloads and probes attachment URLs. [`DiscordClient`] and
//! [`HttpCdnClient`] talk to the real service. With the `testing` feature,
//! [`MockPlatform`] provides an in-memory double for both.

pub mod cdn;
pub mod client;
pub mod discord;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod types;

pub use cdn::HttpCdnClient;
pub use client::{CdnClient, ClientFactory, PlatformClient};
pub use discord::{DiscordClient, DiscordClientFactory, DiscordConfig};
pub use error::PlatformError;
#[cfg(any(test, feature = "testing"))]
pub use mock::{MockCall, MockClient, MockPlatform};
pub use types::{
    Attachment, BULK_DELETE_MAX, BULK_DELETE_MIN, BotCredential, BotUser, Channel,
    DEFAULT_CHUNK_SIZE, MAX_ATTACHMENT_BYTES, MAX_ATTACHMENTS_PER_MESSAGE, Message, OutgoingFile,
};
