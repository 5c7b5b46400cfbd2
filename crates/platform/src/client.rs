use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chatvault_core::{ChannelId, MessageId};

use crate::error::PlatformError;
use crate::types::{BotCredential, BotUser, Channel, Message, OutgoingFile};

/// One authenticated bot identity talking to the chat platform.
///
/// Object-safe so the pool can hold heterogeneous clients (real or mock)
/// behind `Arc<dyn PlatformClient>`.
#[async_trait]
pub trait PlatformClient: Send + Sync + fmt::Debug {
    /// Authenticate and return the bot account.
    async fn login(&self) -> Result<BotUser, PlatformError>;

    /// Look up a channel, confirming the bot can see it.
    async fn get_channel(&self, channel_id: &ChannelId) -> Result<Channel, PlatformError>;

    /// Post one message carrying `files` as attachments, in order.
    async fn send_files(
        &self,
        channel_id: &ChannelId,
        files: Vec<OutgoingFile>,
    ) -> Result<Message, PlatformError>;

    /// Fetch a message by id.
    async fn fetch_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<Message, PlatformError>;

    /// Delete between two and a hundred messages in one call.
    async fn bulk_delete(
        &self,
        channel_id: &ChannelId,
        message_ids: &[MessageId],
    ) -> Result<(), PlatformError>;

    /// Delete one message.
    async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), PlatformError>;
}

/// Builds a [`PlatformClient`] for a credential.
pub trait ClientFactory: Send + Sync {
    /// Construct (but do not log in) a client.
    fn connect(&self, credential: &BotCredential) -> Result<Arc<dyn PlatformClient>, PlatformError>;
}

/// Fetches attachment bodies from the platform's CDN.
#[async_trait]
pub trait CdnClient: Send + Sync + fmt::Debug {
    /// Download the full body at `url`.
    async fn download(&self, url: &str) -> Result<Bytes, PlatformError>;

    /// Check that `url` is reachable without transferring the body.
    ///
    /// Returns the HTTP status; only transport failures are errors.
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, PlatformError>;
}
