use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chatvault_core::ChannelId;
use chatvault_platform::{BotUser, PlatformClient};
use serde::Serialize;

/// One logged-in identity, its channels and its load.
pub struct BotConnection {
    index: usize,
    label: String,
    user: BotUser,
    client: Arc<dyn PlatformClient>,
    home_channel: ChannelId,
    visible_channels: Vec<ChannelId>,
    busy: AtomicUsize,
}

impl fmt::Debug for BotConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotConnection")
            .field("index", &self.index)
            .field("label", &self.label)
            .field("user_id", &self.user.id)
            .field("home_channel", &self.home_channel)
            .field("busy", &self.busy())
            .finish_non_exhaustive()
    }
}

impl BotConnection {
    pub(crate) fn new(
        index: usize,
        label: String,
        user: BotUser,
        client: Arc<dyn PlatformClient>,
        home_channel: ChannelId,
        visible_channels: Vec<ChannelId>,
    ) -> Self {
        Self {
            index,
            label,
            user,
            client,
            home_channel,
            visible_channels,
            busy: AtomicUsize::new(0),
        }
    }

    /// Position of the credential this connection was built from.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Log label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The bot account.
    pub fn user(&self) -> &BotUser {
        &self.user
    }

    /// The underlying platform client.
    pub fn client(&self) -> &Arc<dyn PlatformClient> {
        &self.client
    }

    /// Channel this identity uploads to.
    pub fn home_channel(&self) -> &ChannelId {
        &self.home_channel
    }

    /// Channels this identity can read.
    pub fn visible_channels(&self) -> &[ChannelId] {
        &self.visible_channels
    }

    /// Whether this identity can read `channel_id`.
    pub fn can_see(&self, channel_id: &ChannelId) -> bool {
        self.visible_channels.contains(channel_id)
    }

    /// Operations currently in flight on this identity.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Count one in-flight operation until the guard drops.
    pub fn acquire(self: &Arc<Self>) -> BusyGuard {
        self.busy.fetch_add(1, Ordering::SeqCst);
        BusyGuard {
            conn: Arc::clone(self),
        }
    }

    pub(crate) fn status(&self) -> BotStatus {
        BotStatus {
            index: self.index,
            label: self.label.clone(),
            user_id: self.user.id.clone(),
            home_channel: self.home_channel.clone(),
            visible_channels: self.visible_channels.clone(),
            busy: self.busy(),
        }
    }
}

/// RAII guard that decrements the busy counter on drop, whatever the outcome.
#[derive(Debug)]
pub struct BusyGuard {
    conn: Arc<BotConnection>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.conn.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotStatus {
    /// Credential position.
    pub index: usize,
    /// Log label.
    pub label: String,
    /// Platform user id.
    pub user_id: String,
    /// Write channel.
    pub home_channel: ChannelId,
    /// Readable channels.
    pub visible_channels: Vec<ChannelId>,
    /// In-flight operations.
    pub busy: usize,
}
