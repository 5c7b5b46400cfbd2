use std::fmt;

use bytes::Bytes;
use chatvault_core::{ChannelId, MessageId};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Maximum attachments a single message may carry.
pub const MAX_ATTACHMENTS_PER_MESSAGE: usize = 10;

/// Attachment size ceiling enforced by the platform.
pub const MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;

/// Chunk size targeted by default, leaving headroom under the ceiling.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Fewest ids accepted by one bulk-delete call.
pub const BULK_DELETE_MIN: usize = 2;

/// Most ids accepted by one bulk-delete call.
pub const BULK_DELETE_MAX: usize = 100;

/// The authenticated bot account behind a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotUser {
    /// Platform user id.
    pub id: String,
    /// Display name.
    pub username: String,
}

/// A channel visible to a bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel id.
    pub id: ChannelId,
    /// Channel name, when the platform reports one.
    #[serde(default)]
    pub name: Option<String>,
}

/// A file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment id.
    pub id: String,
    /// File name as the platform stored it (may differ from what was sent).
    pub filename: String,
    /// Size in bytes.
    pub size: u64,
    /// Signed download URL. Expires.
    pub url: String,
}

/// A message as returned by send and fetch calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message id.
    pub id: MessageId,
    /// Channel the message lives in.
    pub channel_id: ChannelId,
    /// User id of the bot that posted it.
    pub author_id: String,
    /// Attachments in upload order.
    pub attachments: Vec<Attachment>,
}

/// A file to upload.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    /// Name to upload under.
    pub filename: String,
    /// File body.
    pub data: Bytes,
}

impl OutgoingFile {
    /// Build a file from its name and contents.
    pub fn new(filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
        }
    }
}

/// Credentials for one bot identity.
#[derive(Clone, Deserialize)]
pub struct BotCredential {
    /// Bot token.
    pub token: SecretString,
    /// Optional HTTP or SOCKS proxy URL used for this identity only.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Human-readable label used in logs.
    #[serde(default)]
    pub label: Option<String>,
}

impl BotCredential {
    /// Create a credential from a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::new(token.into()),
            proxy: None,
            label: None,
        }
    }

    /// Route this identity through a proxy.
    #[must_use]
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Set the log label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl fmt::Debug for BotCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotCredential")
            .field("token", &"[REDACTED]")
            .field("proxy", &self.proxy.as_ref().map(|_| "[REDACTED]"))
            .field("label", &self.label)
            .finish()
    }
}
