use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatvault_core::{ChannelId, MessageId};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::client::{ClientFactory, PlatformClient};
use crate::discord::config::DiscordConfig;
use crate::error::PlatformError;
use crate::types::{
    Attachment, BULK_DELETE_MAX, BULK_DELETE_MIN, BotCredential, BotUser, Channel,
    MAX_ATTACHMENTS_PER_MESSAGE, Message, OutgoingFile,
};

/// REST client for one Discord bot identity.
pub struct DiscordClient {
    api_base: String,
    label: String,
    client: Client,
}

impl std::fmt::Debug for DiscordClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordClient")
            .field("api_base", &self.api_base)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    id: String,
    filename: String,
    #[serde(default)]
    size: u64,
    url: String,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    channel_id: String,
    author: WireUser,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    retry_after: Option<f64>,
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        Self {
            id: MessageId::new(wire.id),
            channel_id: ChannelId::new(wire.channel_id),
            author_id: wire.author.id,
            attachments: wire
                .attachments
                .into_iter()
                .map(|a| Attachment {
                    id: a.id,
                    filename: a.filename,
                    size: a.size,
                    url: a.url,
                })
                .collect(),
        }
    }
}

impl DiscordClient {
    /// Build a client for `credential`.
    ///
    /// The credential's own proxy wins over the config's default proxy.
    pub fn new(config: &DiscordConfig, credential: &BotCredential) -> Result<Self, PlatformError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bot {}", credential.token.expose_secret()))
            .map_err(|_| PlatformError::Configuration("bot token is not a valid header".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        let agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|_| PlatformError::Configuration("user agent is not a valid header".into()))?;
        headers.insert(USER_AGENT, agent);

        let mut builder = Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers);
        if let Some(proxy) = credential.proxy.as_ref().or(config.default_proxy.as_ref()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| PlatformError::Configuration(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build()?;

        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            label: credential.label.clone().unwrap_or_else(|| "bot".to_owned()),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, PlatformError> {
        response
            .json::<T>()
            .await
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()))
    }
}

/// Map a non-success response onto a [`PlatformError`].
pub(crate) async fn check_status(response: Response) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let header_hint = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok());
    let body = response.text().await.unwrap_or_default();
    let wire = serde_json::from_str::<WireError>(&body).ok();
    let message = wire
        .as_ref()
        .and_then(|w| w.message.clone())
        .unwrap_or_else(|| body.clone());

    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let secs = header_hint.or_else(|| wire.as_ref().and_then(|w| w.retry_after));
            let retry_after = secs
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64);
            warn!(?retry_after, "platform rate limit hit");
            Err(PlatformError::RateLimited { retry_after })
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(PlatformError::NotFound(message)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(PlatformError::Unauthorized(format!("HTTP {status}: {message}")))
        }
        _ => Err(PlatformError::Api {
            status: status.as_u16(),
            message,
        }),
    }
}

#[async_trait]
impl PlatformClient for DiscordClient {
    #[instrument(skip(self), fields(bot = %self.label))]
    async fn login(&self) -> Result<BotUser, PlatformError> {
        let response = self.client.get(self.url("/users/@me")).send().await?;
        let user: WireUser = Self::json(check_status(response).await?).await?;
        debug!(user_id = %user.id, "bot authenticated");
        Ok(BotUser {
            id: user.id,
            username: user.username,
        })
    }

    async fn get_channel(&self, channel_id: &ChannelId) -> Result<Channel, PlatformError> {
        let response = self
            .client
            .get(self.url(&format!("/channels/{channel_id}")))
            .send()
            .await?;
        let channel: WireChannel = Self::json(check_status(response).await?).await?;
        Ok(Channel {
            id: ChannelId::new(channel.id),
            name: channel.name,
        })
    }

    #[instrument(skip(self, files), fields(bot = %self.label, files = files.len()))]
    async fn send_files(
        &self,
        channel_id: &ChannelId,
        files: Vec<OutgoingFile>,
    ) -> Result<Message, PlatformError> {
        if files.is_empty() || files.len() > MAX_ATTACHMENTS_PER_MESSAGE {
            return Err(PlatformError::Configuration(format!(
                "a message carries 1..={MAX_ATTACHMENTS_PER_MESSAGE} attachments, got {}",
                files.len()
            )));
        }

        let attachments: Vec<serde_json::Value> = files
            .iter()
            .enumerate()
            .map(|(i, f)| serde_json::json!({ "id": i, "filename": f.filename }))
            .collect();
        let payload_json = serde_json::json!({ "attachments": attachments }).to_string();

        let mut form = reqwest::multipart::Form::new().text("payload_json", payload_json);
        for (i, file) in files.into_iter().enumerate() {
            let len = file.data.len() as u64;
            let part = reqwest::multipart::Part::stream_with_length(file.data, len)
                .file_name(file.filename)
                .mime_str("application/octet-stream")
                .map_err(|e| PlatformError::Configuration(e.to_string()))?;
            form = form.part(format!("files[{i}]"), part);
        }

        let response = self
            .client
            .post(self.url(&format!("/channels/{channel_id}/messages")))
            .multipart(form)
            .send()
            .await?;
        let message: WireMessage = Self::json(check_status(response).await?).await?;
        Ok(message.into())
    }

    async fn fetch_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<Message, PlatformError> {
        let response = self
            .client
            .get(self.url(&format!("/channels/{channel_id}/messages/{message_id}")))
            .send()
            .await?;
        let message: WireMessage = Self::json(check_status(response).await?).await?;
        Ok(message.into())
    }

    #[instrument(skip(self, message_ids), fields(bot = %self.label, count = message_ids.len()))]
    async fn bulk_delete(
        &self,
        channel_id: &ChannelId,
        message_ids: &[MessageId],
    ) -> Result<(), PlatformError> {
        match message_ids.len() {
            0 => return Ok(()),
            1 => return self.delete_message(channel_id, &message_ids[0]).await,
            n if n > BULK_DELETE_MAX => {
                return Err(PlatformError::Configuration(format!(
                    "bulk delete takes {BULK_DELETE_MIN}..={BULK_DELETE_MAX} ids, got {n}"
                )));
            }
            _ => {}
        }
        let body = serde_json::json!({ "messages": message_ids });
        let response = self
            .client
            .post(self.url(&format!("/channels/{channel_id}/messages/bulk-delete")))
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), PlatformError> {
        let response = self
            .client
            .delete(self.url(&format!("/channels/{channel_id}/messages/{message_id}")))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Builds [`DiscordClient`]s from a shared [`DiscordConfig`].
#[derive(Debug, Clone, Default)]
pub struct DiscordClientFactory {
    config: DiscordConfig,
}

impl DiscordClientFactory {
    /// Create a factory.
    pub fn new(config: DiscordConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for DiscordClientFactory {
    fn connect(&self, credential: &BotCredential) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        Ok(Arc::new(DiscordClient::new(&self.config, credential)?))
    }
}
