//! In-memory platform double.
//!
//! [`MockPlatform`] plays both the chat API (via [`ClientFactory`]) and the
//! CDN. It records every call and lets tests inject failures: rejected
//! logins, queued send errors, dropped attachments, stripped or deleted
//! messages, expired URLs and failing probes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chatvault_core::{ChannelId, MessageId};
use parking_lot::Mutex;
use secrecy::ExposeSecret;

use crate::client::{CdnClient, ClientFactory, PlatformClient};
use crate::error::PlatformError;
use crate::types::{
    Attachment, BULK_DELETE_MAX, BotCredential, BotUser, Channel, MAX_ATTACHMENTS_PER_MESSAGE,
    Message, OutgoingFile,
};

const CDN_BASE: &str = "https://cdn.mock/attachments";

/// A call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `login` by the bot with this token.
    Login {
        /// Token of the calling bot.
        token: String,
    },
    /// `get_channel`.
    GetChannel {
        /// Token of the calling bot.
        token: String,
        /// Requested channel.
        channel_id: ChannelId,
    },
    /// `send_files`.
    Send {
        /// Token of the calling bot.
        token: String,
        /// Target channel.
        channel_id: ChannelId,
        /// Uploaded file names, in order.
        filenames: Vec<String>,
    },
    /// `fetch_message`.
    Fetch {
        /// Token of the calling bot.
        token: String,
        /// Channel searched.
        channel_id: ChannelId,
        /// Message requested.
        message_id: MessageId,
    },
    /// `bulk_delete`.
    BulkDelete {
        /// Token of the calling bot.
        token: String,
        /// Channel targeted.
        channel_id: ChannelId,
        /// Ids in the call.
        message_ids: Vec<MessageId>,
    },
    /// `delete_message`.
    Delete {
        /// Token of the calling bot.
        token: String,
        /// Channel targeted.
        channel_id: ChannelId,
        /// Message targeted.
        message_id: MessageId,
    },
    /// CDN `download`.
    Download {
        /// URL requested.
        url: String,
    },
    /// CDN `probe`.
    Probe {
        /// URL requested.
        url: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strip {
    None,
    ForNonAuthors,
    All,
}

#[derive(Debug)]
struct StoredMessage {
    id: MessageId,
    channel_id: ChannelId,
    author_token: String,
    files: Vec<(String, Bytes)>,
    strip: Strip,
}

#[derive(Debug, Default)]
struct World {
    next_id: u64,
    url_version: u64,
    channels: Vec<ChannelId>,
    messages: HashMap<MessageId, StoredMessage>,
    hidden: HashSet<(String, ChannelId)>,
    login_failures: HashMap<String, usize>,
    send_failures: VecDeque<PlatformError>,
    fetch_failures: usize,
    fail_all_fetches: bool,
    drop_attachments: usize,
    probe_override: Option<u16>,
    download_failures: HashMap<String, usize>,
    download_delays: HashMap<String, Duration>,
    completed_downloads: Vec<String>,
    calls: Vec<MockCall>,
}

impl World {
    fn user_id(token: &str) -> String {
        format!("user-{token}")
    }

    fn url(&self, msg: &StoredMessage, filename: &str) -> String {
        format!(
            "{CDN_BASE}/{}/{}/{filename}?ex={}",
            msg.channel_id, msg.id, self.url_version
        )
    }

    fn visible(&self, token: &str, channel_id: &ChannelId) -> bool {
        self.channels.contains(channel_id)
            && !self.hidden.contains(&(token.to_owned(), channel_id.clone()))
    }

    fn render(&self, msg: &StoredMessage, viewer: &str) -> Message {
        let stripped = match msg.strip {
            Strip::None => false,
            Strip::ForNonAuthors => viewer != msg.author_token,
            Strip::All => true,
        };
        let attachments = if stripped {
            Vec::new()
        } else {
            msg.files
                .iter()
                .enumerate()
                .map(|(i, (name, data))| Attachment {
                    id: format!("{}-{i}", msg.id),
                    filename: name.clone(),
                    size: data.len() as u64,
                    url: self.url(msg, name),
                })
                .collect()
        };
        Message {
            id: msg.id.clone(),
            channel_id: msg.channel_id.clone(),
            author_id: Self::user_id(&msg.author_token),
            attachments,
        }
    }

    /// Resolve a CDN URL to its body, honouring expiry.
    fn blob(&self, url: &str) -> Option<Bytes> {
        let rest = url.strip_prefix(CDN_BASE)?.strip_prefix('/')?;
        let (path, query) = rest.split_once('?')?;
        let version: u64 = query.strip_prefix("ex=")?.parse().ok()?;
        if version != self.url_version {
            return None;
        }
        let mut parts = path.splitn(3, '/');
        let _channel = parts.next()?;
        let message_id = MessageId::new(parts.next()?);
        let filename = parts.next()?;
        let msg = self.messages.get(&message_id)?;
        if msg.strip == Strip::All {
            return None;
        }
        msg.files
            .iter()
            .find(|(name, _)| name == filename)
            .map(|(_, data)| data.clone())
    }
}

/// In-memory chat platform and CDN.
#[derive(Debug, Clone, Default)]
pub struct MockPlatform {
    world: Arc<Mutex<World>>,
    send_delay: Arc<Mutex<Option<Duration>>>,
    in_flight_sends: Arc<AtomicUsize>,
    peak_sends: Arc<AtomicUsize>,
}

impl MockPlatform {
    /// A platform with the given channels.
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ChannelId>,
    {
        let platform = Self::default();
        platform.world.lock().channels = channels.into_iter().map(Into::into).collect();
        platform
    }

    /// User id the mock assigns to `token`.
    pub fn user_id(token: &str) -> String {
        World::user_id(token)
    }

    // -- failure injection -------------------------------------------------

    /// Make the next `times` logins for `token` fail (`usize::MAX` for always).
    pub fn fail_logins(&self, token: &str, times: usize) {
        self.world.lock().login_failures.insert(token.to_owned(), times);
    }

    /// Queue errors returned by the next sends, one per call.
    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = PlatformError>) {
        self.world.lock().send_failures.extend(errors);
    }

    /// Make the next `times` message fetches fail with a connection error.
    pub fn fail_next_fetches(&self, times: usize) {
        self.world.lock().fetch_failures = times;
    }

    /// Make every message fetch fail.
    pub fn fail_all_fetches(&self, fail: bool) {
        self.world.lock().fail_all_fetches = fail;
    }

    /// Make the next `times` downloads of `url` fail with a connection error.
    pub fn fail_downloads(&self, url: &str, times: usize) {
        self.world
            .lock()
            .download_failures
            .insert(url.to_owned(), times);
    }

    /// Omit the last `count` attachments from the next send's response.
    pub fn drop_attachments_on_next_send(&self, count: usize) {
        self.world.lock().drop_attachments = count;
    }

    /// Hide `channel_id` from the bot with `token`.
    pub fn hide_channel(&self, token: &str, channel_id: impl Into<ChannelId>) {
        self.world
            .lock()
            .hidden
            .insert((token.to_owned(), channel_id.into()));
    }

    /// Hide a message's attachments from every bot except its author.
    pub fn strip_for_non_authors(&self, message_id: &MessageId) {
        if let Some(msg) = self.world.lock().messages.get_mut(message_id) {
            msg.strip = Strip::ForNonAuthors;
        }
    }

    /// Remove a message's attachments for everyone, CDN included.
    pub fn strip_attachments(&self, message_id: &MessageId) {
        if let Some(msg) = self.world.lock().messages.get_mut(message_id) {
            msg.strip = Strip::All;
        }
    }

    /// Delete a message out from under the engine.
    pub fn delete_externally(&self, message_id: &MessageId) {
        self.world.lock().messages.remove(message_id);
    }

    /// Hold every download of `url` for `delay` before answering.
    pub fn set_download_delay(&self, url: &str, delay: Duration) {
        self.world.lock().download_delays.insert(url.to_owned(), delay);
    }

    /// Invalidate every URL handed out so far.
    pub fn expire_urls(&self) {
        self.world.lock().url_version += 1;
    }

    /// Force every probe to return `status` (or restore real behaviour with `None`).
    pub fn override_probe_status(&self, status: Option<u16>) {
        self.world.lock().probe_override = status;
    }

    /// Delay every send by `delay`.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    // -- inspection --------------------------------------------------------

    /// URLs of successful downloads, in completion order.
    pub fn completed_downloads(&self) -> Vec<String> {
        self.world.lock().completed_downloads.clone()
    }

    /// Every call observed so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.world.lock().calls.clone()
    }

    /// Number of `send_files` calls that reached the platform.
    pub fn send_count(&self) -> usize {
        self.world
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, MockCall::Send { .. }))
            .count()
    }

    /// Highest number of sends observed in flight at once.
    pub fn peak_concurrent_sends(&self) -> usize {
        self.peak_sends.load(Ordering::SeqCst)
    }

    /// Number of live messages.
    pub fn message_count(&self) -> usize {
        self.world.lock().messages.len()
    }

    /// Whether a message still exists.
    pub fn has_message(&self, message_id: &MessageId) -> bool {
        self.world.lock().messages.contains_key(message_id)
    }

    /// Ids of live messages, sorted.
    pub fn message_ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<_> = self.world.lock().messages.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current view of a message as its author sees it.
    pub fn message(&self, message_id: &MessageId) -> Option<Message> {
        let world = self.world.lock();
        world
            .messages
            .get(message_id)
            .map(|m| world.render(m, &m.author_token))
    }

    /// Store a message directly, bypassing the client. Returns its rendered form.
    pub fn seed_message(
        &self,
        token: &str,
        channel_id: impl Into<ChannelId>,
        files: Vec<OutgoingFile>,
    ) -> Message {
        let mut world = self.world.lock();
        let channel_id = channel_id.into();
        Self::store(&mut world, token, &channel_id, files)
    }

    fn store(
        world: &mut World,
        token: &str,
        channel_id: &ChannelId,
        files: Vec<OutgoingFile>,
    ) -> Message {
        world.next_id += 1;
        let id = MessageId::new(format!("{}", 1_000_000 + world.next_id));
        let stored = StoredMessage {
            id: id.clone(),
            channel_id: channel_id.clone(),
            author_token: token.to_owned(),
            files: files.into_iter().map(|f| (f.filename, f.data)).collect(),
            strip: Strip::None,
        };
        let rendered = world.render(&stored, token);
        world.messages.insert(id, stored);
        rendered
    }
}

impl ClientFactory for MockPlatform {
    fn connect(&self, credential: &BotCredential) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        Ok(Arc::new(MockClient {
            platform: self.clone(),
            token: credential.token.expose_secret().clone(),
        }))
    }
}

/// One bot's view of a [`MockPlatform`].
#[derive(Debug, Clone)]
pub struct MockClient {
    platform: MockPlatform,
    token: String,
}

struct SendGuard<'a>(&'a AtomicUsize);

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PlatformClient for MockClient {
    async fn login(&self) -> Result<BotUser, PlatformError> {
        let mut world = self.platform.world.lock();
        world.calls.push(MockCall::Login {
            token: self.token.clone(),
        });
        if let Some(left) = world.login_failures.get_mut(&self.token)
            && *left > 0
        {
            if *left != usize::MAX {
                *left -= 1;
            }
            return Err(PlatformError::Unauthorized("401: Unauthorized".into()));
        }
        Ok(BotUser {
            id: World::user_id(&self.token),
            username: self.token.clone(),
        })
    }

    async fn get_channel(&self, channel_id: &ChannelId) -> Result<Channel, PlatformError> {
        let mut world = self.platform.world.lock();
        world.calls.push(MockCall::GetChannel {
            token: self.token.clone(),
            channel_id: channel_id.clone(),
        });
        if world.visible(&self.token, channel_id) {
            Ok(Channel {
                id: channel_id.clone(),
                name: None,
            })
        } else {
            Err(PlatformError::NotFound(format!("channel {channel_id}")))
        }
    }

    async fn send_files(
        &self,
        channel_id: &ChannelId,
        files: Vec<OutgoingFile>,
    ) -> Result<Message, PlatformError> {
        let in_flight = &self.platform.in_flight_sends;
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = SendGuard(in_flight);
        self.platform.peak_sends.fetch_max(now, Ordering::SeqCst);

        let delay = *self.platform.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut world = self.platform.world.lock();
        world.calls.push(MockCall::Send {
            token: self.token.clone(),
            channel_id: channel_id.clone(),
            filenames: files.iter().map(|f| f.filename.clone()).collect(),
        });
        if let Some(err) = world.send_failures.pop_front() {
            return Err(err);
        }
        if files.is_empty() || files.len() > MAX_ATTACHMENTS_PER_MESSAGE {
            return Err(PlatformError::Api {
                status: 400,
                message: "invalid attachment count".into(),
            });
        }
        if !world.visible(&self.token, channel_id) {
            return Err(PlatformError::Unauthorized("Missing Access".into()));
        }
        let mut message = MockPlatform::store(&mut world, &self.token, channel_id, files);
        let drop = std::mem::take(&mut world.drop_attachments);
        let keep = message.attachments.len().saturating_sub(drop);
        message.attachments.truncate(keep);
        Ok(message)
    }

    async fn fetch_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<Message, PlatformError> {
        let mut world = self.platform.world.lock();
        world.calls.push(MockCall::Fetch {
            token: self.token.clone(),
            channel_id: channel_id.clone(),
            message_id: message_id.clone(),
        });
        if world.fail_all_fetches {
            return Err(PlatformError::Connection("connection reset".into()));
        }
        if world.fetch_failures > 0 {
            world.fetch_failures -= 1;
            return Err(PlatformError::Connection("connection reset".into()));
        }
        if !world.visible(&self.token, channel_id) {
            return Err(PlatformError::Unauthorized("Missing Access".into()));
        }
        match world.messages.get(message_id) {
            Some(msg) if &msg.channel_id == channel_id => Ok(world.render(msg, &self.token)),
            _ => Err(PlatformError::NotFound("Unknown Message".into())),
        }
    }

    async fn bulk_delete(
        &self,
        channel_id: &ChannelId,
        message_ids: &[MessageId],
    ) -> Result<(), PlatformError> {
        let mut world = self.platform.world.lock();
        world.calls.push(MockCall::BulkDelete {
            token: self.token.clone(),
            channel_id: channel_id.clone(),
            message_ids: message_ids.to_vec(),
        });
        if message_ids.len() > BULK_DELETE_MAX {
            return Err(PlatformError::Configuration("too many ids".into()));
        }
        if !world.visible(&self.token, channel_id) {
            return Err(PlatformError::Unauthorized("Missing Access".into()));
        }
        let all_present = message_ids.iter().all(|id| {
            world
                .messages
                .get(id)
                .is_some_and(|m| &m.channel_id == channel_id)
        });
        if !all_present {
            return Err(PlatformError::NotFound("Unknown Message".into()));
        }
        for id in message_ids {
            world.messages.remove(id);
        }
        Ok(())
    }

    async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), PlatformError> {
        let mut world = self.platform.world.lock();
        world.calls.push(MockCall::Delete {
            token: self.token.clone(),
            channel_id: channel_id.clone(),
            message_id: message_id.clone(),
        });
        if !world.visible(&self.token, channel_id) {
            return Err(PlatformError::Unauthorized("Missing Access".into()));
        }
        match world.messages.get(message_id) {
            Some(msg) if &msg.channel_id == channel_id => {
                world.messages.remove(message_id);
                Ok(())
            }
            _ => Err(PlatformError::NotFound("Unknown Message".into())),
        }
    }
}

#[async_trait]
impl CdnClient for MockPlatform {
    async fn download(&self, url: &str) -> Result<Bytes, PlatformError> {
        let delay = {
            let mut world = self.world.lock();
            world.calls.push(MockCall::Download {
                url: url.to_owned(),
            });
            if let Some(left) = world.download_failures.get_mut(url)
                && *left > 0
            {
                *left -= 1;
                return Err(PlatformError::Connection("connection reset".into()));
            }
            world.download_delays.get(url).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut world = self.world.lock();
        let body = world
            .blob(url)
            .ok_or_else(|| PlatformError::NotFound(format!("attachment {url}")))?;
        world.completed_downloads.push(url.to_owned());
        Ok(body)
    }

    async fn probe(&self, url: &str, _timeout: Duration) -> Result<u16, PlatformError> {
        let mut world = self.world.lock();
        world.calls.push(MockCall::Probe {
            url: url.to_owned(),
        });
        if let Some(status) = world.probe_override {
            return Ok(status);
        }
        Ok(if world.blob(url).is_some() { 200 } else { 404 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(platform: &MockPlatform, token: &str) -> Arc<dyn PlatformClient> {
        platform.connect(&BotCredential::new(token)).unwrap()
    }

    fn files(names: &[&str]) -> Vec<OutgoingFile> {
        names
            .iter()
            .map(|n| OutgoingFile::new(*n, Bytes::from(n.as_bytes().to_vec())))
            .collect()
    }

    #[tokio::test]
    async fn send_then_fetch_and_download() {
        let platform = MockPlatform::new(["c1"]);
        let bot = client(&platform, "t1");
        let sent = bot
            .send_files(&ChannelId::new("c1"), files(&["a.part1", "a.part2"]))
            .await
            .unwrap();
        assert_eq!(sent.attachments.len(), 2);

        let fetched = bot
            .fetch_message(&ChannelId::new("c1"), &sent.id)
            .await
            .unwrap();
        assert_eq!(fetched, sent);
        let body = platform.download(&sent.attachments[1].url).await.unwrap();
        assert_eq!(&body[..], b"a.part2");
    }

    #[tokio::test]
    async fn expired_urls_stop_resolving_until_refetched() {
        let platform = MockPlatform::new(["c1"]);
        let bot = client(&platform, "t1");
        let sent = bot
            .send_files(&ChannelId::new("c1"), files(&["x"]))
            .await
            .unwrap();
        platform.expire_urls();
        let stale = &sent.attachments[0].url;
        assert!(platform.download(stale).await.unwrap_err().is_not_found());
        assert_eq!(platform.probe(stale, Duration::from_secs(1)).await.unwrap(), 404);

        let fresh = bot
            .fetch_message(&ChannelId::new("c1"), &sent.id)
            .await
            .unwrap();
        assert_ne!(&fresh.attachments[0].url, stale);
        assert_eq!(
            platform
                .probe(&fresh.attachments[0].url, Duration::from_secs(1))
                .await
                .unwrap(),
            200
        );
    }

    #[tokio::test]
    async fn failures_are_injected_in_order() {
        let platform = MockPlatform::new(["c1"]);
        platform.fail_next_sends([PlatformError::RateLimited {
            retry_after: Some(Duration::from_millis(10)),
        }]);
        let bot = client(&platform, "t1");
        assert!(matches!(
            bot.send_files(&ChannelId::new("c1"), files(&["a"])).await,
            Err(PlatformError::RateLimited { .. })
        ));
        assert!(bot.send_files(&ChannelId::new("c1"), files(&["a"])).await.is_ok());
        assert_eq!(platform.send_count(), 2);
    }

    #[tokio::test]
    async fn stripped_for_non_authors_only() {
        let platform = MockPlatform::new(["c1"]);
        let author = client(&platform, "author");
        let other = client(&platform, "other");
        let sent = author
            .send_files(&ChannelId::new("c1"), files(&["a"]))
            .await
            .unwrap();
        platform.strip_for_non_authors(&sent.id);

        let seen_by_other = other
            .fetch_message(&ChannelId::new("c1"), &sent.id)
            .await
            .unwrap();
        assert!(seen_by_other.attachments.is_empty());
        let seen_by_author = author
            .fetch_message(&ChannelId::new("c1"), &sent.id)
            .await
            .unwrap();
        assert_eq!(seen_by_author.attachments.len(), 1);
    }

    #[tokio::test]
    async fn bulk_delete_requires_all_ids_present() {
        let platform = MockPlatform::new(["c1"]);
        let bot = client(&platform, "t1");
        let a = bot.send_files(&ChannelId::new("c1"), files(&["a"])).await.unwrap();
        let b = bot.send_files(&ChannelId::new("c1"), files(&["b"])).await.unwrap();

        let err = bot
            .bulk_delete(
                &ChannelId::new("c1"),
                &[a.id.clone(), MessageId::new("nope")],
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(platform.message_count(), 2);

        bot.bulk_delete(&ChannelId::new("c1"), &[a.id, b.id])
            .await
            .unwrap();
        assert_eq!(platform.message_count(), 0);
    }

    #[tokio::test]
    async fn login_failures_count_down() {
        let platform = MockPlatform::new(["c1"]);
        platform.fail_logins("t1", 1);
        let bot = client(&platform, "t1");
        assert!(bot.login().await.is_err());
        let user = bot.login().await.unwrap();
        assert_eq!(user.id, MockPlatform::user_id("t1"));
    }
}
