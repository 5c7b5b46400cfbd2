use std::sync::Arc;

use chatvault_core::{ChannelId, MessageId};
use chatvault_platform::{Message, PlatformError};
use tracing::{debug, instrument, warn};

use crate::connection::BotConnection;
use crate::error::PoolError;
use crate::pool::ConnectionPool;

impl ConnectionPool {
    /// Find a message by id.
    ///
    /// With a `channel_hint` the channel is asked directly first. Otherwise
    /// (or if that fails) one identity per configured channel is tried in
    /// turn. A message that comes back without attachments is re-read by its
    /// author and then by the other identities on that channel, since the
    /// platform sometimes hides attachments from non-authors.
    #[instrument(skip(self), fields(message_id = %message_id))]
    pub async fn fetch_message(
        &self,
        message_id: &MessageId,
        channel_hint: Option<&ChannelId>,
    ) -> Result<Message, PoolError> {
        let conns = self.connections()?;
        let mut last_error: Option<PoolError> = None;
        let mut all_not_found = true;

        if let Some(channel_id) = channel_hint {
            match self.fetch_in_channel(message_id, channel_id).await {
                Ok((message, conn)) => return Ok(self.with_attachments(message, &conn, &conns).await),
                Err(e) => {
                    all_not_found &= is_not_found(&e);
                    debug!(channel = %channel_id, error = %e, "hinted fetch failed, searching all channels");
                    last_error = Some(e);
                }
            }
        }

        for channel_id in &self.inner.config.channel_ids {
            if channel_hint == Some(channel_id) {
                continue;
            }
            match self.fetch_in_channel(message_id, channel_id).await {
                Ok((message, conn)) => return Ok(self.with_attachments(message, &conn, &conns).await),
                Err(e) => {
                    all_not_found &= is_not_found(&e);
                    debug!(channel = %channel_id, error = %e, "message not fetched from channel");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !all_not_found => Err(e),
            _ => Err(PoolError::MessageNotFound(message_id.clone())),
        }
    }

    async fn fetch_in_channel(
        &self,
        message_id: &MessageId,
        channel_id: &ChannelId,
    ) -> Result<(Message, Arc<BotConnection>), PoolError> {
        let conn = self.select_for_channel(channel_id).ok_or_else(|| {
            PoolError::Platform(PlatformError::NotFound(format!(
                "no identity can see channel {channel_id}"
            )))
        })?;
        let message = self.fetch_on(&conn, message_id, channel_id).await?;
        Ok((message, conn))
    }

    async fn fetch_on(
        &self,
        conn: &Arc<BotConnection>,
        message_id: &MessageId,
        channel_id: &ChannelId,
    ) -> Result<Message, PoolError> {
        let _busy = conn.acquire();
        let message = self
            .inner
            .retry
            .run("fetch_message", |_| conn.client().fetch_message(channel_id, message_id))
            .await?;
        Ok(message)
    }

    async fn with_attachments(
        &self,
        message: Message,
        fetched_by: &Arc<BotConnection>,
        conns: &[Arc<BotConnection>],
    ) -> Message {
        if !message.attachments.is_empty() {
            return message;
        }

        // Author first, then anyone else bound to the channel.
        let mut candidates: Vec<&Arc<BotConnection>> = conns
            .iter()
            .filter(|c| c.index() != fetched_by.index() && c.can_see(&message.channel_id))
            .collect();
        candidates.sort_by_key(|c| c.user().id != message.author_id);

        for conn in candidates {
            match self.fetch_on(conn, &message.id, &message.channel_id).await {
                Ok(refetched) if !refetched.attachments.is_empty() => {
                    debug!(bot = conn.label(), "attachments visible to another identity");
                    return refetched;
                }
                Ok(_) => {}
                Err(e) => debug!(bot = conn.label(), error = %e, "re-fetch for attachments failed"),
            }
        }
        warn!(message_id = %message.id, "message has no visible attachments");
        message
    }
}

fn is_not_found(e: &PoolError) -> bool {
    match e {
        PoolError::MessageNotFound(_) => true,
        PoolError::Platform(p) => p.is_not_found(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chatvault_executor::RetryPolicy;
    use chatvault_platform::{MockCall, MockPlatform};

    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::tests::{file, pool_with};

    fn config(channels: &[&str]) -> PoolConfig {
        PoolConfig::new(channels.iter().copied()).with_login_delay(Duration::ZERO)
    }

    fn fetches(platform: &MockPlatform) -> Vec<(String, ChannelId)> {
        platform
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Fetch {
                    token, channel_id, ..
                } => Some((token, channel_id)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn hinted_fetch_goes_straight_to_the_channel() {
        let platform = MockPlatform::new(["A", "B"]);
        let pool = pool_with(&platform, &["t1"], config(&["A", "B"])).await;
        let seeded = platform.seed_message("t1", "B", file("x.part1"));

        let message = pool
            .fetch_message(&seeded.id, Some(&ChannelId::new("B")))
            .await
            .unwrap();
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(fetches(&platform), vec![("t1".to_owned(), ChannelId::new("B"))]);
    }

    #[tokio::test]
    async fn unhinted_fetch_searches_every_channel() {
        let platform = MockPlatform::new(["A", "B"]);
        let pool = pool_with(&platform, &["t1", "t2"], config(&["A", "B"])).await;
        let seeded = platform.seed_message("t2", "B", file("x.part1"));

        let message = pool.fetch_message(&seeded.id, None).await.unwrap();
        assert_eq!(message.channel_id, ChannelId::new("B"));
        let channels: Vec<_> = fetches(&platform).into_iter().map(|(_, c)| c).collect();
        assert_eq!(channels, vec![ChannelId::new("A"), ChannelId::new("B")]);
    }

    #[tokio::test]
    async fn stripped_attachments_are_recovered_through_the_author() {
        let platform = MockPlatform::new(["A"]);
        let pool = pool_with(&platform, &["t1", "t2"], config(&["A"])).await;
        let seeded = platform.seed_message("t2", "A", file("x.part1"));
        platform.strip_for_non_authors(&seeded.id);

        // Keep the author busy so the first read goes through the other bot.
        let author = Arc::clone(&pool.connections().unwrap()[1]);
        let _busy = author.acquire();

        let message = pool
            .fetch_message(&seeded.id, Some(&ChannelId::new("A")))
            .await
            .unwrap();
        assert_eq!(message.attachments.len(), 1);
        let tokens: Vec<_> = fetches(&platform).into_iter().map(|(t, _)| t).collect();
        assert_eq!(tokens, vec!["t1".to_owned(), "t2".to_owned()]);
    }

    #[tokio::test]
    async fn missing_everywhere_is_message_not_found() {
        let platform = MockPlatform::new(["A", "B"]);
        let pool = pool_with(&platform, &["t1"], config(&["A", "B"])).await;

        let err = pool
            .fetch_message(&MessageId::new("404"), Some(&ChannelId::new("A")))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::MessageNotFound(_)));
        assert_eq!(fetches(&platform).len(), 2);
    }

    #[tokio::test]
    async fn network_failures_are_reported_as_such() {
        let platform = MockPlatform::new(["A"]);
        let pool = pool_with(
            &platform,
            &["t1"],
            config(&["A"]).with_retry(RetryPolicy::no_retry()),
        )
        .await;
        let seeded = platform.seed_message("t1", "A", file("x.part1"));
        platform.fail_all_fetches(true);

        let err = pool.fetch_message(&seeded.id, None).await.unwrap_err();
        assert!(matches!(err, PoolError::Platform(PlatformError::Connection(_))));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_fetch_failures_are_retried() {
        let platform = MockPlatform::new(["A"]);
        let pool = pool_with(&platform, &["t1"], config(&["A"])).await;
        let seeded = platform.seed_message("t1", "A", file("x.part1"));
        platform.fail_next_fetches(2);

        let message = pool.fetch_message(&seeded.id, None).await.unwrap();
        assert_eq!(message.id, seeded.id);
        assert_eq!(fetches(&platform).len(), 3);
    }
}
