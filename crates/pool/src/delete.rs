use std::collections::BTreeMap;

use chatvault_core::{ChannelId, MessageId, MessageRef};
use chatvault_platform::{BULK_DELETE_MAX, BULK_DELETE_MIN};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::pool::ConnectionPool;

/// Outcome of [`ConnectionPool::bulk_delete`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    /// Messages removed by this call.
    pub deleted: usize,
    /// Messages every identity reported as already gone.
    pub already_gone: usize,
    /// Messages that could not be removed.
    pub failed: Vec<MessageRef>,
}

impl DeleteReport {
    /// Whether nothing is left behind.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl ConnectionPool {
    /// Delete messages wherever they are visible.
    ///
    /// Ids are grouped by channel and bulk-deleted in calls of at most
    /// [`BULK_DELETE_MAX`]; a failed call's ids move on to the next identity
    /// that can see the channel. Whatever is left is deleted one message at a
    /// time across every identity. Failures are logged and reported, never
    /// returned as errors.
    #[instrument(skip_all, fields(messages = refs.len()))]
    pub async fn bulk_delete(&self, refs: &[MessageRef]) -> DeleteReport {
        let mut report = DeleteReport::default();
        if refs.is_empty() {
            return report;
        }
        let Ok(conns) = self.connections() else {
            warn!("no ready connections, nothing deleted");
            report.failed = refs.to_vec();
            return report;
        };

        let mut by_channel: BTreeMap<&ChannelId, Vec<MessageId>> = BTreeMap::new();
        for r in refs {
            let ids = by_channel.entry(&r.channel_id).or_default();
            if !ids.contains(&r.message_id) {
                ids.push(r.message_id.clone());
            }
        }

        for (channel_id, ids) in by_channel {
            let readers: Vec<_> = conns.iter().filter(|c| c.can_see(channel_id)).collect();
            let mut remaining = ids;

            for conn in &readers {
                if remaining.len() < BULK_DELETE_MIN {
                    break;
                }
                let mut left_over = Vec::new();
                for batch in remaining.chunks(BULK_DELETE_MAX) {
                    if batch.len() < BULK_DELETE_MIN {
                        left_over.extend_from_slice(batch);
                        continue;
                    }
                    let _busy = conn.acquire();
                    let result = self
                        .inner
                        .retry
                        .run("bulk_delete", |_| conn.client().bulk_delete(channel_id, batch))
                        .await;
                    match result {
                        Ok(()) => report.deleted += batch.len(),
                        Err(e) => {
                            debug!(bot = conn.label(), channel = %channel_id, error = %e, "bulk delete failed, passing on");
                            left_over.extend_from_slice(batch);
                        }
                    }
                }
                remaining = left_over;
            }

            for message_id in remaining {
                let mut all_not_found = true;
                let mut deleted = false;
                for conn in &readers {
                    let _busy = conn.acquire();
                    let result = self
                        .inner
                        .retry
                        .run("delete_message", |_| {
                            conn.client().delete_message(channel_id, &message_id)
                        })
                        .await;
                    match result {
                        Ok(()) => {
                            deleted = true;
                            break;
                        }
                        Err(e) => {
                            if !e.is_not_found() {
                                all_not_found = false;
                            }
                            debug!(bot = conn.label(), message_id = %message_id, error = %e, "single delete failed");
                        }
                    }
                }
                if deleted {
                    report.deleted += 1;
                } else if all_not_found && !readers.is_empty() {
                    report.already_gone += 1;
                } else {
                    warn!(channel = %channel_id, message_id = %message_id, "message could not be deleted");
                    report.failed.push(MessageRef::new(channel_id.clone(), message_id));
                }
            }
        }

        info!(
            deleted = report.deleted,
            already_gone = report.already_gone,
            failed = report.failed.len(),
            "bulk delete finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chatvault_platform::{MockCall, MockPlatform};

    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::tests::{file, pool_with};

    fn config() -> PoolConfig {
        PoolConfig::new(["A"]).with_login_delay(Duration::ZERO)
    }

    fn seed(platform: &MockPlatform, count: usize) -> Vec<MessageRef> {
        (0..count)
            .map(|i| {
                let m = platform.seed_message("t1", "A", file(&format!("m{i}")));
                MessageRef::new(m.channel_id, m.id)
            })
            .collect()
    }

    fn bulk_sizes(platform: &MockPlatform) -> Vec<usize> {
        platform
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::BulkDelete { message_ids, .. } => Some(message_ids.len()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn large_deletes_are_split_into_capped_calls() {
        let platform = MockPlatform::new(["A"]);
        let pool = pool_with(&platform, &["t1"], config()).await;
        let refs = seed(&platform, 150);

        let report = pool.bulk_delete(&refs).await;
        assert_eq!(report.deleted, 150);
        assert!(report.is_clean());
        assert_eq!(bulk_sizes(&platform), vec![100, 50]);
        assert_eq!(platform.message_count(), 0);
    }

    #[tokio::test]
    async fn missing_ids_fall_back_to_single_deletes() {
        let platform = MockPlatform::new(["A"]);
        let pool = pool_with(&platform, &["t1"], config()).await;
        let mut refs = seed(&platform, 3);
        refs.push(MessageRef::new("A", "999"));

        let report = pool.bulk_delete(&refs).await;
        assert_eq!(report.deleted, 3);
        assert_eq!(report.already_gone, 1);
        assert!(report.is_clean());
        assert_eq!(platform.message_count(), 0);
    }

    #[tokio::test]
    async fn a_single_message_skips_bulk_delete() {
        let platform = MockPlatform::new(["A"]);
        let pool = pool_with(&platform, &["t1"], config()).await;
        let refs = seed(&platform, 1);

        let report = pool.bulk_delete(&refs).await;
        assert_eq!(report.deleted, 1);
        assert!(bulk_sizes(&platform).is_empty());
    }

    #[tokio::test]
    async fn undeletable_messages_are_reported_not_raised() {
        let platform = MockPlatform::new(["A"]);
        let pool = pool_with(&platform, &["t1"], config()).await;
        let refs = vec![MessageRef::new("elsewhere", "1"), MessageRef::new("elsewhere", "2")];

        let report = pool.bulk_delete(&refs).await;
        assert_eq!(report.deleted, 0);
        assert_eq!(report.failed, refs);
    }

    #[tokio::test]
    async fn duplicate_refs_are_deleted_once() {
        let platform = MockPlatform::new(["A"]);
        let pool = pool_with(&platform, &["t1"], config()).await;
        let mut refs = seed(&platform, 2);
        refs.push(refs[0].clone());

        let report = pool.bulk_delete(&refs).await;
        assert_eq!(report.deleted, 2);
        assert_eq!(bulk_sizes(&platform), vec![2]);
    }
}
