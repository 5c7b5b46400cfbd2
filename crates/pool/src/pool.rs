use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chatvault_core::ChannelId;
use chatvault_executor::{RetryExecutor, RetryPolicy};
use chatvault_platform::{BotCredential, ClientFactory, Message, OutgoingFile};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::{PoolConfig, home_channel_index};
use crate::connection::{BotConnection, BotStatus};
use crate::error::PoolError;

/// A set of bot identities that share the storage workload.
///
/// Cheap to clone; clones share the same connections. Call
/// [`shutdown`](Self::shutdown) to stop background logins and release every
/// connection.
#[derive(Clone)]
pub struct ConnectionPool {
    pub(crate) inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) connections: RwLock<Vec<Arc<BotConnection>>>,
    cursor: AtomicUsize,
    pub(crate) retry: RetryExecutor,
    background: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("ready", &self.size())
            .field("channels", &self.inner.config.channel_ids)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Log in every credential and assign home channels.
    ///
    /// Identities log in one after another with `login_delay` between them.
    /// An identity that fails keeps retrying in the background on a fixed
    /// backoff without holding up the others. Returns once at least one
    /// identity is ready.
    #[instrument(skip_all, fields(bots = credentials.len(), channels = config.channel_ids.len()))]
    pub async fn init(
        factory: Arc<dyn ClientFactory>,
        credentials: Vec<BotCredential>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        if credentials.is_empty() {
            return Err(PoolError::NoCredentials);
        }
        if config.channel_ids.is_empty() {
            return Err(PoolError::NoChannels);
        }

        let inner = Arc::new(PoolInner {
            retry: RetryExecutor::new(config.retry.clone()),
            config,
            connections: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            background: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        });

        let bot_count = credentials.len();
        for (index, credential) in credentials.into_iter().enumerate() {
            if index > 0 && !inner.config.login_delay.is_zero() {
                tokio::time::sleep(inner.config.login_delay).await;
            }
            match connect_one(&*factory, &inner.config, &credential, index, bot_count).await {
                Ok(conn) => {
                    info!(
                        bot = conn.label(),
                        home = %conn.home_channel(),
                        visible = conn.visible_channels().len(),
                        "bot ready"
                    );
                    inner.add(conn);
                }
                Err(e) => {
                    warn!(bot = index, error = %e, "bot failed to start, retrying in background");
                    let task_inner = Arc::clone(&inner);
                    let task_factory = Arc::clone(&factory);
                    inner.background.lock().spawn(async move {
                        retry_identity(task_inner, task_factory, credential, index, bot_count)
                            .await;
                    });
                }
            }
        }

        if inner.connections.read().is_empty() {
            // Nothing came up on the first pass: wait on the background retries.
            let mut pending = std::mem::take(&mut *inner.background.lock());
            while pending.join_next().await.is_some() {
                if !inner.connections.read().is_empty() {
                    break;
                }
            }
            *inner.background.lock() = pending;
        }

        let ready = inner.connections.read().len();
        if ready == 0 {
            return Err(PoolError::NoReadyConnections);
        }
        info!(ready, total = bot_count, "connection pool ready");
        Ok(Self { inner })
    }

    /// Number of ready identities.
    pub fn size(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Snapshot of the ready connections, failing fast when there are none.
    pub fn connections(&self) -> Result<Vec<Arc<BotConnection>>, PoolError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PoolError::NoReadyConnections);
        }
        let conns = self.inner.connections.read().clone();
        if conns.is_empty() {
            return Err(PoolError::NoReadyConnections);
        }
        Ok(conns)
    }

    /// Per-identity load and channel report.
    pub fn status(&self) -> Vec<BotStatus> {
        self.inner
            .connections
            .read()
            .iter()
            .map(|c| c.status())
            .collect()
    }

    /// Stop background logins and drop every connection.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.background.lock().abort_all();
        let dropped = std::mem::take(&mut *self.inner.connections.write()).len();
        info!(dropped, "connection pool shut down");
    }

    /// The pool's retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        self.inner.retry.policy()
    }

    /// Pick the least-busy connection; ties go round robin.
    pub fn select(&self) -> Result<Arc<BotConnection>, PoolError> {
        let conns = self.connections()?;
        let start = self.inner.next_cursor();
        Ok(least_busy(&conns, start, |_| true)
            .map(|i| Arc::clone(&conns[i]))
            .unwrap_or_else(|| Arc::clone(&conns[start % conns.len()])))
    }

    /// Least-busy connection that can read `channel_id`.
    pub fn select_for_channel(&self, channel_id: &ChannelId) -> Option<Arc<BotConnection>> {
        let conns = self.connections().ok()?;
        let start = self.inner.next_cursor();
        least_busy(&conns, start, |i| conns[i].can_see(channel_id)).map(|i| Arc::clone(&conns[i]))
    }

    /// Post `files` as one message through the least-busy identity.
    pub async fn send(&self, files: Vec<OutgoingFile>) -> Result<Message, PoolError> {
        let conn = self.select()?;
        let _busy = conn.acquire();
        self.send_on(&conn, files).await
    }

    /// Post `files` to `conn`'s home channel with retries.
    ///
    /// The caller is responsible for the busy count.
    pub async fn send_on(
        &self,
        conn: &BotConnection,
        files: Vec<OutgoingFile>,
    ) -> Result<Message, PoolError> {
        let channel = conn.home_channel().clone();
        let message = self
            .inner
            .retry
            .run("send_files", |attempt| {
                let files = files.clone();
                let channel = &channel;
                async move {
                    if attempt > 1 {
                        debug!(bot = conn.label(), attempt, "resending batch");
                    }
                    conn.client().send_files(channel, files).await
                }
            })
            .await?;
        Ok(message)
    }

    /// Run `jobs` across the pool, at most one per identity at a time.
    ///
    /// While both free identities and pending jobs remain, the least-busy
    /// free identity takes the next job; whenever a job finishes its identity
    /// is free again. Results come back in job order.
    ///
    /// On the first error no further jobs are started, jobs already running
    /// are allowed to finish, and then that error is returned.
    #[instrument(skip_all, fields(jobs = jobs.len()))]
    pub async fn dispatch_parallel<T, R, E, F, Fut>(&self, jobs: Vec<T>, run: F) -> Result<Vec<R>, E>
    where
        E: From<PoolError> + std::fmt::Display,
        F: Fn(Arc<BotConnection>, T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let conns = self.connections()?;
        let total = jobs.len();
        let mut pending: VecDeque<(usize, T)> = jobs.into_iter().enumerate().collect();
        let mut free = vec![true; conns.len()];
        let mut in_flight = FuturesUnordered::new();
        let mut results: Vec<(usize, R)> = Vec::with_capacity(total);
        let mut first_error: Option<E> = None;

        loop {
            while first_error.is_none() && !pending.is_empty() {
                let start = self.inner.next_cursor();
                let Some(slot) = least_busy(&conns, start, |i| free[i]) else {
                    break;
                };
                let Some((job_index, job)) = pending.pop_front() else {
                    break;
                };
                free[slot] = false;
                let conn = Arc::clone(&conns[slot]);
                let busy = conn.acquire();
                let fut = run(conn, job);
                in_flight.push(async move {
                    let result = fut.await;
                    drop(busy);
                    (slot, job_index, result)
                });
            }

            let Some((slot, job_index, result)) = in_flight.next().await else {
                break;
            };
            free[slot] = true;
            match result {
                Ok(value) => results.push((job_index, value)),
                Err(e) => {
                    if first_error.is_none() {
                        warn!(job = job_index, error = %e, "dispatch job failed, draining in-flight work");
                        first_error = Some(e);
                    } else {
                        debug!(job = job_index, error = %e, "additional dispatch failure");
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        results.sort_by_key(|(i, _)| *i);
        Ok(results.into_iter().map(|(_, r)| r).collect())
    }
}

impl PoolInner {
    fn next_cursor(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }

    fn add(&self, conn: BotConnection) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut conns = self.connections.write();
        conns.push(Arc::new(conn));
        conns.sort_by_key(|c| c.index());
    }
}

/// Index of the least-busy connection accepted by `filter`, scanning from
/// `start` so equal loads rotate.
pub(crate) fn least_busy<P>(conns: &[Arc<BotConnection>], start: usize, filter: P) -> Option<usize>
where
    P: Fn(usize) -> bool,
{
    let len = conns.len();
    (0..len)
        .map(|offset| (start + offset) % len)
        .filter(|&i| filter(i))
        .min_by_key(|&i| conns[i].busy())
}

async fn connect_one(
    factory: &dyn ClientFactory,
    config: &PoolConfig,
    credential: &BotCredential,
    index: usize,
    bot_count: usize,
) -> Result<BotConnection, PoolError> {
    let label = credential
        .label
        .clone()
        .unwrap_or_else(|| format!("bot-{}", index + 1));
    let client = factory.connect(credential)?;
    let user = client.login().await?;

    let mut visible = Vec::with_capacity(config.channel_ids.len());
    for channel_id in &config.channel_ids {
        match client.get_channel(channel_id).await {
            Ok(_) => visible.push(channel_id.clone()),
            Err(e) => debug!(bot = %label, channel = %channel_id, error = %e, "channel not visible"),
        }
    }

    let home_index = home_channel_index(
        index,
        bot_count,
        config.channel_ids.len(),
        config.bots_per_channel,
    );
    let home = config.channel_ids[home_index].clone();
    if !visible.contains(&home) {
        return Err(PoolError::HomeChannelUnavailable {
            bot: label,
            channel_id: home,
        });
    }
    Ok(BotConnection::new(index, label, user, client, home, visible))
}

async fn retry_identity(
    inner: Arc<PoolInner>,
    factory: Arc<dyn ClientFactory>,
    credential: BotCredential,
    index: usize,
    bot_count: usize,
) {
    let attempts = inner.config.init_max_attempts.max(1);
    for attempt in 2..=attempts {
        tokio::time::sleep(inner.config.init_backoff).await;
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        match connect_one(&*factory, &inner.config, &credential, index, bot_count).await {
            Ok(conn) => {
                info!(bot = conn.label(), attempt, "bot ready after retry");
                inner.add(conn);
                return;
            }
            Err(e) => warn!(bot = index, attempt, error = %e, "bot login retry failed"),
        }
    }
    warn!(bot = index, attempts, "bot gave up after exhausting login attempts");
}
