use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::directory::ServerDirectory;
use crate::error::Error;
use crate::event::{KeyEventKind, server_id_from_channel};
use crate::record::ServerRecord;
use crate::registry::{ChangeFeed, RegistryStore};

/// Default key prefix for per-server records.
pub const DEFAULT_PREFIX: &str = "fleet_monitor:";

/// Default key holding the membership index set. Deliberately outside
/// [`DEFAULT_PREFIX`] so index writes never wake the record subscription.
pub const DEFAULT_SET_KEY: &str = "fleet_servers";

const DEFAULT_PERIOD: Duration = Duration::from_secs(5);

/// How long `stop` waits for a background task to wind down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the membership monitor.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Interval between heartbeat and resynchronization passes.
    pub period: Duration,

    /// Record time-to-live. Defaults to `2 * period + 1s` when `None`, so a
    /// record survives one missed heartbeat but not two.
    pub expire: Option<Duration>,

    /// Key prefix for per-server records.
    pub prefix: String,

    /// Optional deployment namespace, appended to the prefix as
    /// `<prefix><namespace>:`.
    pub namespace: Option<String>,

    /// Set-typed key holding the membership index. Must not live under
    /// `prefix`.
    pub set_key: String,

    /// Store database index, part of the notification channel pattern.
    pub db: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            expire: None,
            prefix: DEFAULT_PREFIX.to_string(),
            namespace: None,
            set_key: DEFAULT_SET_KEY.to_string(),
            db: 0,
        }
    }
}

impl MonitorConfig {
    /// Effective record key prefix, namespace included.
    #[must_use]
    pub fn record_prefix(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}{}:", self.prefix, namespace),
            None => self.prefix.clone(),
        }
    }

    /// Channel pattern the change subscription watches.
    #[must_use]
    pub fn channel_pattern(&self) -> String {
        format!("__keyspace@{}__:{}*", self.db, self.record_prefix())
    }

    fn expire_secs(&self) -> u64 {
        self.expire
            .unwrap_or(self.period * 2 + Duration::from_secs(1))
            .as_secs()
            .max(1)
    }
}

/// Handles for the background tasks, teardown-ordered.
#[derive(Default)]
struct Tasks {
    sync_task: Option<JoinHandle<()>>,
    sync_shutdown: Option<oneshot::Sender<()>>,
    feed_task: Option<JoinHandle<()>>,
    feed_shutdown: Option<oneshot::Sender<()>>,
}

/// Membership monitor: publishes the local node's liveness record, keeps the
/// membership index, and reconciles the application's view of the cluster
/// with the store.
///
/// The view is only ever mutated by full resynchronization; change
/// notifications and the periodic timer both merely trigger one. Neither
/// path is authoritative alone; the store's current content always is.
pub struct MembershipMonitor<D, R, F>
where
    D: ServerDirectory,
    R: RegistryStore,
    F: ChangeFeed,
{
    directory: Arc<D>,
    store: R,
    feed: F,
    config: MonitorConfig,
    record_prefix: String,
    running: Arc<AtomicBool>,
    tasks: Arc<RwLock<Tasks>>,
}

impl<D, R, F> Clone for MembershipMonitor<D, R, F>
where
    D: ServerDirectory,
    R: RegistryStore,
    F: ChangeFeed,
{
    fn clone(&self) -> Self {
        Self {
            directory: Arc::clone(&self.directory),
            store: self.store.clone(),
            feed: self.feed.clone(),
            config: self.config.clone(),
            record_prefix: self.record_prefix.clone(),
            running: Arc::clone(&self.running),
            tasks: Arc::clone(&self.tasks),
        }
    }
}

impl<D, R, F> MembershipMonitor<D, R, F>
where
    D: ServerDirectory,
    R: RegistryStore,
    F: ChangeFeed,
{
    /// Creates a new monitor. Nothing touches the store until
    /// [`start`](Self::start).
    pub fn new(directory: Arc<D>, store: R, feed: F, config: MonitorConfig) -> Self {
        let record_prefix = config.record_prefix();
        Self {
            directory,
            store,
            feed,
            config,
            record_prefix,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(RwLock::new(Tasks::default())),
        }
    }

    /// Starts the monitor: one forced liveness write, one forced full
    /// resynchronization, then the periodic task and the change
    /// subscription.
    ///
    /// Resolves once the wiring is issued; it does **not** imply that the
    /// subscription handshake has completed or that the cluster view has
    /// converged. Callers should treat a started monitor as "accepting",
    /// with convergence following within one period.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] when the monitor is running. Store
    /// failures during startup are logged and degrade toward the periodic
    /// resynchronization; they do not fail `start`.
    pub async fn start(&self) -> Result<(), Error> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let server_id = self.directory.current_server().id;
        info!(%server_id, "starting membership monitor");

        if let Err(e) = self.store.ensure_event_notifications().await {
            error!(
                "change-notification configuration could not be verified, \
                 relying on periodic resynchronization only: {e}"
            );
        }

        self.publish_liveness(true).await;
        self.sync_servers().await;

        self.spawn_sync_task().await;
        self.spawn_feed_task().await;

        Ok(())
    }

    /// Stops the monitor: cancels the background tasks, unsubscribes, and
    /// removes this node's record and index entry from the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] when the monitor is not running.
    pub async fn stop(&self) -> Result<(), Error> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }

        let server_id = self.directory.current_server().id;
        info!(%server_id, "stopping membership monitor");

        {
            let mut tasks = self.tasks.write().await;
            if let Some(tx) = tasks.sync_shutdown.take() {
                let _ = tx.send(());
            }
            if let Some(tx) = tasks.feed_shutdown.take() {
                let _ = tx.send(());
            }
            for task in [tasks.sync_task.take(), tasks.feed_task.take()]
                .into_iter()
                .flatten()
            {
                match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("monitor task panicked during shutdown: {e}"),
                    Err(_) => warn!("monitor task did not shut down within timeout"),
                }
            }
        }

        if let Err(e) = self.feed.unsubscribe().await {
            warn!("unsubscribe failed: {e}");
        }

        // Record and index entry must be removed while the connections are
        // still open; afterwards the commands would be silently dropped.
        let key = self.record_key(&server_id);
        if let Err(e) = self.store.del(&key).await {
            warn!(%server_id, "failed to delete own record: {e}");
        }
        if let Err(e) = self
            .store
            .srem(&self.config.set_key, &[server_id.clone()])
            .await
        {
            warn!(%server_id, "failed to remove own id from index: {e}");
        }

        Ok(())
    }

    /// Whether the monitor is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The configuration the monitor was built with.
    #[must_use]
    pub const fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn record_key(&self, server_id: &str) -> String {
        format!("{}{}", self.record_prefix, server_id)
    }

    /// Writes or refreshes this node's liveness record.
    ///
    /// The full record (and the index entry) is written when no record is
    /// stored, when `force` is set, or when the stored state differs from
    /// the current one; otherwise only the TTL is refreshed, which keeps an
    /// unchanged heartbeat from waking every subscriber in the cluster.
    ///
    /// Store failures are logged; the next tick retries unconditionally.
    pub async fn publish_liveness(&self, force: bool) {
        let mut server = self.directory.current_server();
        server.state = self.directory.current_state();
        let server_id = server.id.clone();
        let key = self.record_key(&server_id);
        let expire = self.config.expire_secs();

        let stored = match self.store.get(&key).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(%server_id, "liveness read failed: {e}");
                return;
            }
        };

        let rewrite = force
            || match stored {
                None => true,
                Some(bytes) => match ServerRecord::try_from(bytes) {
                    Ok(stored) => stored.state != server.state,
                    Err(e) => {
                        warn!(%server_id, "own stored record is malformed, rewriting: {e}");
                        true
                    }
                },
            };

        if rewrite {
            let payload: Bytes = match server.clone().try_into() {
                Ok(payload) => payload,
                Err(e) => {
                    error!(%server_id, "failed to serialize own record: {e}");
                    return;
                }
            };
            if let Err(e) = self.store.set_with_ttl(&key, payload, expire).await {
                warn!(%server_id, "liveness write failed: {e}");
                return;
            }
            if let Err(e) = self.store.sadd(&self.config.set_key, &server_id).await {
                warn!(%server_id, "index add failed: {e}");
            }
            debug!(%server_id, state = ?server.state, "liveness record written");
        } else {
            match self.store.refresh_ttl(&key, expire).await {
                Ok(true) => {}
                // Expired between read and refresh; the next tick rewrites.
                Ok(false) => debug!(%server_id, "record gone before ttl refresh"),
                Err(e) => warn!(%server_id, "ttl refresh failed: {e}"),
            }
        }
    }

    /// Rebuilds the membership mapping from the store and replaces the
    /// application's view with it. Returns the new mapping, or `None` when
    /// the store could not be read (in which case the current view is left
    /// untouched rather than replaced with a partial one).
    pub async fn sync_servers(&self) -> Option<HashMap<String, ServerRecord>> {
        let servers = self.fetch_servers().await?;
        self.directory.replace_servers(servers.clone());
        Some(servers)
    }

    /// Reads the index, bulk-reads all records, and lazily evicts index
    /// entries whose record is missing or malformed.
    async fn fetch_servers(&self) -> Option<HashMap<String, ServerRecord>> {
        let ids = match self.store.smembers(&self.config.set_key).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("membership index read failed: {e}");
                return None;
            }
        };
        if ids.is_empty() {
            return Some(HashMap::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.record_key(id)).collect();
        let values = match self.store.mget(&keys).await {
            Ok(values) => values,
            Err(e) => {
                warn!("membership record read failed: {e}");
                return None;
            }
        };

        let mut servers = HashMap::with_capacity(ids.len());
        let mut stale = Vec::new();
        for (id, value) in ids.into_iter().zip(values) {
            match value {
                Some(bytes) => match ServerRecord::try_from(bytes) {
                    Ok(record) => {
                        servers.insert(id, record);
                    }
                    Err(e) => {
                        warn!(server_id = %id, "malformed record, evicting from index: {e}");
                        stale.push(id);
                    }
                },
                None => {
                    debug!(server_id = %id, "index entry without record, evicting");
                    stale.push(id);
                }
            }
        }

        if !stale.is_empty() {
            if let Err(e) = self.store.srem(&self.config.set_key, &stale).await {
                warn!("index eviction failed: {e}");
            }
        }

        Some(servers)
    }

    /// Reacts to one key-change notification.
    ///
    /// Every membership-relevant event funnels into a full
    /// resynchronization; the per-event assertions are sanity checks only
    /// and never abort reconciliation.
    async fn handle_notification(&self, channel: &str, message: &str) {
        let Some(server_id) = server_id_from_channel(channel, &self.record_prefix) else {
            debug!(%channel, "notification outside watched namespace ignored");
            return;
        };
        debug!(%server_id, change = %message, "key change");

        match KeyEventKind::classify(message) {
            KeyEventKind::Set => {
                info!(%server_id, "server added");
                if let Some(servers) = self.sync_servers().await {
                    if !servers.contains_key(server_id) {
                        warn!(%server_id, "server joined but is absent after resync");
                    }
                }
            }
            KeyEventKind::Del | KeyEventKind::Expired => {
                info!(%server_id, change = %message, "server removed");
                if self.guard_self_eviction(server_id).await {
                    return;
                }
                if let Some(servers) = self.sync_servers().await {
                    if servers.contains_key(server_id) {
                        warn!(%server_id, "server removed but still present after resync");
                    }
                }
            }
            KeyEventKind::Expire => {}
            KeyEventKind::Other(other) => {
                debug!(%channel, message = %other, "unhandled key event");
            }
        }
    }

    /// A removal notification naming the local node while the monitor is
    /// live means the store lost our record (flap, manual delete, missed
    /// heartbeat), not that we are gone: re-publish instead of evicting
    /// ourselves. Returns `true` when the event was absorbed.
    async fn guard_self_eviction(&self, server_id: &str) -> bool {
        if server_id != self.directory.current_server().id || !self.is_running() {
            return false;
        }
        error!(%server_id, "own record removed from store while still alive, re-publishing");
        self.publish_liveness(true).await;
        true
    }

    async fn spawn_sync_task(&self) {
        let monitor = self.clone();
        let period = self.config.period;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick is immediate and start() already did a forced
            // pass; swallow it.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !monitor.is_running() {
                            break;
                        }
                        monitor.publish_liveness(false).await;
                        monitor.sync_servers().await;
                    }
                    _ = &mut shutdown_rx => {
                        debug!("periodic sync task shutting down");
                        break;
                    }
                }
            }
        });

        let mut tasks = self.tasks.write().await;
        tasks.sync_task = Some(task);
        tasks.sync_shutdown = Some(shutdown_tx);
    }

    async fn spawn_feed_task(&self) {
        let monitor = self.clone();
        let pattern = self.config.channel_pattern();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut events = match monitor.feed.subscribe(&pattern).await {
                Ok(events) => events,
                Err(e) => {
                    error!(
                        %pattern,
                        "subscription failed, relying on periodic resynchronization only: {e}"
                    );
                    return;
                }
            };
            info!(%pattern, "change subscription active");

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => {
                            if !monitor.is_running() {
                                break;
                            }
                            monitor.handle_notification(&event.channel, &event.message).await;
                        }
                        None => {
                            if monitor.is_running() {
                                warn!(
                                    "change feed closed, relying on periodic \
                                     resynchronization only"
                                );
                            }
                            break;
                        }
                    },
                    _ = &mut shutdown_rx => {
                        debug!("change feed task shutting down");
                        break;
                    }
                }
            }
        });

        let mut tasks = self.tasks.write().await;
        tasks.feed_task = Some(task);
        tasks.feed_shutdown = Some(shutdown_tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_expire_covers_two_periods() {
        let config = MonitorConfig::default();

        assert_eq!(config.expire_secs(), 11);
    }

    #[test]
    fn test_explicit_expire_wins() {
        let config = MonitorConfig {
            expire: Some(Duration::from_secs(42)),
            ..MonitorConfig::default()
        };

        assert_eq!(config.expire_secs(), 42);
    }

    #[test]
    fn test_channel_pattern_includes_db_and_prefix() {
        let config = MonitorConfig {
            db: 3,
            ..MonitorConfig::default()
        };

        assert_eq!(config.channel_pattern(), "__keyspace@3__:fleet_monitor:*");
    }

    #[test]
    fn test_namespace_suffixes_prefix() {
        let config = MonitorConfig {
            namespace: Some("staging".to_string()),
            ..MonitorConfig::default()
        };

        assert_eq!(config.record_prefix(), "fleet_monitor:staging:");
        assert_eq!(
            config.channel_pattern(),
            "__keyspace@0__:fleet_monitor:staging:*"
        );
    }
}
