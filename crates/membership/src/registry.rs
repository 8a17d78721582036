use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Marker trait for `RegistryStore` errors.
pub trait RegistryError: Debug + Error + Send + Sync + 'static {}

/// Marker trait for `ChangeFeed` errors.
pub trait ChangeFeedError: Debug + Error + Send + Sync + 'static {}

/// Raw key-change notification as delivered by the store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyNotification {
    /// Pattern the subscription matched on.
    pub pattern: String,

    /// Channel the event arrived on (`__keyspace@<db>__:<key>`).
    pub channel: String,

    /// Event name (`set`, `del`, `expired`, `expire`, ...).
    pub message: String,
}

/// Command-connection surface of the shared key-value store.
///
/// All operations are retried with backoff inside the implementation; an
/// `Err` means a bounded retry budget was exhausted and the caller should
/// treat the request as failed (the monitor logs and waits for its next
/// tick).
#[async_trait]
pub trait RegistryStore: Clone + Send + Sync + 'static {
    /// The error type for store operations.
    type Error: RegistryError;

    /// Retrieves the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Self::Error>;

    /// Stores `value` under `key` with a time-to-live in seconds.
    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl_secs: u64)
    -> Result<(), Self::Error>;

    /// Refreshes the TTL of `key` without rewriting its value. Returns
    /// `false` when the key no longer exists.
    async fn refresh_ttl(&self, key: &str, ttl_secs: u64) -> Result<bool, Self::Error>;

    /// Deletes `key`.
    async fn del(&self, key: &str) -> Result<(), Self::Error>;

    /// Adds `member` to the set stored under `key`.
    async fn sadd(&self, key: &str, member: &str) -> Result<(), Self::Error>;

    /// Removes `members` from the set stored under `key`.
    async fn srem(&self, key: &str, members: &[String]) -> Result<(), Self::Error>;

    /// Returns all members of the set stored under `key`.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, Self::Error>;

    /// Bulk-reads `keys`. The result is position-aligned with `keys`;
    /// missing keys yield `None`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, Self::Error>;

    /// Verifies that the store is configured to emit the key-change
    /// notifications the monitor depends on, repairing the configuration
    /// once if it is not.
    ///
    /// Backends that always notify implement this as a no-op. An `Err` puts
    /// the monitor into degraded mode (periodic resynchronization only); it
    /// never aborts startup.
    async fn ensure_event_notifications(&self) -> Result<(), Self::Error>;
}

/// Subscription-connection surface of the shared key-value store.
///
/// Kept separate from [`RegistryStore`] because a store connection in
/// subscribe mode cannot issue arbitrary commands; implementations back the
/// two traits with two independent connections.
#[async_trait]
pub trait ChangeFeed: Clone + Send + Sync + 'static {
    /// The error type for feed operations.
    type Error: ChangeFeedError;

    /// Pattern-subscribes to key-change notifications.
    ///
    /// After any reconnect the implementation must resubscribe explicitly
    /// inside its own connect handshake; a blanket auto-resubscribe on a
    /// freshly failed-over connection can desynchronize the channel pattern.
    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<KeyNotification>, Self::Error>;

    /// Tears the active subscription down.
    async fn unsubscribe(&self) -> Result<(), Self::Error>;
}
