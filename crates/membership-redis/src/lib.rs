//! Redis-backed implementation of the membership registry.
//!
//! Two connections per registry, as the monitor's contract requires: a
//! multiplexed command connection with capped exponential reconnect backoff
//! for reads, writes, and index maintenance, and a dedicated pub/sub
//! connection for the keyspace notification subscription (a redis connection
//! in subscribe mode cannot issue arbitrary commands).
//!
//! Requires `notify-keyspace-events` to include the `g$xeK` classes; the
//! registry verifies the setting on startup and repairs it once when it can.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fleet_membership::{ChangeFeed, KeyNotification, RegistryStore};
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Notification classes the monitor depends on: generic commands, string
/// commands, expirations, evictions, plus keyspace-channel dispatch.
const REQUIRED_EVENT_FLAGS: &str = "g$xeK";

/// Reconnect backoff grows in steps of this many milliseconds.
const BACKOFF_STEP_MS: u64 = 500;

/// Reconnect backoff cap.
const BACKOFF_CAP_MS: u64 = 5_000;

/// Options for connecting a [`RedisRegistry`].
#[derive(Clone, Debug)]
pub struct RedisRegistryOptions {
    /// Redis endpoint, `redis://[:password@]host:port/db`.
    pub url: String,

    /// Timeout for establishing a connection.
    pub connection_timeout: Duration,

    /// Timeout for a single command round-trip.
    pub response_timeout: Duration,

    /// Retry budget per logical request before it is surfaced as a failure.
    pub retries: usize,
}

impl Default for RedisRegistryOptions {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            connection_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            retries: 6,
        }
    }
}

/// Redis-backed membership registry.
#[derive(Clone)]
pub struct RedisRegistry {
    client: redis::Client,
    conn: ConnectionManager,
    feed_shutdown: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl std::fmt::Debug for RedisRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRegistry")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl RedisRegistry {
    /// Connects the command connection.
    ///
    /// Reconnects after a drop use capped exponential backoff
    /// (`min(attempt * 500ms, 5s)`); a request that exhausts the retry
    /// budget fails back to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint URL is invalid or the initial
    /// connection cannot be established.
    pub async fn new(options: RedisRegistryOptions) -> Result<Self, Error> {
        let client = redis::Client::open(options.url.as_str())?;
        let config = ConnectionManagerConfig::new()
            .set_factor(BACKOFF_STEP_MS)
            .set_max_delay(BACKOFF_CAP_MS)
            .set_number_of_retries(options.retries)
            .set_connection_timeout(options.connection_timeout)
            .set_response_timeout(options.response_timeout);
        let conn = ConnectionManager::new_with_config(client.clone(), config).await?;

        Ok(Self {
            client,
            conn,
            feed_shutdown: Arc::new(Mutex::new(None)),
        })
    }
}

#[async_trait]
impl RegistryStore for RedisRegistry {
    type Error = Error;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Self::Error> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Bytes,
        ttl_secs: u64,
    ) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value.as_ref(), ttl_secs).await?;
        Ok(())
    }

    async fn refresh_ttl(&self, key: &str, ttl_secs: u64) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        let refreshed: bool = conn
            .expire(key, i64::try_from(ttl_secs).unwrap_or(i64::MAX))
            .await?;
        Ok(refreshed)
    }

    async fn del(&self, key: &str) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<(), Self::Error> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.srem(key, members).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Self::Error> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, Self::Error> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values
            .into_iter()
            .map(|value| value.map(Bytes::from))
            .collect())
    }

    async fn ensure_event_notifications(&self) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("notify-keyspace-events")
            .query_async(&mut conn)
            .await?;
        let current = reply.get(1).cloned().unwrap_or_default();

        match merged_event_flags(&current) {
            None => debug!(flags = %current, "keyspace notifications already enabled"),
            Some(merged) => {
                info!(from = %current, to = %merged, "enabling keyspace notifications");
                let _: () = redis::cmd("CONFIG")
                    .arg("SET")
                    .arg("notify-keyspace-events")
                    .arg(&merged)
                    .query_async(&mut conn)
                    .await?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for RedisRegistry {
    type Error = Error;

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<KeyNotification>, Self::Error> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let (tx, rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.feed_shutdown.lock().await.replace(shutdown_tx);

        let client = self.client.clone();
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut attempt: u64 = 0;
            loop {
                let disconnected = {
                    let mut stream = pubsub.on_message();
                    loop {
                        tokio::select! {
                            msg = stream.next() => match msg {
                                Some(msg) => {
                                    attempt = 0;
                                    let notification = KeyNotification {
                                        pattern: msg.get_pattern().unwrap_or_default(),
                                        channel: msg.get_channel_name().to_string(),
                                        message: msg.get_payload().unwrap_or_default(),
                                    };
                                    if tx.send(notification).await.is_err() {
                                        break false;
                                    }
                                }
                                None => break true,
                            },
                            _ = &mut shutdown_rx => break false,
                        }
                    }
                };

                if !disconnected {
                    let _ = pubsub.punsubscribe(&pattern).await;
                    return;
                }

                // Reconnect with capped backoff. Resubscribing happens here
                // and only here, as part of the fresh connect handshake.
                loop {
                    attempt += 1;
                    let delay = Duration::from_millis((attempt * BACKOFF_STEP_MS).min(BACKOFF_CAP_MS));
                    warn!(attempt, ?delay, "change feed disconnected, reconnecting");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = &mut shutdown_rx => return,
                    }
                    match client.get_async_pubsub().await {
                        Ok(mut fresh) => match fresh.psubscribe(&pattern).await {
                            Ok(()) => {
                                info!(%pattern, "change feed resubscribed");
                                pubsub = fresh;
                                break;
                            }
                            Err(e) => warn!("resubscribe failed: {e}"),
                        },
                        Err(e) => warn!("change feed reconnect failed: {e}"),
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<(), Self::Error> {
        if let Some(shutdown) = self.feed_shutdown.lock().await.take() {
            let _ = shutdown.send(());
        }
        Ok(())
    }
}

/// Returns the flag string to set when `current` lacks a required
/// notification class, or `None` when the configuration already suffices.
/// `A` is redis shorthand for every class flag, but never for the `K`
/// dispatch flag.
fn merged_event_flags(current: &str) -> Option<String> {
    let has_all_classes = current.contains('A');
    let missing: String = REQUIRED_EVENT_FLAGS
        .chars()
        .filter(|&flag| !(current.contains(flag) || (flag != 'K' && has_all_classes)))
        .collect();

    if missing.is_empty() {
        None
    } else {
        Some(format!("{current}{missing}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_config_gains_all_flags() {
        assert_eq!(merged_event_flags(""), Some("g$xeK".to_string()));
    }

    #[test]
    fn test_sufficient_config_is_left_alone() {
        assert_eq!(merged_event_flags("g$xeK"), None);
        assert_eq!(merged_event_flags("AK"), None);
        assert_eq!(merged_event_flags("Kg$xelshz"), None);
    }

    #[test]
    fn test_partial_config_is_merged() {
        assert_eq!(merged_event_flags("KE"), Some("KEg$xe".to_string()));
        assert_eq!(merged_event_flags("A"), Some("AK".to_string()));
        assert_eq!(merged_event_flags("gK"), Some("gK$xe".to_string()));
    }
}
