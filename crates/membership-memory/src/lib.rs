//! In-memory (single process) implementation of the membership registry for
//! local development and tests.
//!
//! Clones share state, so several monitors pointed at clones of one
//! `MemoryRegistry` behave like a cluster sharing one store. Records expire
//! on the tokio clock and emit the same keyspace-style notification triples
//! a real store would (`set`, `del`, `expire`, `expired`), which makes the
//! full notification-handling path testable without any server.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use fleet_membership::{ChangeFeed, KeyNotification, RegistryStore};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Duration, Instant};
use tracing::trace;

struct Entry {
    value: Bytes,
    deadline: Option<Instant>,
    generation: u64,
}

struct Subscriber {
    pattern: String,
    tx: mpsc::Sender<KeyNotification>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    sets: HashMap<String, BTreeSet<String>>,
    subscribers: Vec<Subscriber>,
    next_generation: u64,
}

struct Inner {
    db: u32,
    state: Mutex<State>,
    notifications: AtomicBool,
}

/// In-memory membership registry.
#[derive(Clone)]
pub struct MemoryRegistry {
    inner: Arc<Inner>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    /// Creates a new `MemoryRegistry` on database index 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_db(0)
    }

    /// Creates a new `MemoryRegistry` with the given database index, which
    /// only affects the notification channel names.
    #[must_use]
    pub fn with_db(db: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                state: Mutex::new(State::default()),
                notifications: AtomicBool::new(true),
            }),
        }
    }

    /// Enables or disables notification delivery. Disabling simulates a
    /// store that silently drops change events, for exercising the
    /// periodic-resynchronization fallback.
    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.inner.notifications.store(enabled, Ordering::SeqCst);
    }
}

impl Inner {
    fn channel(&self, key: &str) -> String {
        format!("__keyspace@{}__:{}", self.db, key)
    }

    /// Delivers a notification to every matching subscriber. Callers hold
    /// the state lock, so delivery must never block: events to a full or
    /// closed receiver are dropped, like a real pub/sub channel.
    fn publish(&self, state: &mut State, key: &str, message: &str) {
        if !self.notifications.load(Ordering::SeqCst) {
            return;
        }
        let channel = self.channel(key);
        state.subscribers.retain(|subscriber| {
            if !pattern_matches(&subscriber.pattern, &channel) {
                return !subscriber.tx.is_closed();
            }
            let notification = KeyNotification {
                pattern: subscriber.pattern.clone(),
                channel: channel.clone(),
                message: message.to_string(),
            };
            match subscriber.tx.try_send(notification) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(%channel, "subscriber full, dropping notification");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Removes `key` if its deadline has passed, emitting `expired` exactly
    /// like a store that expires keys lazily on access.
    fn evict_if_expired(&self, state: &mut State, key: &str) {
        let expired = state
            .entries
            .get(key)
            .and_then(|entry| entry.deadline)
            .is_some_and(|deadline| deadline <= Instant::now());
        if expired {
            state.entries.remove(key);
            self.publish(state, key, "expired");
        }
    }

    fn schedule_expiry(inner: &Arc<Self>, key: String, deadline: Instant, generation: u64) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut state = inner.state.lock().await;
            let still_current = state
                .entries
                .get(&key)
                .is_some_and(|entry| entry.generation == generation);
            if still_current {
                state.entries.remove(&key);
                inner.publish(&mut state, &key, "expired");
            }
        });
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistry {
    type Error = Error;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Self::Error> {
        let mut state = self.inner.state.lock().await;
        self.inner.evict_if_expired(&mut state, key);
        Ok(state.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Bytes,
        ttl_secs: u64,
    ) -> Result<(), Self::Error> {
        let deadline = Instant::now() + Duration::from_secs(ttl_secs);
        let mut state = self.inner.state.lock().await;
        state.next_generation += 1;
        let generation = state.next_generation;
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                deadline: Some(deadline),
                generation,
            },
        );
        self.inner.publish(&mut state, key, "set");
        Inner::schedule_expiry(&self.inner, key.to_string(), deadline, generation);
        Ok(())
    }

    async fn refresh_ttl(&self, key: &str, ttl_secs: u64) -> Result<bool, Self::Error> {
        let deadline = Instant::now() + Duration::from_secs(ttl_secs);
        let mut state = self.inner.state.lock().await;
        self.inner.evict_if_expired(&mut state, key);
        state.next_generation += 1;
        let generation = state.next_generation;
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(false);
        };
        entry.deadline = Some(deadline);
        entry.generation = generation;
        self.inner.publish(&mut state, key, "expire");
        Inner::schedule_expiry(&self.inner, key.to_string(), deadline, generation);
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), Self::Error> {
        let mut state = self.inner.state.lock().await;
        if state.entries.remove(key).is_some() {
            self.inner.publish(&mut state, key, "del");
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), Self::Error> {
        let mut state = self.inner.state.lock().await;
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<(), Self::Error> {
        let mut state = self.inner.state.lock().await;
        if let Some(set) = state.sets.get_mut(key) {
            for member in members {
                set.remove(member);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Self::Error> {
        let state = self.inner.state.lock().await;
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, Self::Error> {
        let mut state = self.inner.state.lock().await;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            self.inner.evict_if_expired(&mut state, key);
            values.push(state.entries.get(key).map(|entry| entry.value.clone()));
        }
        Ok(values)
    }

    async fn ensure_event_notifications(&self) -> Result<(), Self::Error> {
        // The memory registry always notifies.
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryRegistry {
    type Error = Error;

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<KeyNotification>, Self::Error> {
        let (tx, rx) = mpsc::channel(256);
        let mut state = self.inner.state.lock().await;
        state.subscribers.push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<(), Self::Error> {
        // Subscriptions end when their receiver is dropped; this only prunes
        // the dead senders.
        let mut state = self.inner.state.lock().await;
        state
            .subscribers
            .retain(|subscriber| !subscriber.tx.is_closed());
        Ok(())
    }
}

/// Glob-lite matching: a trailing `*` matches any suffix, anything else is
/// an exact comparison. That is all the keyspace patterns need.
fn pattern_matches(pattern: &str, channel: &str) -> bool {
    pattern.strip_suffix('*').map_or_else(
        || pattern == channel,
        |pattern_prefix| channel.starts_with(pattern_prefix),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let registry = MemoryRegistry::new();

        registry
            .set_with_ttl("k", Bytes::from_static(b"v"), 60)
            .await
            .unwrap();

        assert_eq!(
            registry.get("k").await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires_and_notifies() {
        let registry = MemoryRegistry::new();
        let mut events = registry.subscribe("__keyspace@0__:k*").await.unwrap();

        registry
            .set_with_ttl("k", Bytes::from_static(b"v"), 2)
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap().message, "set");

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(registry.get("k").await.unwrap(), None);
        assert_eq!(events.recv().await.unwrap().message, "expired");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_deadline() {
        let registry = MemoryRegistry::new();

        registry
            .set_with_ttl("k", Bytes::from_static(b"v"), 2)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(registry.refresh_ttl("k", 5).await.unwrap());
        tokio::time::sleep(Duration::from_secs(3)).await;

        // The original deadline has long passed; the refreshed one has not.
        assert!(registry.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_missing_key_reports_false() {
        let registry = MemoryRegistry::new();

        assert!(!registry.refresh_ttl("nope", 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_del_notifies_only_when_present() {
        let registry = MemoryRegistry::new();
        let mut events = registry.subscribe("__keyspace@0__:k*").await.unwrap();

        registry.del("k").await.unwrap();
        registry
            .set_with_ttl("k", Bytes::from_static(b"v"), 60)
            .await
            .unwrap();
        registry.del("k").await.unwrap();

        assert_eq!(events.recv().await.unwrap().message, "set");
        assert_eq!(events.recv().await.unwrap().message, "del");
    }

    #[tokio::test]
    async fn test_set_membership_round() {
        let registry = MemoryRegistry::new();

        registry.sadd("servers", "a").await.unwrap();
        registry.sadd("servers", "b").await.unwrap();
        registry.sadd("servers", "b").await.unwrap();
        registry
            .srem("servers", &["a".to_string()])
            .await
            .unwrap();

        assert_eq!(
            registry.smembers("servers").await.unwrap(),
            vec!["b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_mget_is_position_aligned() {
        let registry = MemoryRegistry::new();

        registry
            .set_with_ttl("a", Bytes::from_static(b"1"), 60)
            .await
            .unwrap();
        registry
            .set_with_ttl("c", Bytes::from_static(b"3"), 60)
            .await
            .unwrap();

        let values = registry
            .mget(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();

        assert_eq!(
            values,
            vec![
                Some(Bytes::from_static(b"1")),
                None,
                Some(Bytes::from_static(b"3")),
            ]
        );
    }

    #[tokio::test]
    async fn test_suppressed_notifications_are_dropped() {
        let registry = MemoryRegistry::new();
        let mut events = registry.subscribe("__keyspace@0__:k*").await.unwrap();

        registry.set_notifications_enabled(false);
        registry
            .set_with_ttl("k", Bytes::from_static(b"v"), 60)
            .await
            .unwrap();
        registry.set_notifications_enabled(true);
        registry.del("k").await.unwrap();

        // The suppressed `set` never arrives; the first event is the `del`.
        assert_eq!(events.recv().await.unwrap().message, "del");
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("__keyspace@0__:p:*", "__keyspace@0__:p:a"));
        assert!(pattern_matches("__keyspace@0__:p:a", "__keyspace@0__:p:a"));
        assert!(!pattern_matches("__keyspace@0__:p:*", "__keyspace@1__:p:a"));
        assert!(!pattern_matches("__keyspace@0__:p:a", "__keyspace@0__:p:b"));
    }
}
