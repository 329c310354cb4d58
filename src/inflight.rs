//! In-flight fetch tracker for cache-miss coalescing.
//!
//! Guarantees at most one outstanding origin fetch per `(shard, object)`
//! key. The first miss registers as the Fetcher and performs the fetch;
//! concurrent misses on the same key become Waiters subscribed to a
//! broadcast channel. When the Fetcher finishes it notifies every Waiter,
//! which then serves the result from the cache store. A cold cache under
//! concurrent load therefore produces one origin connection and one cache
//! write per object instead of a thundering herd.

use crate::protocol::ObjectName;
use crate::ProxyError;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Completion notification delivered to waiters. `Ok(())` means the entry
/// was fetched and published to the cache; `Err` carries the fetch error,
/// so a waiter can answer its client with the same failure class as the
/// fetcher (not-found vs transient).
pub type FetchOutcome = std::result::Result<(), ProxyError>;

/// Only the single completion notification is ever sent per flight.
const NOTIFY_CHANNEL_CAPACITY: usize = 1;

/// Tracks outstanding origin fetches keyed by `(shard, object)`.
pub struct FlightTracker {
    pending: Arc<DashMap<String, broadcast::Sender<FetchOutcome>>>,
}

/// Role assigned to a cache miss after registration.
pub enum FetchRole {
    /// First miss for this key; the holder must fetch and then call
    /// `complete_ok` or `complete_err` on the guard.
    Fetcher(FetchGuard),
    /// Another worker is already fetching; await its notification.
    Waiter(broadcast::Receiver<FetchOutcome>),
}

/// RAII guard held by the Fetcher. Removes the flight entry on drop, so a
/// panicked or cancelled fetch never wedges later requests for the key;
/// waiters observe the closed channel and fall back to their own fetch.
pub struct FetchGuard {
    flight_key: String,
    sender: broadcast::Sender<FetchOutcome>,
    pending: Arc<DashMap<String, broadcast::Sender<FetchOutcome>>>,
    completed: bool,
}

impl FlightTracker {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Flight key for an object within a shard's namespace.
    pub fn flight_key(shard: &str, name: &ObjectName) -> String {
        format!("{}/{}", shard, name)
    }

    /// Registers a miss for `key`, atomically deciding Fetcher vs Waiter.
    pub fn register(&self, key: &str) -> FetchRole {
        match self.pending.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, _rx) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
                vacant.insert(tx.clone());
                FetchRole::Fetcher(FetchGuard {
                    flight_key: key.to_string(),
                    sender: tx,
                    pending: Arc::clone(&self.pending),
                    completed: false,
                })
            }
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                FetchRole::Waiter(occupied.get().subscribe())
            }
        }
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

impl Default for FlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchGuard {
    /// Signals that the object was fetched and published to the cache.
    pub fn complete_ok(mut self) {
        self.completed = true;
        let _ = self.sender.send(Ok(()));
        self.pending.remove(&self.flight_key);
    }

    /// Signals that the fetch failed; waiters receive the error.
    pub fn complete_err(mut self, error: ProxyError) {
        self.completed = true;
        let _ = self.sender.send(Err(error));
        self.pending.remove(&self.flight_key);
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.pending.remove(&self.flight_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(shard: &str, name: &str) -> String {
        FlightTracker::flight_key(shard, &ObjectName::parse(name).unwrap())
    }

    #[test]
    fn test_first_register_is_fetcher() {
        let tracker = FlightTracker::new();
        let k = key("one", "index.html");

        let _guard = match tracker.register(&k) {
            FetchRole::Fetcher(guard) => guard,
            FetchRole::Waiter(_) => panic!("expected Fetcher"),
        };
        assert_eq!(tracker.in_flight(), 1);
    }

    #[test]
    fn test_second_register_is_waiter() {
        let tracker = FlightTracker::new();
        let k = key("one", "index.html");

        let _guard = match tracker.register(&k) {
            FetchRole::Fetcher(guard) => guard,
            FetchRole::Waiter(_) => panic!("expected Fetcher"),
        };
        assert!(matches!(tracker.register(&k), FetchRole::Waiter(_)));
        assert_eq!(tracker.in_flight(), 1);
    }

    #[test]
    fn test_same_object_different_shards_are_independent() {
        let tracker = FlightTracker::new();
        let _g1 = match tracker.register(&key("one", "a.txt")) {
            FetchRole::Fetcher(g) => g,
            FetchRole::Waiter(_) => panic!("expected Fetcher"),
        };
        let _g2 = match tracker.register(&key("two", "a.txt")) {
            FetchRole::Fetcher(g) => g,
            FetchRole::Waiter(_) => panic!("expected Fetcher"),
        };
        assert_eq!(tracker.in_flight(), 2);
    }

    #[test]
    fn test_completion_clears_entry() {
        let tracker = FlightTracker::new();
        let k = key("one", "a.txt");
        let guard = match tracker.register(&k) {
            FetchRole::Fetcher(g) => g,
            FetchRole::Waiter(_) => panic!("expected Fetcher"),
        };
        guard.complete_ok();
        assert_eq!(tracker.in_flight(), 0);
        assert!(matches!(tracker.register(&k), FetchRole::Fetcher(_)));
    }

    #[test]
    fn test_drop_without_completion_clears_entry() {
        let tracker = FlightTracker::new();
        let k = key("one", "a.txt");
        {
            let _guard = match tracker.register(&k) {
                FetchRole::Fetcher(g) => g,
                FetchRole::Waiter(_) => panic!("expected Fetcher"),
            };
        }
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_waiter_receives_ok() {
        let tracker = FlightTracker::new();
        let k = key("one", "a.txt");
        let guard = match tracker.register(&k) {
            FetchRole::Fetcher(g) => g,
            FetchRole::Waiter(_) => panic!("expected Fetcher"),
        };
        let mut rx = match tracker.register(&k) {
            FetchRole::Waiter(rx) => rx,
            FetchRole::Fetcher(_) => panic!("expected Waiter"),
        };

        tokio::spawn(async move {
            guard.complete_ok();
        });

        assert!(rx.recv().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_waiter_receives_error_message() {
        let tracker = FlightTracker::new();
        let k = key("one", "a.txt");
        let guard = match tracker.register(&k) {
            FetchRole::Fetcher(g) => g,
            FetchRole::Waiter(_) => panic!("expected Fetcher"),
        };
        let mut rx = match tracker.register(&k) {
            FetchRole::Waiter(rx) => rx,
            FetchRole::Fetcher(_) => panic!("expected Waiter"),
        };

        tokio::spawn(async move {
            guard.complete_err(ProxyError::FetchError("origin unreachable".to_string()));
        });

        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome, Err(ProxyError::FetchError(_))));
    }

    #[tokio::test]
    async fn test_waiter_detects_abandoned_fetch() {
        let tracker = FlightTracker::new();
        let k = key("one", "a.txt");
        let guard = match tracker.register(&k) {
            FetchRole::Fetcher(g) => g,
            FetchRole::Waiter(_) => panic!("expected Fetcher"),
        };
        let mut rx = match tracker.register(&k) {
            FetchRole::Waiter(rx) => rx,
            FetchRole::Fetcher(_) => panic!("expected Waiter"),
        };

        drop(guard);

        // Channel closes without a notification; the waiter falls back.
        assert!(rx.recv().await.is_err());
    }
}
