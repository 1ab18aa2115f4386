//! Nonce store: at-most-once admission within a sliding replay window.
//!
//! The uniqueness domain is the `(keyid, nonce)` pair. Admission is atomic:
//! among any number of concurrent attempts for the same pair within the TTL,
//! exactly one observes [`Admission::Fresh`]. The trait keeps the engine
//! independent of the backend; the canonical distributed primitive is
//! set-if-absent-with-expiry against a shared fast store, and the in-memory
//! implementation here uses the same contract over a sharded map with a
//! periodic sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tracing::debug;

/// Outcome of a nonce admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting of this `(keyid, nonce)` pair within the window.
    Fresh,
    /// The pair was already admitted within its TTL.
    Replay,
}

/// Replay-prevention store.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Atomically admit `(keyid, nonce)` for `ttl`.
    async fn admit(&self, keyid: &str, nonce: &str, ttl: Duration) -> Admission;

    /// Drop every admitted nonce. Operational only: entries already admitted
    /// lose their replay protection.
    async fn clear(&self) -> usize;
}

/// In-memory nonce store over a sharded concurrent map.
///
/// Each entry holds its expiry instant. The map's per-shard entry lock makes
/// `admit` atomic per pair; a stale entry encountered during admission is
/// replaced in place, and a periodic sweep bounds memory between admissions.
#[derive(Debug, Default)]
pub struct MemoryNonceStore {
    entries: DashMap<String, Instant>,
}

impl MemoryNonceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Composite map key. NUL never appears in a keyid or nonce, so the
    /// separator cannot collide.
    fn key(keyid: &str, nonce: &str) -> String {
        format!("{keyid}\0{nonce}")
    }

    /// Evict expired entries. Called by the background sweep task.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, "Evicted expired nonces");
        }
    }

    /// Current number of tracked pairs (including not-yet-swept expired ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn the periodic sweep for `store`, returning the task handle.
    pub fn spawn_sweeper(
        store: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                store.evict_expired();
            }
        })
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn admit(&self, keyid: &str, nonce: &str, ttl: Duration) -> Admission {
        let now = Instant::now();
        match self.entries.entry(Self::key(keyid, nonce)) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    Admission::Replay
                } else {
                    // Expired entry: the window has passed, admit again
                    occupied.insert(now + ttl);
                    Admission::Fresh
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now + ttl);
                Admission::Fresh
            }
        }
    }

    async fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        debug!(count, "Nonce store cleared");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(600);

    #[tokio::test]
    async fn first_admission_is_fresh_second_is_replay() {
        let store = MemoryNonceStore::new();

        assert_eq!(store.admit("K1", "n1", TTL).await, Admission::Fresh);
        assert_eq!(store.admit("K1", "n1", TTL).await, Admission::Replay);
    }

    #[tokio::test]
    async fn uniqueness_domain_is_the_pair() {
        let store = MemoryNonceStore::new();
        store.admit("K1", "n1", TTL).await;

        // Same nonce under a different key is a different pair
        assert_eq!(store.admit("K2", "n1", TTL).await, Admission::Fresh);
        // Same key with a different nonce likewise
        assert_eq!(store.admit("K1", "n2", TTL).await, Admission::Fresh);
    }

    #[tokio::test]
    async fn expired_entry_admits_again() {
        let store = MemoryNonceStore::new();
        assert_eq!(
            store.admit("K1", "n1", Duration::ZERO).await,
            Admission::Fresh
        );
        // Zero TTL expires immediately
        assert_eq!(store.admit("K1", "n1", TTL).await, Admission::Fresh);
    }

    #[tokio::test]
    async fn exactly_one_of_many_concurrent_attempts_is_fresh() {
        // GIVEN: many tasks racing to admit the same pair
        let store = Arc::new(MemoryNonceStore::new());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.admit("K1", "contested", TTL).await
            }));
        }

        // WHEN: all complete
        let mut fresh = 0;
        for handle in handles {
            if handle.await.unwrap() == Admission::Fresh {
                fresh += 1;
            }
        }

        // THEN: exactly one observed Fresh
        assert_eq!(fresh, 1);
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired_entries() {
        let store = MemoryNonceStore::new();
        store.admit("K1", "short", Duration::ZERO).await;
        store.admit("K1", "long", TTL).await;
        assert_eq!(store.len(), 2);

        store.evict_expired();

        assert_eq!(store.len(), 1);
        // The surviving entry still replays
        assert_eq!(store.admit("K1", "long", TTL).await, Admission::Replay);
    }

    #[tokio::test]
    async fn clear_drops_all_and_reports_count() {
        let store = MemoryNonceStore::new();
        store.admit("K1", "a", TTL).await;
        store.admit("K1", "b", TTL).await;

        assert_eq!(store.clear().await, 2);
        assert!(store.is_empty());
        assert_eq!(store.admit("K1", "a", TTL).await, Admission::Fresh);
    }
}
