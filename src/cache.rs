//! Bounded-TTL read-through cache of bucket snapshots.
//!
//! Snapshots served from the cache are never written back to the store and
//! never authoritative; callers accept staleness up to one TTL window.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};

use crate::window::now_ms;

type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

/// A bucket's contents as last read from the store.
pub type Snapshot = Arc<Vec<(String, u64)>>;

struct CacheEntry {
    snapshot: Snapshot,
    created_at: i64,
}

/// Maps serialized bucket keys to their last-read snapshot.
pub struct BucketCache {
    entries: DashMap<String, CacheEntry>,
    ttl_ms: i64,
}

impl BucketCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::default(),
            ttl_ms: ttl.as_millis() as i64,
        }
    }

    /// Returns the cached snapshot if it is younger than the TTL; a stale
    /// entry is dropped on the spot.
    pub fn get(&self, key: &str) -> Option<Snapshot> {
        let stale = match self.entries.get(key) {
            Some(entry) if now_ms() - entry.created_at < self.ttl_ms => {
                return Some(entry.snapshot.clone())
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            trace!("dropping stale cache entry {}", key);
            self.entries.remove(key);
        }
        None
    }

    pub fn put(&self, key: String, snapshot: Snapshot) {
        self.entries.insert(
            key,
            CacheEntry {
                snapshot,
                created_at: now_ms(),
            },
        );
    }

    /// Drops one entry regardless of age. Used when its bucket is evicted.
    pub(crate) fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Removes every entry older than the TTL.
    pub fn sweep(&self) {
        let horizon = now_ms() - self.ttl_ms;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.created_at > horizon);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!("cache sweep dropped {} stale entr(ies)", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Spawns the periodic sweep keeping cache memory bounded.
///
/// The interval is 10x the TTL, so the sweep stays cheap relative to entry
/// lifetime. The task runs until aborted.
pub(crate) fn spawn_sweeper(cache: Arc<BucketCache>, ttl: Duration) -> tokio::task::JoinHandle<()> {
    let period = ttl.checked_mul(10).unwrap_or(ttl).max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            cache.sweep();
        }
    })
}
