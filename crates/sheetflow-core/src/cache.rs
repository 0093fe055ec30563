//! Bounded TTL + LRU caches.
//!
//! `TtlLruCache` is the shared building block: a `DashMap` whose entries carry
//! an insertion instant, a TTL and an access tick. Reads never return an entry
//! at or past its TTL; inserts into a full cache drop expired entries first,
//! then the least recently used one. `ResultCache` layers operation-keyed
//! result caching on top of it for read-only operations.
//!
//! Timestamps use `tokio::time::Instant` so tests can pause the clock.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use sha2::{Digest, Sha256};
use sheetflow_types::operation::{Operation, OperationOutput};
use sheetflow_types::range::RangeKey;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// TtlLruCache
// ---------------------------------------------------------------------------

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    last_access: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Concurrent cache bounded by per-entry TTL and a maximum entry count.
///
/// Per-key mutation is linearizable (DashMap shard locks); eviction scans the
/// map, which is fine at the sizes the engine configures.
pub struct TtlLruCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    capacity: usize,
    clock: AtomicU64,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Fetch a live entry, refreshing its recency. Expired entries are removed.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            None => return None,
            Some(mut entry) => {
                if !entry.is_expired(now) {
                    entry.last_access = self.tick();
                    return Some(entry.value.clone());
                }
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Insert or replace an entry.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.make_room();
        }
        let entry = Entry {
            value,
            inserted_at: Instant::now(),
            ttl,
            last_access: self.tick(),
        };
        self.entries.insert(key, entry);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Keep only entries for which `keep` returns true.
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| keep(key, &entry.value));
        before.saturating_sub(self.entries.len())
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn make_room(&self) {
        if self.purge_expired() > 0 && self.entries.len() < self.capacity {
            return;
        }
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().last_access)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ResultCache
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct CachedResult {
    target: RangeKey,
    output: OperationOutput,
}

/// Result cache for read-only operations.
///
/// Keyed by (operation kind, hash of the resolved parameters). Entries are
/// dropped when a commit touches an overlapping range.
pub struct ResultCache {
    inner: TtlLruCache<String, CachedResult>,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: TtlLruCache::new(capacity),
        }
    }

    /// Cache key for a resolved operation: `<kind>:<sha256 of parameters>`.
    pub fn key_for(operation: &Operation) -> String {
        let params = json!({
            "target": operation.target,
            "kind": operation.kind,
        });
        let digest = Sha256::digest(params.to_string().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("{}:{hex}", operation.kind.name())
    }

    pub fn get(&self, operation: &Operation) -> Option<OperationOutput> {
        self.inner
            .get(&Self::key_for(operation))
            .map(|cached| cached.output)
    }

    pub fn insert(&self, operation: &Operation, output: OperationOutput, ttl: Duration) {
        let cached = CachedResult {
            target: operation.target.clone(),
            output,
        };
        self.inner.insert(Self::key_for(operation), cached, ttl);
    }

    /// Drop results whose range overlaps a range that was just written.
    pub fn invalidate_overlapping(&self, key: &RangeKey) -> usize {
        let removed = self.inner.retain(|_, cached| !cached.target.overlaps(key));
        if removed > 0 {
            tracing::debug!(range = %key, removed, "invalidated cached results");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.inner.len())
            .field("capacity", &self.inner.capacity())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
