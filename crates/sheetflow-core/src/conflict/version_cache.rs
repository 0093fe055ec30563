//! Version ledger and version-record cache.
//!
//! Cached `VersionRecord`s expire on TTL or LRU pressure, but versions live in
//! a separate ledger that is never evicted, so re-materializing a record after
//! eviction cannot reset or reuse a version number. The ledger also keeps the
//! last few observed contents per key as merge bases.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sheetflow_types::conflict::VersionRecord;
use sheetflow_types::range::{Grid, RangeKey};

use crate::cache::TtlLruCache;

/// Observed contents kept per key for three-way merges.
pub const HISTORY_DEPTH: usize = 8;

// ---------------------------------------------------------------------------
// VersionLedger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LedgerEntry {
    version: u64,
    /// `None` right after a local mutation, until the new content is read.
    checksum: Option<String>,
    last_modified: DateTime<Utc>,
    history: VecDeque<(u64, Arc<Grid>)>,
}

impl LedgerEntry {
    fn remember(&mut self, version: u64, content: Arc<Grid>) {
        if let Some(slot) = self.history.iter_mut().find(|(v, _)| *v == version) {
            slot.1 = content;
            return;
        }
        if self.history.len() == HISTORY_DEPTH {
            self.history.pop_front();
        }
        self.history.push_back((version, content));
    }
}

/// What the ledger says about a key after an observation.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerState {
    pub version: u64,
    pub checksum: String,
    pub last_modified: DateTime<Utc>,
}

/// Monotonic per-key version numbers. Entries are never removed.
#[derive(Debug, Default)]
pub struct VersionLedger {
    entries: DashMap<RangeKey, LedgerEntry>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold freshly read remote content into the ledger.
    ///
    /// First observation starts at version 1. A checksum that differs from
    /// the last known one bumps the version; a pending checksum (after a local
    /// mutation) is filled in without bumping.
    pub fn observe(&self, key: &RangeKey, content: Grid, checksum: String) -> LedgerState {
        let content = Arc::new(content);
        let now = Utc::now();
        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| LedgerEntry {
            version: 0,
            checksum: None,
            last_modified: now,
            history: VecDeque::new(),
        });

        let known = entry.checksum.clone();
        match known.as_deref() {
            Some(known) if known == checksum => {}
            Some(_) => {
                entry.version += 1;
                entry.last_modified = now;
                entry.checksum = Some(checksum.clone());
            }
            None => {
                if entry.version == 0 {
                    entry.version = 1;
                }
                entry.checksum = Some(checksum.clone());
            }
        }

        let version = entry.version;
        entry.remember(version, content);

        LedgerState {
            version,
            checksum,
            last_modified: entry.last_modified,
        }
    }

    /// Record a local mutation: bump the version and mark the checksum stale.
    pub fn bump(&self, key: &RangeKey) -> u64 {
        let now = Utc::now();
        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| LedgerEntry {
            version: 0,
            checksum: None,
            last_modified: now,
            history: VecDeque::new(),
        });
        entry.version += 1;
        entry.checksum = None;
        entry.last_modified = now;
        entry.version
    }

    pub fn version(&self, key: &RangeKey) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.version)
    }

    pub fn last_modified(&self, key: &RangeKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|entry| entry.last_modified)
    }

    /// Content observed at `version`, if still in the history window.
    pub fn content_at(&self, key: &RangeKey, version: u64) -> Option<Arc<Grid>> {
        let entry = self.entries.get(key)?;
        entry
            .history
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, content)| Arc::clone(content))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// VersionCache
// ---------------------------------------------------------------------------

/// Bounded TTL + LRU cache of materialized version records.
pub struct VersionCache {
    records: TtlLruCache<RangeKey, VersionRecord>,
    ttl: Duration,
}

impl VersionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            records: TtlLruCache::new(capacity),
            ttl,
        }
    }

    pub fn get(&self, key: &RangeKey) -> Option<VersionRecord> {
        self.records.get(key)
    }

    pub fn insert(&self, record: VersionRecord) {
        self.records.insert(record.key.clone(), record, self.ttl);
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drop cached records for every range overlapping `key`.
    pub fn invalidate_overlapping(&self, key: &RangeKey) -> usize {
        self.records.retain(|cached, _| !cached.overlaps(key))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
