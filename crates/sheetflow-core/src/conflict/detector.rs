//! Conflict detector: version checks, divergence classification, resolution.
//!
//! Versions are materialized lazily by reading the range through the snapshot
//! store. Every local commit or restore goes through `record_mutation`, which
//! bumps the ledger and invalidates overlapping cached records, so the next
//! check re-reads the remote content.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sheetflow_types::config::EngineConfig;
use sheetflow_types::conflict::{
    Conflict, ConflictSeverity, Divergence, ResolutionStrategy, VersionRecord,
};
use sheetflow_types::event::EngineEvent;
use sheetflow_types::operation::{Operation, OperationKind};
use sheetflow_types::range::{CellRange, Grid, RangeKey};

use crate::event::StatsSink;
use crate::store::BoxSnapshotStore;

use super::merge::{MergeOutcome, changed_cells, three_way_merge};
use super::version_cache::{VersionCache, VersionLedger};
use super::{ConflictError, checksum};

/// Overlapping cells listed in a conflict report.
const MAX_REPORTED_CELLS: usize = 50;

// ---------------------------------------------------------------------------
// Pending writes and resolutions
// ---------------------------------------------------------------------------

/// What a queued operation is about to do to the cells of its range.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    /// Overwrite these cells, anchored at the range's top-left corner.
    Cells(Grid),
    /// Touches cells anywhere in the range (clear, append, delete).
    Whole,
    /// Leaves cell values alone (read, format, chart).
    Untouched,
}

impl PendingWrite {
    pub fn for_operation(operation: &Operation) -> Self {
        match &operation.kind {
            OperationKind::WriteRange { values } => PendingWrite::Cells(values.clone()),
            OperationKind::AppendRows { .. }
            | OperationKind::ClearRange
            | OperationKind::DeleteSheet => PendingWrite::Whole,
            OperationKind::ReadRange
            | OperationKind::FormatRange { .. }
            | OperationKind::CreateChart { .. } => PendingWrite::Untouched,
        }
    }
}

/// Our side of a conflict.
#[derive(Debug, Clone)]
pub struct ResolutionInput {
    pub pending: PendingWrite,
    /// When our write was issued (enqueue time).
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Dispatch our write; `values` replaces the payload after a merge.
    Apply { values: Option<Grid> },
    /// Drop our write.
    Discard,
    /// Return the conflict to the caller without writing.
    Manual(Conflict),
}

impl Resolution {
    fn outcome(&self) -> &'static str {
        match self {
            Resolution::Apply { .. } => "applied",
            Resolution::Discard => "discarded",
            Resolution::Manual(_) => "manual",
        }
    }
}

// ---------------------------------------------------------------------------
// ConflictDetector
// ---------------------------------------------------------------------------

/// Per-range version tracking and optimistic-concurrency checks.
pub struct ConflictDetector {
    store: Arc<BoxSnapshotStore>,
    ledger: VersionLedger,
    cache: VersionCache,
    sink: Arc<dyn StatsSink>,
}

impl ConflictDetector {
    pub fn new(store: Arc<BoxSnapshotStore>, config: &EngineConfig, sink: Arc<dyn StatsSink>) -> Self {
        Self {
            store,
            ledger: VersionLedger::new(),
            cache: VersionCache::new(config.version_cache_max_entries, config.version_cache_ttl()),
            sink,
        }
    }

    /// Current version record for a range, reading remote state when the
    /// cached record is missing or expired.
    pub async fn check_version(&self, key: &RangeKey) -> Result<VersionRecord, ConflictError> {
        if let Some(record) = self.cache.get(key) {
            return Ok(record);
        }
        self.materialize(key).await.map(|(record, _)| record)
    }

    async fn materialize(&self, key: &RangeKey) -> Result<(VersionRecord, Arc<Grid>), ConflictError> {
        let content = self
            .store
            .read_range(key)
            .await
            .map_err(|source| ConflictError::Store {
                key: key.to_string(),
                source,
            })?;
        let sum = checksum(&content);
        let state = self.ledger.observe(key, content, sum);
        let record = VersionRecord {
            key: key.clone(),
            version: state.version,
            checksum: state.checksum,
            last_modified: state.last_modified,
            observed_at: Utc::now(),
            ttl_ms: self.cache.ttl().as_millis() as u64,
        };
        self.cache.insert(record.clone());

        let current = self
            .ledger
            .content_at(key, record.version)
            .unwrap_or_default();
        tracing::trace!(range = %key, version = record.version, "materialized version record");
        Ok((record, current))
    }

    /// Last known version without touching the remote.
    pub fn version_of(&self, key: &RangeKey) -> Option<u64> {
        self.ledger.version(key)
    }

    /// Content observed at a given version, if still retained.
    pub fn content_at(&self, key: &RangeKey, version: u64) -> Option<Arc<Grid>> {
        self.ledger.content_at(key, version)
    }

    /// Compare the expected version with the current one, assuming the
    /// pending write may touch any cell of the range.
    pub async fn detect_conflict(
        &self,
        key: &RangeKey,
        expected_version: u64,
    ) -> Result<Option<Conflict>, ConflictError> {
        self.detect_conflict_for(key, expected_version, &PendingWrite::Whole)
            .await
    }

    /// Compare the expected version with the current one and classify the
    /// divergence against what the pending write touches.
    pub async fn detect_conflict_for(
        &self,
        key: &RangeKey,
        expected_version: u64,
        pending: &PendingWrite,
    ) -> Result<Option<Conflict>, ConflictError> {
        let record = match self.check_version(key).await {
            Ok(record) => record,
            Err(ConflictError::Store { source, .. }) if source.is_structural() => {
                let actual = self.ledger.version(key).unwrap_or(expected_version);
                let conflict = Conflict {
                    key: key.clone(),
                    expected_version,
                    actual_version: actual,
                    severity: ConflictSeverity::Critical,
                    divergence: Divergence::Structural,
                    strategy: None,
                    overlapping_cells: Vec::new(),
                    theirs_modified_at: self.ledger.last_modified(key).unwrap_or_else(Utc::now),
                    detected_at: Utc::now(),
                    message: format!("range {key} is no longer addressable: {source}"),
                };
                self.report(&conflict);
                return Ok(Some(conflict));
            }
            Err(e) => return Err(e),
        };

        if record.version == expected_version {
            return Ok(None);
        }

        let theirs = match self.ledger.content_at(key, record.version) {
            Some(content) => content,
            None => self.materialize(key).await?.1,
        };
        let base = self.ledger.content_at(key, expected_version);

        let (divergence, overlapping) = classify(&key.range, base.as_deref(), &theirs, pending);
        let conflict = Conflict {
            key: key.clone(),
            expected_version,
            actual_version: record.version,
            severity: divergence.severity(),
            divergence,
            strategy: None,
            overlapping_cells: overlapping,
            theirs_modified_at: record.last_modified,
            detected_at: Utc::now(),
            message: format!(
                "range {key} moved from version {expected_version} to {}",
                record.version
            ),
        };
        self.report(&conflict);
        Ok(Some(conflict))
    }

    fn report(&self, conflict: &Conflict) {
        tracing::warn!(
            range = %conflict.key,
            expected = conflict.expected_version,
            actual = conflict.actual_version,
            severity = ?conflict.severity,
            "version conflict detected"
        );
        self.sink.record(EngineEvent::ConflictDetected {
            key: conflict.key.to_string(),
            expected_version: conflict.expected_version,
            actual_version: conflict.actual_version,
            severity: conflict.severity,
        });
    }

    /// Dispose of a conflict with the given strategy.
    ///
    /// Critical conflicts are never auto-applied: anything but `cancel`
    /// yields `Manual`.
    pub fn resolve(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
        ours: &ResolutionInput,
    ) -> Resolution {
        let mut attempted = conflict.clone();
        attempted.strategy = Some(strategy);

        let resolution = if conflict.severity == ConflictSeverity::Critical
            && strategy != ResolutionStrategy::Cancel
        {
            Resolution::Manual(attempted)
        } else {
            match strategy {
                ResolutionStrategy::Overwrite => Resolution::Apply { values: None },
                ResolutionStrategy::Cancel => Resolution::Discard,
                ResolutionStrategy::LastWriteWins => {
                    if ours.written_at > conflict.theirs_modified_at {
                        Resolution::Apply { values: None }
                    } else {
                        Resolution::Discard
                    }
                }
                ResolutionStrategy::FirstWriteWins => {
                    if ours.written_at < conflict.theirs_modified_at {
                        Resolution::Apply { values: None }
                    } else {
                        Resolution::Discard
                    }
                }
                ResolutionStrategy::Merge => self.merge(conflict, &ours.pending, attempted),
                ResolutionStrategy::Manual => Resolution::Manual(attempted),
            }
        };

        tracing::info!(
            range = %conflict.key,
            strategy = %strategy,
            outcome = resolution.outcome(),
            "conflict resolved"
        );
        self.sink.record(EngineEvent::ConflictResolved {
            key: conflict.key.to_string(),
            strategy,
            outcome: resolution.outcome().to_string(),
        });
        resolution
    }

    fn merge(&self, conflict: &Conflict, pending: &PendingWrite, attempted: Conflict) -> Resolution {
        let ours = match pending {
            PendingWrite::Untouched => return Resolution::Apply { values: None },
            PendingWrite::Whole => return Resolution::Manual(attempted),
            PendingWrite::Cells(ours) => ours,
        };
        let base = self.ledger.content_at(&conflict.key, conflict.expected_version);
        let theirs = self.ledger.content_at(&conflict.key, conflict.actual_version);
        let (Some(base), Some(theirs)) = (base, theirs) else {
            return Resolution::Manual(attempted);
        };

        match three_way_merge(&base, &theirs, ours) {
            MergeOutcome::Merged(values) => Resolution::Apply {
                values: Some(values),
            },
            MergeOutcome::Conflicted(cells) => {
                let mut attempted = attempted;
                attempted.overlapping_cells = to_refs(&conflict.key.range, &cells);
                attempted.message = format!(
                    "{} cell(s) changed to different values on both sides",
                    cells.len()
                );
                Resolution::Manual(attempted)
            }
        }
    }

    /// Record a local mutation of `key` (commit or restore).
    ///
    /// Bumps the version and drops cached records of every overlapping range
    /// so they are re-read on next use.
    pub fn record_mutation(&self, key: &RangeKey) -> u64 {
        let version = self.ledger.bump(key);
        let invalidated = self.cache.invalidate_overlapping(key);
        tracing::debug!(range = %key, version, invalidated, "recorded mutation");
        version
    }

    pub fn cached_records(&self) -> usize {
        self.cache.len()
    }
}

impl std::fmt::Debug for ConflictDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictDetector")
            .field("tracked", &self.ledger.len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

fn classify(
    range: &CellRange,
    base: Option<&Grid>,
    theirs: &Grid,
    pending: &PendingWrite,
) -> (Divergence, Vec<String>) {
    let Some(base) = base else {
        // No base content: we cannot tell which cells moved.
        return match pending {
            PendingWrite::Untouched => (Divergence::DisjointEdits, Vec::new()),
            _ => (Divergence::OverlappingEdits, Vec::new()),
        };
    };

    let changed = changed_cells(base, theirs);
    if changed.is_empty() {
        return (Divergence::VersionOnly, Vec::new());
    }

    let overlapping: Vec<(usize, usize)> = match pending {
        PendingWrite::Untouched => Vec::new(),
        PendingWrite::Whole => changed,
        PendingWrite::Cells(ours) => changed
            .into_iter()
            .filter(|&(row, col)| ours.get(row).is_some_and(|r| col < r.len()))
            .collect(),
    };

    if overlapping.is_empty() {
        (Divergence::DisjointEdits, Vec::new())
    } else {
        (Divergence::OverlappingEdits, to_refs(range, &overlapping))
    }
}

fn to_refs(range: &CellRange, cells: &[(usize, usize)]) -> Vec<String> {
    cells
        .iter()
        .take(MAX_REPORTED_CELLS)
        .map(|&(row, col)| {
            CellRange::cell_ref(range.start_row + row as u32, range.start_col + col as u32)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
