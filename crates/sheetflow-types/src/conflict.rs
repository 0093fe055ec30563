//! Version tracking and optimistic-concurrency conflict types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::range::RangeKey;

/// Last observed version of a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub key: RangeKey,
    /// Monotonically increasing per range key.
    pub version: u64,
    /// SHA-256 of the canonical JSON of the range content.
    pub checksum: String,
    /// When the content last changed, as far as this engine knows.
    pub last_modified: DateTime<Utc>,
    /// When the record was read or written into the cache.
    pub observed_at: DateTime<Utc>,
    /// How long the cached record stays valid.
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// How a detected conflict is disposed of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Apply the pending write unconditionally.
    Overwrite,
    /// Cell-level three-way merge of base, theirs, and ours.
    Merge,
    /// Drop the pending write.
    Cancel,
    /// Apply the pending write only if it is newer than theirs.
    LastWriteWins,
    /// Apply the pending write only if it is older than theirs.
    FirstWriteWins,
    /// Hand the conflict back to the caller without writing.
    #[default]
    Manual,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResolutionStrategy::Overwrite => "overwrite",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Cancel => "cancel",
            ResolutionStrategy::LastWriteWins => "last_write_wins",
            ResolutionStrategy::FirstWriteWins => "first_write_wins",
            ResolutionStrategy::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// What changed between the expected and the actual version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Divergence {
    /// The version moved but the content is identical.
    VersionOnly,
    /// Their edits do not touch the cells we are about to write.
    DisjointEdits,
    /// Their edits touch cells we are about to write.
    OverlappingEdits,
    /// The sheet disappeared or the range changed shape.
    Structural,
}

impl Divergence {
    pub fn severity(self) -> ConflictSeverity {
        match self {
            Divergence::VersionOnly => ConflictSeverity::Info,
            Divergence::DisjointEdits => ConflictSeverity::Warning,
            Divergence::OverlappingEdits => ConflictSeverity::Error,
            Divergence::Structural => ConflictSeverity::Critical,
        }
    }
}

/// A detected divergence between an expected and an actual range version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub key: RangeKey,
    pub expected_version: u64,
    pub actual_version: u64,
    pub severity: ConflictSeverity,
    pub divergence: Divergence,
    /// Strategy chosen or attempted, once resolution ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ResolutionStrategy>,
    /// A1 references of cells changed on both sides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overlapping_cells: Vec<String>,
    /// When their version was written.
    pub theirs_modified_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub message: String,
}
