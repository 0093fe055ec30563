//! Transaction, snapshot, and commit result types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::conflict::Conflict;
use crate::range::{Grid, RangeKey, Scope};

/// Opaque handle to a transaction owned by one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionHandle(pub Uuid);

impl TransactionHandle {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TransactionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Active,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::RolledBack | TransactionStatus::Failed
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Active => "active",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled_back",
            TransactionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Pre-mutation content of one range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeSnapshot {
    pub key: RangeKey,
    pub values: Grid,
}

/// Pre-mutation content of every range a transaction touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub transaction_id: TransactionHandle,
    pub captured_at: DateTime<Utc>,
    pub ranges: Vec<RangeSnapshot>,
}

impl Snapshot {
    pub fn get(&self, key: &RangeKey) -> Option<&Grid> {
        self.ranges.iter().find(|r| &r.key == key).map(|r| &r.values)
    }
}

/// A range whose write-back failed during rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorationFailure {
    pub key: RangeKey,
    pub error: String,
}

/// The dispatch failure that triggered a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchFailure {
    pub operation_id: String,
    pub error: String,
    pub transient: bool,
}

/// Outcome of a commit that reached the dispatch phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitResult {
    pub transaction_id: TransactionHandle,
    pub status: TransactionStatus,
    /// Operations applied remotely, in dispatch order.
    pub applied: Vec<String>,
    /// Operations dropped by conflict resolution.
    #[serde(default)]
    pub discarded: Vec<String>,
    /// Number of remote dispatch calls.
    pub batches: usize,
    /// Executor payloads by operation ID.
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    /// Conflicts detected (and resolved) before dispatch.
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<DispatchFailure>,
    /// Ranges written back from the snapshot.
    #[serde(default)]
    pub restored: Vec<RangeKey>,
    #[serde(default)]
    pub restoration_failures: Vec<RestorationFailure>,
    pub duration_ms: u64,
}

impl CommitResult {
    pub fn is_committed(&self) -> bool {
        self.status == TransactionStatus::Committed
    }

    /// Rollback could not restore every range; manual repair may be needed.
    pub fn rollback_failed(&self) -> bool {
        !self.restoration_failures.is_empty()
    }
}

/// Outcome of an explicit rollback request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub transaction_id: TransactionHandle,
    pub status: TransactionStatus,
    pub restored: Vec<RangeKey>,
    pub failures: Vec<RestorationFailure>,
    /// The transaction was already rolled back; nothing was written.
    pub already_rolled_back: bool,
}

/// Read-only view of a transaction for status queries and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: TransactionHandle,
    pub status: TransactionStatus,
    pub scope: Scope,
    pub operations: Vec<String>,
    pub auto_rollback: bool,
    pub exclusive: bool,
    pub snapshot_retained: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
