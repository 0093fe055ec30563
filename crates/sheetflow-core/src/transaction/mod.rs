//! Transactions: scoped operation queues committed atomically with snapshot
//! rollback.
//!
//! - `scope` -- advisory locks for exclusive scopes
//! - `batch` -- commit batch planning
//! - `manager` -- `TransactionManager`: begin, enqueue, commit, rollback

pub mod batch;
pub mod manager;
pub mod scope;

pub use manager::{TransactionManager, TransactionOptions};

use sheetflow_types::conflict::Conflict;
use sheetflow_types::error::StoreError;
use sheetflow_types::range::RangeKey;
use sheetflow_types::transaction::{TransactionHandle, TransactionStatus};
use thiserror::Error;

use crate::conflict::ConflictError;
use crate::workflow::WorkflowError;

/// Errors from transaction lifecycle calls.
///
/// Dispatch failures are not errors: a commit that reaches dispatch returns a
/// `CommitResult` whose status tells whether it committed or rolled back.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransactionError {
    #[error("transaction {0} not found")]
    NotFound(TransactionHandle),

    #[error("transaction {id} is not active (status: {status})")]
    NotActive {
        id: TransactionHandle,
        status: TransactionStatus,
    },

    /// An overlapping exclusive scope is held. Retryable by the caller.
    #[error("scope unavailable: overlaps an active exclusive transaction")]
    ScopeUnavailable,

    #[error("operation '{operation_id}' targets {key}, outside the exclusive scope")]
    OutOfScope { operation_id: String, key: RangeKey },

    #[error("operation '{0}' is already queued in this transaction")]
    DuplicateOperation(String),

    #[error("invalid operation graph: {0}")]
    Graph(#[from] WorkflowError),

    /// Unresolved conflicts; nothing was dispatched.
    #[error("{} unresolved conflict(s); first on {}", .conflicts.len(), first_key(.conflicts))]
    Conflict { conflicts: Vec<Conflict> },

    #[error("failed to snapshot {key}: {error}")]
    Snapshot { key: RangeKey, error: StoreError },

    #[error("snapshot of transaction {0} has expired")]
    SnapshotExpired(TransactionHandle),

    #[error("transaction {id} is still {status}")]
    NotTerminal {
        id: TransactionHandle,
        status: TransactionStatus,
    },

    #[error(transparent)]
    Version(#[from] ConflictError),
}

impl TransactionError {
    /// Contention or transient reads the caller may retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransactionError::ScopeUnavailable => true,
            TransactionError::Snapshot { error, .. } => !error.is_structural(),
            TransactionError::Version(ConflictError::Store { source, .. }) => {
                !source.is_structural()
            }
            _ => false,
        }
    }
}

fn first_key(conflicts: &[Conflict]) -> String {
    conflicts
        .first()
        .map(|c| c.key.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_unavailable_is_retryable() {
        assert!(TransactionError::ScopeUnavailable.is_retryable());
        assert!(!TransactionError::DuplicateOperation("w".into()).is_retryable());
        let snap = TransactionError::Snapshot {
            key: RangeKey::parse("book", "S!A1").unwrap(),
            error: StoreError::Unavailable("503".into()),
        };
        assert!(snap.is_retryable());
    }

    #[test]
    fn conflict_display_names_first_range() {
        let err = TransactionError::Conflict { conflicts: vec![] };
        assert!(err.to_string().starts_with("0 unresolved"));
    }
}
