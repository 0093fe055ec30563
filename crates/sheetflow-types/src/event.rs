//! Structured events emitted by the engine.
//!
//! `EngineEvent` is what the statistics sink receives. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels. The engine does
//! not persist these itself.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conflict::{ConflictSeverity, ResolutionStrategy};
use crate::impact::ImpactSeverity;
use crate::transaction::TransactionHandle;
use crate::workflow::ExecutionStrategy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // -- Workflow lifecycle --
    WorkflowStarted {
        workflow_id: Uuid,
        operations: usize,
        levels: usize,
        strategy: ExecutionStrategy,
    },

    LevelStarted {
        workflow_id: Uuid,
        level: usize,
        operations: usize,
    },

    WorkflowCompleted {
        workflow_id: Uuid,
        success: bool,
        duration_ms: u64,
        succeeded: usize,
        failed: usize,
    },

    // -- Operation lifecycle --
    OperationStarted {
        workflow_id: Option<Uuid>,
        operation_id: String,
        kind: String,
        attempt: u32,
    },

    OperationCompleted {
        workflow_id: Option<Uuid>,
        operation_id: String,
        duration_ms: u64,
        from_cache: bool,
    },

    OperationFailed {
        workflow_id: Option<Uuid>,
        operation_id: String,
        error: String,
        will_retry: bool,
    },

    // -- Result cache --
    CacheHit {
        operation_id: String,
        kind: String,
    },

    CacheMiss {
        operation_id: String,
        kind: String,
    },

    // -- Conflicts --
    ConflictDetected {
        key: String,
        expected_version: u64,
        actual_version: u64,
        severity: ConflictSeverity,
    },

    ConflictResolved {
        key: String,
        strategy: ResolutionStrategy,
        /// `applied`, `discarded`, or `manual`.
        outcome: String,
    },

    // -- Transactions --
    TransactionBegun {
        transaction_id: TransactionHandle,
        ranges: usize,
        exclusive: bool,
    },

    TransactionCommitted {
        transaction_id: TransactionHandle,
        operations: usize,
        batches: usize,
        duration_ms: u64,
    },

    TransactionRolledBack {
        transaction_id: TransactionHandle,
        restored: usize,
        reason: String,
    },

    RollbackFailed {
        transaction_id: TransactionHandle,
        failed_ranges: Vec<String>,
    },

    // -- Impact --
    ImpactAssessed {
        operation_id: String,
        severity: ImpactSeverity,
        cells: u64,
        dependents: usize,
    },
}

impl EngineEvent {
    /// Snake-case variant name, matching the serde tag.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::WorkflowStarted { .. } => "workflow_started",
            EngineEvent::LevelStarted { .. } => "level_started",
            EngineEvent::WorkflowCompleted { .. } => "workflow_completed",
            EngineEvent::OperationStarted { .. } => "operation_started",
            EngineEvent::OperationCompleted { .. } => "operation_completed",
            EngineEvent::OperationFailed { .. } => "operation_failed",
            EngineEvent::CacheHit { .. } => "cache_hit",
            EngineEvent::CacheMiss { .. } => "cache_miss",
            EngineEvent::ConflictDetected { .. } => "conflict_detected",
            EngineEvent::ConflictResolved { .. } => "conflict_resolved",
            EngineEvent::TransactionBegun { .. } => "transaction_begun",
            EngineEvent::TransactionCommitted { .. } => "transaction_committed",
            EngineEvent::TransactionRolledBack { .. } => "transaction_rolled_back",
            EngineEvent::RollbackFailed { .. } => "rollback_failed",
            EngineEvent::ImpactAssessed { .. } => "impact_assessed",
        }
    }
}
