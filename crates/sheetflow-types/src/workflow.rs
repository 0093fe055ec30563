//! Workflow domain types.
//!
//! A `Workflow` is a dependency-annotated set of operations plus an execution
//! strategy. The builder in `sheetflow-core` validates the graph and fills in
//! the topological levels; execution produces a `WorkflowExecutionResult`
//! with one `OperationOutcome` per operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::impact::ImpactSeverity;
use crate::operation::Operation;
use crate::transaction::TransactionHandle;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// How the orchestrator schedules operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One operation at a time, in declared order.
    Sequential,
    /// Level by level, each level concurrently up to the ceiling.
    Parallel,
    /// Levels recomputed from the graph alone, maximal parallelism per level.
    #[default]
    Adaptive,
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionStrategy::Sequential => "sequential",
            ExecutionStrategy::Parallel => "parallel",
            ExecutionStrategy::Adaptive => "adaptive",
        };
        f.write_str(name)
    }
}

/// A validated workflow ready for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    /// Operations in declared order.
    pub operations: Vec<Operation>,
    pub strategy: ExecutionStrategy,
    pub max_concurrency: usize,
    pub timeout_ms: u64,
    /// Topological levels as indices into `operations`.
    pub levels: Vec<Vec<usize>>,
}

impl Workflow {
    /// Level index of an operation, if it belongs to this workflow.
    pub fn level_of(&self, operation_id: &str) -> Option<usize> {
        let idx = self.operations.iter().position(|op| op.id == operation_id)?;
        self.levels.iter().position(|level| level.contains(&idx))
    }

    pub fn operation(&self, operation_id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == operation_id)
    }
}

/// Opaque handle to a submitted workflow owned by one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowHandle(pub Uuid);

impl std::fmt::Display for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Execution results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Succeeded,
    Failed,
    /// Optional operation that failed; dependents still ran.
    Skipped,
    /// Never started because the workflow stopped first.
    Cancelled,
    /// Committed, then restored by workflow-level compensation.
    RolledBack,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
            OperationStatus::Skipped => "skipped",
            OperationStatus::Cancelled => "cancelled",
            OperationStatus::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// A failed attempt that was followed by a retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEvent {
    /// 1-based attempt that failed.
    pub attempt: u32,
    pub delay_ms: u64,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Per-operation result of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub operation_id: String,
    pub level: usize,
    pub status: OperationStatus,
    pub attempts: u32,
    #[serde(default)]
    pub retries: Vec<RetryEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<ImpactSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl OperationOutcome {
    /// Outcome for an operation that never started.
    pub fn cancelled(operation_id: impl Into<String>, level: usize, reason: &str) -> Self {
        Self {
            operation_id: operation_id.into(),
            level,
            status: OperationStatus::Cancelled,
            attempts: 0,
            retries: Vec::new(),
            output: None,
            error: Some(reason.to_string()),
            from_cache: false,
            transaction_id: None,
            impact: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Succeeded or skipped: dependents may proceed.
    pub fn allows_dependents(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Succeeded | OperationStatus::Skipped
        )
    }
}

/// Aggregate result of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionResult {
    pub workflow_id: Uuid,
    pub strategy: ExecutionStrategy,
    pub success: bool,
    /// Outcomes in declared operation order.
    pub outcomes: Vec<OperationOutcome>,
    pub levels_executed: usize,
    pub duration_ms: u64,
    /// Errors in the order they occurred.
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl WorkflowExecutionResult {
    pub fn outcome(&self, operation_id: &str) -> Option<&OperationOutcome> {
        self.outcomes.iter().find(|o| o.operation_id == operation_id)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &OperationOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OperationStatus::Succeeded)
    }
}
