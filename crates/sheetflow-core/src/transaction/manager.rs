//! Transaction manager: scoped queues, snapshot, batched dispatch, rollback.
//!
//! A transaction moves `Active -> Committed | RolledBack | Failed`. Commit
//! runs four phases under the transaction's lock:
//!
//! 1. Order the queue (stable topological order, cycles rejected).
//! 2. Check each operation's version expectation and resolve conflicts.
//! 3. Snapshot every range whose values the remaining operations change.
//! 4. Dispatch in batches; on failure, write the snapshot back for every range
//!    dispatched so far.
//!
//! Phases 1 to 3 make no remote writes, so errors there leave the workbook
//! untouched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use sheetflow_types::config::EngineConfig;
use sheetflow_types::conflict::{Conflict, ConflictSeverity};
use sheetflow_types::error::{BatchError, OperationError};
use sheetflow_types::event::EngineEvent;
use sheetflow_types::operation::{Operation, OperationKind, OperationOutput};
use sheetflow_types::range::{RangeKey, Scope};
use sheetflow_types::transaction::{
    CommitResult, DispatchFailure, RangeSnapshot, RestorationFailure, RollbackReport, Snapshot,
    TransactionHandle, TransactionInfo, TransactionStatus,
};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cache::ResultCache;
use crate::conflict::{ConflictDetector, ConflictError, PendingWrite, Resolution, ResolutionInput};
use crate::event::StatsSink;
use crate::executor::BoxOperationExecutor;
use crate::store::BoxSnapshotStore;
use crate::workflow::dag::{UnknownDependencies, stable_order};
use crate::workflow::{RetryPolicy, WorkflowError, validate_operation};

use super::TransactionError;
use super::batch::{plan_batches, sequential_batches};
use super::scope::ScopeLocks;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Parameters for `TransactionManager::begin`.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Ranges the transaction declares it will touch.
    pub scope: Scope,
    /// Restore the snapshot automatically when dispatch fails.
    pub auto_rollback: bool,
    /// Overrides `require_exclusive_scope` when set.
    pub exclusive: Option<bool>,
    /// Re-dispatch all-idempotent batches on transient failure.
    pub retry_idempotent_batches: bool,
    /// Drop a failing optional operation and keep dispatching. When unset
    /// the failure fails the commit like any other.
    pub discard_optional_failures: bool,
}

impl TransactionOptions {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            auto_rollback: true,
            exclusive: None,
            retry_idempotent_batches: true,
            discard_optional_failures: true,
        }
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = Some(exclusive);
        self
    }

    pub fn auto_rollback(mut self, auto_rollback: bool) -> Self {
        self.auto_rollback = auto_rollback;
        self
    }

    /// Leave transient-failure retries to the caller.
    pub fn without_batch_retry(mut self) -> Self {
        self.retry_idempotent_batches = false;
        self
    }

    /// Fail the commit when an optional operation fails.
    pub fn surface_optional_failures(mut self) -> Self {
        self.discard_optional_failures = false;
        self
    }
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self::new(Scope::default())
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct QueuedOperation {
    operation: Operation,
    written_at: DateTime<Utc>,
    expected_version: Option<u64>,
}

struct TransactionState {
    id: TransactionHandle,
    status: TransactionStatus,
    scope: Scope,
    exclusive: bool,
    auto_rollback: bool,
    retry_batches: bool,
    discard_optional: bool,
    queue: Vec<QueuedOperation>,
    snapshot: Option<Snapshot>,
    snapshot_taken_at: Option<Instant>,
    /// Ranges a rollback still has to write back.
    pending_restore: Vec<RangeKey>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TransactionState {
    fn finish(&mut self, status: TransactionStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    fn info(&self, retention: std::time::Duration) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            status: self.status,
            scope: self.scope.clone(),
            operations: self.queue.iter().map(|q| q.operation.id.clone()).collect(),
            auto_rollback: self.auto_rollback,
            exclusive: self.exclusive,
            snapshot_retained: self.snapshot.is_some() && !self.snapshot_expired(retention),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }

    fn snapshot_expired(&self, retention: std::time::Duration) -> bool {
        self.snapshot_taken_at
            .is_none_or(|taken| taken.elapsed() >= retention)
    }
}

/// Queue after ordering and conflict resolution.
#[derive(Default)]
struct Prepared {
    operations: Vec<Operation>,
    conflicts: Vec<Conflict>,
    discarded: Vec<String>,
}

#[derive(Default)]
struct DispatchOutcome {
    applied: Vec<String>,
    discarded: Vec<String>,
    outputs: HashMap<String, Value>,
    calls: usize,
    /// Value-changing ranges handed to the executor, in dispatch order.
    touched: Vec<RangeKey>,
    failure: Option<DispatchFailure>,
}

// ---------------------------------------------------------------------------
// TransactionManager
// ---------------------------------------------------------------------------

/// Owns every transaction begun through one engine instance.
pub struct TransactionManager {
    executor: Arc<BoxOperationExecutor>,
    store: Arc<BoxSnapshotStore>,
    detector: Arc<ConflictDetector>,
    results: Arc<ResultCache>,
    sink: Arc<dyn StatsSink>,
    config: EngineConfig,
    retry: RetryPolicy,
    locks: ScopeLocks,
    transactions: DashMap<TransactionHandle, Arc<Mutex<TransactionState>>>,
}

impl TransactionManager {
    pub fn new(
        executor: Arc<BoxOperationExecutor>,
        store: Arc<BoxSnapshotStore>,
        detector: Arc<ConflictDetector>,
        results: Arc<ResultCache>,
        config: &EngineConfig,
        sink: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            executor,
            store,
            detector,
            results,
            sink,
            config: config.clone(),
            retry: RetryPolicy::from_config(config),
            locks: ScopeLocks::new(),
            transactions: DashMap::new(),
        }
    }

    fn state(&self, id: TransactionHandle) -> Result<Arc<Mutex<TransactionState>>, TransactionError> {
        self.transactions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(TransactionError::NotFound(id))
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Open a transaction over `options.scope`.
    ///
    /// In exclusive mode the scope is locked for the transaction's lifetime;
    /// an overlapping holder that does not release within `scope_wait_ms`
    /// fails the call with `ScopeUnavailable`.
    pub async fn begin(&self, options: TransactionOptions) -> Result<TransactionHandle, TransactionError> {
        self.purge_expired();

        let id = TransactionHandle::new();
        let exclusive = options
            .exclusive
            .unwrap_or(self.config.require_exclusive_scope);

        if exclusive
            && !self
                .locks
                .acquire(id, &options.scope, self.config.scope_wait())
                .await
        {
            tracing::warn!(
                transaction_id = %id,
                ranges = options.scope.ranges.len(),
                "exclusive scope unavailable"
            );
            return Err(TransactionError::ScopeUnavailable);
        }

        let ranges = options.scope.ranges.len();
        let state = TransactionState {
            id,
            status: TransactionStatus::Active,
            scope: options.scope,
            exclusive,
            auto_rollback: options.auto_rollback,
            retry_batches: options.retry_idempotent_batches,
            discard_optional: options.discard_optional_failures,
            queue: Vec::new(),
            snapshot: None,
            snapshot_taken_at: None,
            pending_restore: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        };
        self.transactions.insert(id, Arc::new(Mutex::new(state)));

        tracing::info!(transaction_id = %id, ranges, exclusive, "transaction begun");
        self.sink.record(EngineEvent::TransactionBegun {
            transaction_id: id,
            ranges,
            exclusive,
        });
        Ok(id)
    }

    /// Queue a resolved operation.
    ///
    /// A mutating operation without an explicit `expected_version` expects the
    /// version observed now.
    pub async fn enqueue(&self, id: TransactionHandle, operation: Operation) -> Result<(), TransactionError> {
        let state = self.state(id)?;
        let mut state = state.lock().await;

        if state.status != TransactionStatus::Active {
            return Err(TransactionError::NotActive {
                id,
                status: state.status,
            });
        }
        if state.queue.iter().any(|q| q.operation.id == operation.id) {
            return Err(TransactionError::DuplicateOperation(operation.id));
        }
        validate_operation(&operation)?;
        if operation.has_unresolved() {
            return Err(WorkflowError::InvalidOperation {
                operation_id: operation.id,
                reason: "parameters must be resolved before enqueue".to_string(),
            }
            .into());
        }
        if state.exclusive && !state.scope.covers(&operation.target) {
            return Err(TransactionError::OutOfScope {
                operation_id: operation.id,
                key: operation.target,
            });
        }

        let expected_version = match operation.expected_version {
            Some(version) => Some(version),
            None if operation.is_mutating() => self.observed_version(&operation.target).await?,
            None => None,
        };

        if !state.exclusive {
            state.scope.widen(&operation.target);
        }
        tracing::debug!(
            transaction_id = %id,
            operation_id = %operation.id,
            range = %operation.target,
            expected_version,
            "operation enqueued"
        );
        state.queue.push(QueuedOperation {
            operation,
            written_at: Utc::now(),
            expected_version,
        });
        Ok(())
    }

    async fn observed_version(&self, key: &RangeKey) -> Result<Option<u64>, TransactionError> {
        match self.detector.check_version(key).await {
            Ok(record) => Ok(Some(record.version)),
            // Nothing there yet: the write creates it.
            Err(ConflictError::Store { source, .. }) if source.is_structural() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Commit the queue.
    ///
    /// Errors mean nothing was dispatched (status becomes `Failed`). Once
    /// dispatch starts the call returns a `CommitResult`: `Committed`, or
    /// `RolledBack` / `Failed` with the triggering failure and the outcome of
    /// every restoration.
    pub async fn commit(&self, id: TransactionHandle) -> Result<CommitResult, TransactionError> {
        let started = Instant::now();
        let state = self.state(id)?;
        let mut state = state.lock().await;

        if state.status != TransactionStatus::Active {
            return Err(TransactionError::NotActive {
                id,
                status: state.status,
            });
        }

        let prepared = match self.prepare(&state).await {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.abort(&mut state, e)),
        };
        let snapshot = match self.capture(id, &prepared.operations).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(self.abort(&mut state, e)),
        };

        let outcome = self
            .dispatch_all(id, &prepared.operations, state.retry_batches, state.discard_optional)
            .await;

        let mut discarded = prepared.discarded;
        discarded.extend(outcome.discarded);
        let mut result = CommitResult {
            transaction_id: id,
            status: TransactionStatus::Committed,
            applied: outcome.applied,
            discarded,
            batches: outcome.calls,
            outputs: outcome.outputs,
            conflicts: prepared.conflicts,
            failure: None,
            restored: Vec::new(),
            restoration_failures: Vec::new(),
            duration_ms: 0,
        };

        if let Some(failure) = outcome.failure {
            tracing::warn!(
                transaction_id = %id,
                operation_id = %failure.operation_id,
                error = %failure.error,
                "dispatch failed"
            );
            if state.auto_rollback {
                let (restored, failures) = self.restore(&snapshot, &outcome.touched).await;
                state.pending_restore = failures.iter().map(|f| f.key.clone()).collect();
                result.status = if failures.is_empty() {
                    TransactionStatus::RolledBack
                } else {
                    TransactionStatus::Failed
                };
                self.report_rollback(id, restored.len(), &failures, &failure.error);
                result.restored = restored;
                result.restoration_failures = failures;
            } else {
                for key in &outcome.touched {
                    self.mark_mutated(key);
                }
                state.pending_restore = outcome.touched;
                result.status = TransactionStatus::Failed;
            }
            result.failure = Some(failure);
        } else {
            let mut mutated: Vec<&RangeKey> = Vec::new();
            for op in prepared
                .operations
                .iter()
                .filter(|op| op.kind.changes_values() && result.applied.contains(&op.id))
            {
                if !mutated.contains(&&op.target) {
                    mutated.push(&op.target);
                }
            }
            for key in mutated {
                self.mark_mutated(key);
            }
        }

        state.snapshot = Some(snapshot);
        state.snapshot_taken_at = Some(Instant::now());
        state.finish(result.status);
        self.locks.release(id);

        result.duration_ms = started.elapsed().as_millis() as u64;
        if result.is_committed() {
            tracing::info!(
                transaction_id = %id,
                operations = result.applied.len(),
                batches = result.batches,
                duration_ms = result.duration_ms,
                "transaction committed"
            );
            self.sink.record(EngineEvent::TransactionCommitted {
                transaction_id: id,
                operations: result.applied.len(),
                batches: result.batches,
                duration_ms: result.duration_ms,
            });
        }
        Ok(result)
    }

    /// Undo a transaction. Idempotent.
    ///
    /// - active: the queue is dropped
    /// - committed: every snapshotted range is written back, if the snapshot
    ///   is still retained
    /// - failed: ranges that previously failed to restore are retried
    /// - rolled back: nothing happens
    pub async fn rollback(&self, id: TransactionHandle) -> Result<RollbackReport, TransactionError> {
        let state = self.state(id)?;
        let mut state = state.lock().await;
        let retention = self.config.snapshot_retention();

        match state.status {
            TransactionStatus::Pending | TransactionStatus::Active => {
                let dropped = state.queue.len();
                state.queue.clear();
                state.finish(TransactionStatus::RolledBack);
                self.locks.release(id);
                tracing::info!(transaction_id = %id, dropped, "transaction abandoned before commit");
                self.sink.record(EngineEvent::TransactionRolledBack {
                    transaction_id: id,
                    restored: 0,
                    reason: "rolled back before commit".to_string(),
                });
                Ok(report(id, TransactionStatus::RolledBack, Vec::new(), Vec::new(), false))
            }
            TransactionStatus::RolledBack => {
                tracing::debug!(transaction_id = %id, "rollback requested again; nothing to do");
                Ok(report(id, TransactionStatus::RolledBack, Vec::new(), Vec::new(), true))
            }
            TransactionStatus::Committed => {
                if state.snapshot_expired(retention) {
                    return Err(TransactionError::SnapshotExpired(id));
                }
                let Some(snapshot) = state.snapshot.clone() else {
                    return Err(TransactionError::SnapshotExpired(id));
                };
                let keys: Vec<RangeKey> = snapshot.ranges.iter().map(|r| r.key.clone()).collect();
                Ok(self
                    .compensate(&mut state, &snapshot, &keys, "compensating committed transaction")
                    .await)
            }
            TransactionStatus::Failed => {
                if state.pending_restore.is_empty() {
                    // Failed before dispatch: the workbook was never touched.
                    state.finish(TransactionStatus::RolledBack);
                    return Ok(report(id, TransactionStatus::RolledBack, Vec::new(), Vec::new(), false));
                }
                if state.snapshot_expired(retention) {
                    return Err(TransactionError::SnapshotExpired(id));
                }
                let Some(snapshot) = state.snapshot.clone() else {
                    return Err(TransactionError::SnapshotExpired(id));
                };
                let keys = state.pending_restore.clone();
                Ok(self
                    .compensate(&mut state, &snapshot, &keys, "retrying failed restoration")
                    .await)
            }
        }
    }

    /// Remove a terminal transaction from the registry.
    pub async fn discard(&self, id: TransactionHandle) -> Result<TransactionInfo, TransactionError> {
        let state = self.state(id)?;
        let info = {
            let state = state.lock().await;
            if !state.status.is_terminal() {
                return Err(TransactionError::NotTerminal {
                    id,
                    status: state.status,
                });
            }
            state.info(self.config.snapshot_retention())
        };
        self.transactions.remove(&id);
        self.locks.release(id);
        tracing::debug!(transaction_id = %id, "transaction discarded");
        Ok(info)
    }

    pub async fn info(&self, id: TransactionHandle) -> Result<TransactionInfo, TransactionError> {
        let state = self.state(id)?;
        let state = state.lock().await;
        Ok(state.info(self.config.snapshot_retention()))
    }

    /// Drop snapshots past the retention window. Busy transactions are
    /// skipped and picked up on a later call.
    pub fn purge_expired(&self) -> usize {
        let retention = self.config.snapshot_retention();
        let mut purged = 0;
        for entry in self.transactions.iter() {
            let Ok(mut state) = entry.value().try_lock() else {
                continue;
            };
            if state.status.is_terminal() && state.snapshot.is_some() && state.snapshot_expired(retention) {
                state.snapshot = None;
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::debug!(purged, "purged expired snapshots");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    // -- Commit phases -------------------------------------------------------

    fn abort(&self, state: &mut TransactionState, error: TransactionError) -> TransactionError {
        state.finish(TransactionStatus::Failed);
        self.locks.release(state.id);
        tracing::warn!(transaction_id = %state.id, error = %error, "commit aborted before dispatch");
        error
    }

    async fn prepare(&self, state: &TransactionState) -> Result<Prepared, TransactionError> {
        let operations: Vec<Operation> = state.queue.iter().map(|q| q.operation.clone()).collect();
        let order = stable_order(&operations, UnknownDependencies::Ignore)?;

        let mut prepared = Prepared::default();
        let mut unresolved = Vec::new();

        for idx in order {
            let queued = &state.queue[idx];
            let mut op = queued.operation.clone();

            let Some(expected) = queued.expected_version else {
                prepared.operations.push(op);
                continue;
            };
            let pending = PendingWrite::for_operation(&op);
            let Some(conflict) = self
                .detector
                .detect_conflict_for(&op.target, expected, &pending)
                .await?
            else {
                prepared.operations.push(op);
                continue;
            };

            if conflict.severity == ConflictSeverity::Info {
                // Content unchanged since the expectation was taken.
                prepared.conflicts.push(conflict);
                prepared.operations.push(op);
                continue;
            }
            if !self.config.auto_resolve_conflicts {
                unresolved.push(conflict);
                continue;
            }

            let strategy = op
                .resolution
                .unwrap_or(self.config.default_resolution_strategy);
            let input = ResolutionInput {
                pending,
                written_at: queued.written_at,
            };
            let mut resolved = conflict.clone();
            resolved.strategy = Some(strategy);

            match self.detector.resolve(&conflict, strategy, &input) {
                Resolution::Apply { values: merged } => {
                    if let (Some(merged), OperationKind::WriteRange { values }) = (merged, &mut op.kind) {
                        *values = merged;
                    }
                    prepared.conflicts.push(resolved);
                    prepared.operations.push(op);
                }
                Resolution::Discard => {
                    prepared.discarded.push(op.id);
                    prepared.conflicts.push(resolved);
                }
                Resolution::Manual(conflict) => unresolved.push(conflict),
            }
        }

        if unresolved.is_empty() {
            Ok(prepared)
        } else {
            Err(TransactionError::Conflict {
                conflicts: unresolved,
            })
        }
    }

    async fn capture(&self, id: TransactionHandle, operations: &[Operation]) -> Result<Snapshot, TransactionError> {
        let mut ranges: Vec<RangeSnapshot> = Vec::new();
        for op in operations.iter().filter(|op| op.kind.changes_values()) {
            if ranges.iter().any(|r| r.key == op.target) {
                continue;
            }
            let values = match self.store.read_range(&op.target).await {
                Ok(values) => values,
                // The range does not exist yet; restoring blanks it.
                Err(e) if e.is_structural() => Vec::new(),
                Err(error) => {
                    return Err(TransactionError::Snapshot {
                        key: op.target.clone(),
                        error,
                    });
                }
            };
            ranges.push(RangeSnapshot {
                key: op.target.clone(),
                values,
            });
        }
        tracing::debug!(transaction_id = %id, ranges = ranges.len(), "snapshot captured");
        Ok(Snapshot {
            transaction_id: id,
            captured_at: Utc::now(),
            ranges,
        })
    }

    async fn dispatch_all(
        &self,
        id: TransactionHandle,
        operations: &[Operation],
        retry_batches: bool,
        discard_optional: bool,
    ) -> DispatchOutcome {
        let batches = if self.executor.supports_batching() {
            plan_batches(operations, self.config.max_batch_size)
        } else {
            sequential_batches(operations)
        };
        tracing::debug!(
            transaction_id = %id,
            operations = operations.len(),
            batches = batches.len(),
            executor = self.executor.name(),
            "dispatching"
        );

        let mut outcome = DispatchOutcome::default();
        for batch in batches {
            let mut pending: Vec<Operation> = batch.iter().map(|&i| operations[i].clone()).collect();

            while !pending.is_empty() {
                for op in pending.iter().filter(|op| op.kind.changes_values()) {
                    if !outcome.touched.contains(&op.target) {
                        outcome.touched.push(op.target.clone());
                    }
                }

                match self.dispatch_batch(&pending, retry_batches, &mut outcome.calls).await {
                    Ok(outputs) => {
                        for (op, output) in pending.iter().zip(outputs) {
                            outcome.applied.push(op.id.clone());
                            outcome.outputs.insert(op.id.clone(), output.payload);
                        }
                        break;
                    }
                    Err(BatchError { failed_index, error }) => {
                        let failed_index = failed_index.min(pending.len() - 1);
                        outcome
                            .applied
                            .extend(pending[..failed_index].iter().map(|op| op.id.clone()));

                        let failed = &pending[failed_index];
                        if failed.optional && discard_optional {
                            tracing::warn!(
                                transaction_id = %id,
                                operation_id = %failed.id,
                                error = %error,
                                "optional operation failed; continuing"
                            );
                            outcome.discarded.push(failed.id.clone());
                            pending.drain(..=failed_index);
                            continue;
                        }

                        outcome.failure = Some(DispatchFailure {
                            operation_id: failed.id.clone(),
                            error: error.to_string(),
                            transient: error.is_transient(),
                        });
                        return outcome;
                    }
                }
            }
        }
        outcome
    }

    async fn dispatch_batch(
        &self,
        batch: &[Operation],
        retry_batches: bool,
        calls: &mut usize,
    ) -> Result<Vec<OperationOutput>, BatchError> {
        let retryable = retry_batches && batch.iter().all(|op| op.idempotent);
        let mut attempt = 1u32;
        loop {
            *calls += 1;
            match self.dispatch_once(batch).await {
                Err(err) if retryable && self.retry.should_retry(attempt, err.error.is_transient()) => {
                    let delay = self.retry.backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying idempotent batch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn dispatch_once(&self, batch: &[Operation]) -> Result<Vec<OperationOutput>, BatchError> {
        let timeout = self.config.operation_timeout();
        let call = async {
            if self.executor.supports_batching() {
                return self.executor.execute_batch(batch).await;
            }
            let mut outputs = Vec::with_capacity(batch.len());
            for (failed_index, op) in batch.iter().enumerate() {
                let output = self
                    .executor
                    .execute(op)
                    .await
                    .map_err(|error| BatchError { failed_index, error })?;
                outputs.push(output);
            }
            Ok(outputs)
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BatchError {
                failed_index: 0,
                error: OperationError::Transient(format!(
                    "dispatch timed out after {} ms",
                    timeout.as_millis()
                )),
            }),
        }
    }

    // -- Restoration ---------------------------------------------------------

    /// Write snapshot content back for `keys`, newest first.
    async fn restore(&self, snapshot: &Snapshot, keys: &[RangeKey]) -> (Vec<RangeKey>, Vec<RestorationFailure>) {
        let mut restored = Vec::new();
        let mut failures = Vec::new();

        for key in keys.iter().rev() {
            let Some(values) = snapshot.get(key) else {
                failures.push(RestorationFailure {
                    key: key.clone(),
                    error: "range missing from snapshot".to_string(),
                });
                continue;
            };
            match self.store.write_range(key, values).await {
                Ok(()) => restored.push(key.clone()),
                Err(e) => {
                    tracing::error!(range = %key, error = %e, "failed to restore range");
                    failures.push(RestorationFailure {
                        key: key.clone(),
                        error: e.to_string(),
                    });
                }
            }
            // Either way the remote content moved under us.
            self.mark_mutated(key);
        }
        (restored, failures)
    }

    async fn compensate(
        &self,
        state: &mut TransactionState,
        snapshot: &Snapshot,
        keys: &[RangeKey],
        reason: &str,
    ) -> RollbackReport {
        let (restored, failures) = self.restore(snapshot, keys).await;
        let status = if failures.is_empty() {
            TransactionStatus::RolledBack
        } else {
            TransactionStatus::Failed
        };
        state.pending_restore = failures.iter().map(|f| f.key.clone()).collect();
        state.finish(status);
        self.report_rollback(state.id, restored.len(), &failures, reason);
        report(state.id, status, restored, failures, false)
    }

    fn mark_mutated(&self, key: &RangeKey) {
        self.detector.record_mutation(key);
        self.results.invalidate_overlapping(key);
    }

    fn report_rollback(&self, id: TransactionHandle, restored: usize, failures: &[RestorationFailure], reason: &str) {
        self.sink.record(EngineEvent::TransactionRolledBack {
            transaction_id: id,
            restored,
            reason: reason.to_string(),
        });
        if failures.is_empty() {
            tracing::warn!(transaction_id = %id, restored, reason, "transaction rolled back");
        } else {
            let failed_ranges: Vec<String> = failures.iter().map(|f| f.key.to_string()).collect();
            tracing::error!(
                transaction_id = %id,
                restored,
                failed = failed_ranges.len(),
                reason,
                "rollback incomplete; manual repair may be needed"
            );
            self.sink.record(EngineEvent::RollbackFailed {
                transaction_id: id,
                failed_ranges,
            });
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("transactions", &self.transactions.len())
            .field("locked_scopes", &self.locks.held_count())
            .finish()
    }
}

fn report(
    id: TransactionHandle,
    status: TransactionStatus,
    restored: Vec<RangeKey>,
    failures: Vec<RestorationFailure>,
    already_rolled_back: bool,
) -> RollbackReport {
    RollbackReport {
        transaction_id: id,
        status,
        restored,
        failures,
        already_rolled_back,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NoopSink;
    use crate::executor::OperationExecutor;
    use crate::store::SnapshotStore;
    use serde_json::json;
    use sheetflow_types::conflict::ResolutionStrategy;
    use sheetflow_types::error::StoreError;
    use sheetflow_types::range::Grid;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Executor and store over one map of exact range keys.
    #[derive(Clone, Default)]
    struct MockSheet {
        inner: Arc<MockInner>,
    }

    #[derive(Default)]
    struct MockInner {
        cells: StdMutex<HashMap<RangeKey, Grid>>,
        failures: StdMutex<HashMap<String, VecDeque<OperationError>>>,
        batching: AtomicBool,
        fail_restore: AtomicBool,
        calls: AtomicUsize,
        restores: AtomicUsize,
    }

    impl MockSheet {
        fn set(&self, key: &RangeKey, grid: Grid) {
            self.inner.cells.lock().unwrap().insert(key.clone(), grid);
        }

        fn get(&self, key: &RangeKey) -> Option<Grid> {
            self.inner.cells.lock().unwrap().get(key).cloned()
        }

        fn fail(&self, op_id: &str, error: OperationError, times: usize) {
            let mut failures = self.inner.failures.lock().unwrap();
            let queue = failures.entry(op_id.to_string()).or_default();
            queue.extend(std::iter::repeat_n(error, times));
        }

        fn calls(&self) -> usize {
            self.inner.calls.load(Ordering::SeqCst)
        }

        fn apply(&self, op: &Operation) -> Result<OperationOutput, OperationError> {
            if let Some(err) = self
                .inner
                .failures
                .lock()
                .unwrap()
                .get_mut(&op.id)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
            let mut cells = self.inner.cells.lock().unwrap();
            match &op.kind {
                OperationKind::WriteRange { values } => {
                    cells.insert(op.target.clone(), values.clone());
                }
                OperationKind::ClearRange => {
                    cells.insert(op.target.clone(), Vec::new());
                }
                OperationKind::ReadRange => {
                    let values = cells.get(&op.target).cloned().unwrap_or_default();
                    return Ok(OperationOutput::new(json!({ "values": values })));
                }
                _ => {}
            }
            Ok(OperationOutput::new(json!({ "operation": op.id })))
        }
    }

    impl OperationExecutor for MockSheet {
        fn name(&self) -> &str {
            "mock"
        }

        fn supports_batching(&self) -> bool {
            self.inner.batching.load(Ordering::SeqCst)
        }

        async fn execute(&self, operation: &Operation) -> Result<OperationOutput, OperationError> {
            self.inner.calls.fetch_add(1, Ordering::SeqCst);
            self.apply(operation)
        }

        async fn execute_batch(&self, operations: &[Operation]) -> Result<Vec<OperationOutput>, BatchError> {
            self.inner.calls.fetch_add(1, Ordering::SeqCst);
            let mut outputs = Vec::new();
            for (failed_index, op) in operations.iter().enumerate() {
                outputs.push(self.apply(op).map_err(|error| BatchError { failed_index, error })?);
            }
            Ok(outputs)
        }
    }

    impl SnapshotStore for MockSheet {
        async fn read_range(&self, key: &RangeKey) -> Result<Grid, StoreError> {
            self.get(key)
                .ok_or_else(|| StoreError::SheetNotFound(key.sheet().to_string()))
        }

        async fn write_range(&self, key: &RangeKey, values: &Grid) -> Result<(), StoreError> {
            self.inner.restores.fetch_add(1, Ordering::SeqCst);
            if self.inner.fail_restore.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("write-back refused".into()));
            }
            self.set(key, values.clone());
            Ok(())
        }
    }

    fn key(a1: &str) -> RangeKey {
        RangeKey::parse("book", a1).unwrap()
    }

    fn cell(v: &str) -> Grid {
        vec![vec![json!(v)]]
    }

    fn manager(sheet: &MockSheet, config: EngineConfig) -> TransactionManager {
        let store = Arc::new(BoxSnapshotStore::new(sheet.clone()));
        let sink: Arc<dyn StatsSink> = Arc::new(NoopSink);
        let detector = Arc::new(ConflictDetector::new(Arc::clone(&store), &config, Arc::clone(&sink)));
        TransactionManager::new(
            Arc::new(BoxOperationExecutor::new(sheet.clone())),
            store,
            detector,
            Arc::new(ResultCache::new(config.cache_max_entries)),
            &config,
            sink,
        )
    }

    fn seeded(ranges: &[&str]) -> MockSheet {
        let sheet = MockSheet::default();
        for a1 in ranges {
            sheet.set(&key(a1), cell("old"));
        }
        sheet
    }

    #[tokio::test]
    async fn commit_applies_writes_and_bumps_versions() {
        let sheet = seeded(&["S!A1"]);
        let tm = manager(&sheet, EngineConfig::default());

        let tx = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(tx, Operation::write("w", key("S!A1"), cell("new"))).await.unwrap();
        let result = tm.commit(tx).await.unwrap();

        assert!(result.is_committed());
        assert_eq!(result.applied, vec!["w".to_string()]);
        assert_eq!(sheet.get(&key("S!A1")), Some(cell("new")));
        assert_eq!(tm.detector.version_of(&key("S!A1")), Some(2));

        let info = tm.info(tx).await.unwrap();
        assert_eq!(info.status, TransactionStatus::Committed);
        assert!(info.snapshot_retained);
        assert_eq!(info.scope.ranges, vec![key("S!A1")]);
    }

    #[tokio::test]
    async fn dispatch_failure_restores_every_dispatched_range() {
        let sheet = seeded(&["S!A1", "S!A2", "S!A3"]);
        sheet.fail("w3", OperationError::Permanent("quota exceeded".into()), 1);
        let tm = manager(&sheet, EngineConfig::default());

        let tx = tm.begin(TransactionOptions::default()).await.unwrap();
        for (id, a1) in [("w1", "S!A1"), ("w2", "S!A2"), ("w3", "S!A3")] {
            tm.enqueue(tx, Operation::write(id, key(a1), cell("new"))).await.unwrap();
        }
        let result = tm.commit(tx).await.unwrap();

        assert_eq!(result.status, TransactionStatus::RolledBack);
        assert_eq!(result.failure.as_ref().unwrap().operation_id, "w3");
        assert!(!result.failure.as_ref().unwrap().transient);
        assert_eq!(result.restored.len(), 3);
        assert!(!result.rollback_failed());
        for a1 in ["S!A1", "S!A2", "S!A3"] {
            assert_eq!(sheet.get(&key(a1)), Some(cell("old")));
        }
    }

    #[tokio::test]
    async fn restoration_failure_is_reported_and_retryable() {
        let sheet = seeded(&["S!A1", "S!A2"]);
        sheet.fail("w2", OperationError::Permanent("boom".into()), 1);
        sheet.inner.fail_restore.store(true, Ordering::SeqCst);
        let tm = manager(&sheet, EngineConfig::default());

        let tx = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(tx, Operation::write("w1", key("S!A1"), cell("new"))).await.unwrap();
        tm.enqueue(tx, Operation::write("w2", key("S!A2"), cell("new"))).await.unwrap();
        let result = tm.commit(tx).await.unwrap();

        assert_eq!(result.status, TransactionStatus::Failed);
        assert!(result.rollback_failed());
        assert_eq!(result.failure.unwrap().operation_id, "w2");
        assert_eq!(sheet.get(&key("S!A1")), Some(cell("new")));

        sheet.inner.fail_restore.store(false, Ordering::SeqCst);
        let report = tm.rollback(tx).await.unwrap();
        assert_eq!(report.status, TransactionStatus::RolledBack);
        assert!(report.failures.is_empty());
        assert_eq!(sheet.get(&key("S!A1")), Some(cell("old")));
    }

    #[tokio::test]
    async fn rollback_is_idempotent() {
        let sheet = seeded(&["S!A1"]);
        let tm = manager(&sheet, EngineConfig::default());

        let tx = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(tx, Operation::write("w", key("S!A1"), cell("new"))).await.unwrap();
        tm.commit(tx).await.unwrap();

        let first = tm.rollback(tx).await.unwrap();
        assert_eq!(first.restored, vec![key("S!A1")]);
        assert_eq!(sheet.get(&key("S!A1")), Some(cell("old")));
        let writes = sheet.inner.restores.load(Ordering::SeqCst);

        let second = tm.rollback(tx).await.unwrap();
        assert!(second.already_rolled_back);
        assert!(second.restored.is_empty());
        assert_eq!(sheet.inner.restores.load(Ordering::SeqCst), writes);
    }

    #[tokio::test]
    async fn versions_never_decrease_across_commit_and_rollback() {
        let sheet = seeded(&["S!A1"]);
        let tm = manager(&sheet, EngineConfig::default());
        let mut last = 0;

        for round in 0..3 {
            let tx = tm.begin(TransactionOptions::default()).await.unwrap();
            tm.enqueue(tx, Operation::write("w", key("S!A1"), cell(&format!("v{round}"))))
                .await
                .unwrap();
            tm.commit(tx).await.unwrap();
            let version = tm.detector.check_version(&key("S!A1")).await.unwrap().version;
            assert!(version >= last);
            last = version;

            tm.rollback(tx).await.unwrap();
            let version = tm.detector.check_version(&key("S!A1")).await.unwrap().version;
            assert!(version >= last);
            last = version;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_exclusive_begin_fails() {
        let sheet = seeded(&["S!A1"]);
        let config = EngineConfig {
            require_exclusive_scope: true,
            scope_wait_ms: 50,
            ..EngineConfig::default()
        };
        let tm = manager(&sheet, config);

        let first = tm
            .begin(TransactionOptions::new(Scope::single(key("S!A1:B2"))))
            .await
            .unwrap();
        let second = tm
            .begin(TransactionOptions::new(Scope::single(key("S!B2"))))
            .await;
        assert!(matches!(second, Err(TransactionError::ScopeUnavailable)));

        // Disjoint scope is unaffected.
        assert!(tm
            .begin(TransactionOptions::new(Scope::single(key("S!D4"))))
            .await
            .is_ok());

        tm.rollback(first).await.unwrap();
        assert!(tm
            .begin(TransactionOptions::new(Scope::single(key("S!B2"))))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn exclusive_scope_rejects_outside_operations() {
        let sheet = seeded(&["S!A1"]);
        let tm = manager(&sheet, EngineConfig::default());
        let tx = tm
            .begin(TransactionOptions::new(Scope::single(key("S!A1:A5"))).exclusive(true))
            .await
            .unwrap();
        let err = tm
            .enqueue(tx, Operation::write("w", key("S!B1"), cell("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::OutOfScope { .. }));
    }

    #[tokio::test]
    async fn enqueue_after_commit_is_rejected() {
        let sheet = seeded(&["S!A1"]);
        let tm = manager(&sheet, EngineConfig::default());
        let tx = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.commit(tx).await.unwrap();

        let err = tm
            .enqueue(tx, Operation::write("w", key("S!A1"), cell("x")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransactionError::NotActive {
                status: TransactionStatus::Committed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cycle_fails_before_any_dispatch() {
        let sheet = seeded(&["S!A1", "S!A2"]);
        let tm = manager(&sheet, EngineConfig::default());
        let tx = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(tx, Operation::write("a", key("S!A1"), cell("x")).depends_on(["b"]))
            .await
            .unwrap();
        tm.enqueue(tx, Operation::write("b", key("S!A2"), cell("y")).depends_on(["a"]))
            .await
            .unwrap();

        let err = tm.commit(tx).await.unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Graph(WorkflowError::CyclicDependency(_))
        ));
        assert_eq!(sheet.calls(), 0);
        assert_eq!(tm.info(tx).await.unwrap().status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn stale_expectation_without_auto_resolve_aborts() {
        let sheet = seeded(&["S!A1"]);
        let tm = manager(&sheet, EngineConfig::default());

        let late = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(late, Operation::write("b", key("S!A1"), cell("theirs-lost")))
            .await
            .unwrap();

        let early = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(early, Operation::write("a", key("S!A1"), cell("first")))
            .await
            .unwrap();
        tm.commit(early).await.unwrap();

        let calls = sheet.calls();
        let err = tm.commit(late).await.unwrap_err();
        let TransactionError::Conflict { conflicts } = err else {
            panic!("expected conflict");
        };
        assert_eq!(conflicts[0].expected_version, 1);
        assert_eq!(conflicts[0].actual_version, 2);
        assert_eq!(sheet.calls(), calls);
        assert_eq!(sheet.get(&key("S!A1")), Some(cell("first")));
    }

    #[tokio::test]
    async fn last_write_wins_uses_enqueue_time() {
        let sheet = seeded(&["S!A1"]);
        let config = EngineConfig {
            auto_resolve_conflicts: true,
            default_resolution_strategy: ResolutionStrategy::LastWriteWins,
            ..EngineConfig::default()
        };
        let tm = manager(&sheet, config);

        // Enqueued before the other actor's commit: loses.
        let older = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(older, Operation::write("older", key("S!A1"), cell("older")))
            .await
            .unwrap();

        let winner = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(winner, Operation::write("w", key("S!A1"), cell("winner")))
            .await
            .unwrap();
        tm.commit(winner).await.unwrap();

        // Enqueued after it with the same stale expectation: wins.
        let newer = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(
            newer,
            Operation::write("newer", key("S!A1"), cell("newer")).expect_version(1),
        )
        .await
        .unwrap();

        let lost = tm.commit(older).await.unwrap();
        assert!(lost.is_committed());
        assert_eq!(lost.discarded, vec!["older".to_string()]);
        assert_eq!(lost.conflicts[0].strategy, Some(ResolutionStrategy::LastWriteWins));
        assert_eq!(sheet.get(&key("S!A1")), Some(cell("winner")));

        let won = tm.commit(newer).await.unwrap();
        assert_eq!(won.applied, vec!["newer".to_string()]);
        assert_eq!(sheet.get(&key("S!A1")), Some(cell("newer")));
    }

    #[tokio::test]
    async fn optional_failure_is_discarded() {
        let sheet = seeded(&["S!A1", "S!A2"]);
        sheet.fail("opt", OperationError::Permanent("nope".into()), 1);
        let tm = manager(&sheet, EngineConfig::default());

        let tx = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(tx, Operation::write("opt", key("S!A1"), cell("x")).optional())
            .await
            .unwrap();
        tm.enqueue(tx, Operation::write("w", key("S!A2"), cell("y"))).await.unwrap();
        let result = tm.commit(tx).await.unwrap();

        assert!(result.is_committed());
        assert_eq!(result.discarded, vec!["opt".to_string()]);
        assert_eq!(result.applied, vec!["w".to_string()]);
    }

    #[tokio::test]
    async fn surfaced_optional_failure_rolls_back() {
        let sheet = seeded(&["S!A1"]);
        sheet.fail("opt", OperationError::Transient("503".into()), 1);
        let tm = manager(&sheet, EngineConfig::default());

        let options = TransactionOptions::default().surface_optional_failures();
        let tx = tm.begin(options).await.unwrap();
        tm.enqueue(tx, Operation::write("opt", key("S!A1"), cell("x")).optional())
            .await
            .unwrap();
        let result = tm.commit(tx).await.unwrap();

        assert_eq!(result.status, TransactionStatus::RolledBack);
        assert!(result.discarded.is_empty());
        let failure = result.failure.unwrap();
        assert_eq!(failure.operation_id, "opt");
        assert!(failure.transient);
        assert_eq!(sheet.get(&key("S!A1")), Some(cell("old")));
    }

    #[tokio::test]
    async fn independent_writes_share_one_batch() {
        let sheet = seeded(&["S!A1", "S!B1", "S!C1"]);
        sheet.inner.batching.store(true, Ordering::SeqCst);
        let tm = manager(&sheet, EngineConfig::default());

        let tx = tm.begin(TransactionOptions::default()).await.unwrap();
        for (id, a1) in [("a", "S!A1"), ("b", "S!B1"), ("c", "S!C1")] {
            tm.enqueue(tx, Operation::write(id, key(a1), cell("n"))).await.unwrap();
        }
        let result = tm.commit(tx).await.unwrap();
        assert_eq!(result.batches, 1);
        assert_eq!(sheet.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idempotent_batch_retries_transient_failures() {
        let sheet = seeded(&["S!A1", "S!B1"]);
        sheet.inner.batching.store(true, Ordering::SeqCst);
        sheet.fail("a", OperationError::Transient("429".into()), 2);
        let tm = manager(&sheet, EngineConfig::default());

        let tx = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(tx, Operation::write("a", key("S!A1"), cell("n")).idempotent())
            .await
            .unwrap();
        tm.enqueue(tx, Operation::write("b", key("S!B1"), cell("n")).idempotent())
            .await
            .unwrap();
        let result = tm.commit(tx).await.unwrap();

        assert!(result.is_committed());
        assert_eq!(result.batches, 3);
    }

    #[tokio::test]
    async fn non_idempotent_transient_failure_rolls_back() {
        let sheet = seeded(&["S!A1"]);
        sheet.fail("w", OperationError::Transient("503".into()), 1);
        let tm = manager(&sheet, EngineConfig::default());

        let tx = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(tx, Operation::write("w", key("S!A1"), cell("n"))).await.unwrap();
        let result = tm.commit(tx).await.unwrap();
        assert_eq!(result.status, TransactionStatus::RolledBack);
        assert!(result.failure.unwrap().transient);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_snapshot_cannot_compensate() {
        let sheet = seeded(&["S!A1"]);
        let config = EngineConfig {
            snapshot_retention_ms: 100,
            ..EngineConfig::default()
        };
        let tm = manager(&sheet, config);

        let tx = tm.begin(TransactionOptions::default()).await.unwrap();
        tm.enqueue(tx, Operation::write("w", key("S!A1"), cell("n"))).await.unwrap();
        tm.commit(tx).await.unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(matches!(
            tm.rollback(tx).await,
            Err(TransactionError::SnapshotExpired(_))
        ));
        assert_eq!(tm.purge_expired(), 1);
        assert!(!tm.info(tx).await.unwrap().snapshot_retained);
    }

    #[tokio::test]
    async fn discard_requires_terminal_state() {
        let sheet = seeded(&["S!A1"]);
        let tm = manager(&sheet, EngineConfig::default());
        let tx = tm.begin(TransactionOptions::default()).await.unwrap();

        assert!(matches!(
            tm.discard(tx).await,
            Err(TransactionError::NotTerminal { .. })
        ));
        tm.rollback(tx).await.unwrap();
        assert!(tm.discard(tx).await.is_ok());
        assert!(matches!(tm.info(tx).await, Err(TransactionError::NotFound(_))));
        assert!(tm.is_empty());
    }
}
