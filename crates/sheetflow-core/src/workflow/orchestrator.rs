//! Workflow orchestrator: level-by-level concurrent execution.
//!
//! Operations run in dependency levels. Within a level, tasks are spawned on a
//! `JoinSet` and bounded by a semaphore sized to the workflow's concurrency
//! ceiling; the next level starts only after every task of the current one has
//! finished.
//!
//! # Execution flow
//!
//! 1. Plan levels for the workflow's strategy.
//! 2. For each level, skip operations whose dependencies did not succeed and
//!    resolve parameter markers from the execution context.
//! 3. Spawn each operation. Reads consult the result cache; mutating
//!    operations pass the impact gate and commit through their own
//!    transaction. Transient failures retry with backoff.
//! 4. A non-optional failure, an external cancel or the workflow deadline
//!    stops new work; running tasks finish.
//! 5. On failure, committed operations are compensated in reverse commit
//!    order.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use sheetflow_types::config::EngineConfig;
use sheetflow_types::event::EngineEvent;
use sheetflow_types::impact::ImpactSeverity;
use sheetflow_types::operation::Operation;
use sheetflow_types::range::Scope;
use sheetflow_types::transaction::{TransactionHandle, TransactionStatus};
use sheetflow_types::workflow::{
    ExecutionStrategy, OperationOutcome, OperationStatus, RetryEvent, Workflow,
    WorkflowExecutionResult,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::event::StatsSink;
use crate::executor::BoxOperationExecutor;
use crate::impact::ImpactAnalyzer;
use crate::transaction::{TransactionManager, TransactionOptions};

use super::builder::WorkflowError;
use super::context::ExecutionContext;
use super::dag::{UnknownDependencies, build_levels, stable_order};
use super::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// WorkflowFailure
// ---------------------------------------------------------------------------

/// A terminal workflow error together with everything that ran before it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error}")]
pub struct WorkflowFailure {
    pub error: WorkflowError,
    pub partial: Box<WorkflowExecutionResult>,
}

// ---------------------------------------------------------------------------
// Per-task plumbing
// ---------------------------------------------------------------------------

/// What a spawned operation task reports back.
struct TaskResult {
    outcome: OperationOutcome,
    error: Option<WorkflowError>,
}

/// A failed attempt.
struct AttemptFailure {
    message: String,
    transient: bool,
}

/// State shared by every task of one run.
struct OperationRunner {
    workflow_id: Uuid,
    executor: Arc<BoxOperationExecutor>,
    transactions: Arc<TransactionManager>,
    analyzer: Arc<ImpactAnalyzer>,
    results: Arc<ResultCache>,
    sink: Arc<dyn StatsSink>,
    retry: RetryPolicy,
    operation_timeout: Duration,
    cache_ttl: Duration,
    analyze_impact: bool,
    require_confirmation: bool,
}

impl OperationRunner {
    async fn run(&self, op: Operation, level: usize, stop: CancellationToken) -> TaskResult {
        let started = Instant::now();
        let mut outcome = OperationOutcome {
            operation_id: op.id.clone(),
            level,
            status: OperationStatus::Succeeded,
            attempts: 0,
            retries: Vec::new(),
            output: None,
            error: None,
            from_cache: false,
            transaction_id: None,
            impact: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        };

        if op.kind.is_read_only() {
            if let Some(hit) = self.results.get(&op) {
                self.sink.record(EngineEvent::CacheHit {
                    operation_id: op.id.clone(),
                    kind: op.kind.name().to_string(),
                });
                outcome.output = Some(hit.payload);
                outcome.from_cache = true;
                return self.succeed(outcome, started);
            }
            self.sink.record(EngineEvent::CacheMiss {
                operation_id: op.id.clone(),
                kind: op.kind.name().to_string(),
            });
        }

        if op.is_mutating() && self.analyze_impact {
            let report = self.analyzer.analyze(&op).await;
            outcome.impact = Some(report.severity);
            if report.severity == ImpactSeverity::Critical && self.require_confirmation && !op.confirmed {
                let error = WorkflowError::ConfirmationRequired {
                    operation_id: op.id.clone(),
                    severity: report.severity,
                };
                return self.fail(outcome, &op, error);
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            outcome.attempts = attempt;
            self.sink.record(EngineEvent::OperationStarted {
                workflow_id: Some(self.workflow_id),
                operation_id: op.id.clone(),
                kind: op.kind.name().to_string(),
                attempt,
            });

            let result = if op.is_mutating() {
                self.commit(&op, &mut outcome).await
            } else {
                self.read(&op).await
            };

            let failure = match result {
                Ok(payload) => {
                    outcome.output = Some(payload);
                    return self.succeed(outcome, started);
                }
                Err(failure) => failure,
            };

            let will_retry = self.retry.should_retry(attempt, failure.transient) && !stop.is_cancelled();
            self.sink.record(EngineEvent::OperationFailed {
                workflow_id: Some(self.workflow_id),
                operation_id: op.id.clone(),
                error: failure.message.clone(),
                will_retry,
            });
            if !will_retry {
                let error = WorkflowError::OperationFailed {
                    operation_id: op.id.clone(),
                    error: failure.message,
                };
                return self.fail(outcome, &op, error);
            }

            let delay = self.retry.backoff_delay(attempt);
            tracing::warn!(
                workflow_id = %self.workflow_id,
                operation_id = %op.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure.message,
                "operation failed; retrying"
            );
            outcome.retries.push(RetryEvent {
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: failure.message,
                at: Utc::now(),
            });

            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    let error = WorkflowError::OperationFailed {
                        operation_id: op.id.clone(),
                        error: "workflow stopped during retry backoff".to_string(),
                    };
                    return self.fail(outcome, &op, error);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn read(&self, op: &Operation) -> Result<Value, AttemptFailure> {
        match tokio::time::timeout(self.operation_timeout, self.executor.execute(op)).await {
            Ok(Ok(output)) => {
                self.results.insert(op, output.clone(), self.cache_ttl);
                Ok(output.payload)
            }
            Ok(Err(e)) => Err(AttemptFailure {
                message: e.to_string(),
                transient: e.is_transient(),
            }),
            Err(_) => Err(AttemptFailure {
                message: format!("timed out after {} ms", self.operation_timeout.as_millis()),
                transient: true,
            }),
        }
    }

    /// Run one mutating operation through its own transaction.
    ///
    /// Retries and optional-failure handling stay with the runner, so the
    /// transaction neither re-dispatches nor discards. A failed attempt's
    /// transaction is dropped from the manager before returning.
    async fn commit(&self, op: &Operation, outcome: &mut OperationOutcome) -> Result<Value, AttemptFailure> {
        let result = self.try_commit(op, outcome).await;
        if result.is_err() {
            if let Some(tx) = outcome.transaction_id.take() {
                release(&self.transactions, tx).await;
            }
        }
        result
    }

    async fn try_commit(&self, op: &Operation, outcome: &mut OperationOutcome) -> Result<Value, AttemptFailure> {
        let options = TransactionOptions::new(Scope::single(op.target.clone()))
            .without_batch_retry()
            .surface_optional_failures();
        let tx = self
            .transactions
            .begin(options)
            .await
            .map_err(|e| AttemptFailure {
                message: e.to_string(),
                transient: e.is_retryable(),
            })?;
        outcome.transaction_id = Some(tx);

        if let Err(e) = self.transactions.enqueue(tx, op.clone()).await {
            // Nothing was queued; release the scope.
            if let Err(rollback) = self.transactions.rollback(tx).await {
                tracing::debug!(transaction_id = %tx, error = %rollback, "abandoning transaction");
            }
            return Err(AttemptFailure {
                message: e.to_string(),
                transient: e.is_retryable(),
            });
        }

        let result = self
            .transactions
            .commit(tx)
            .await
            .map_err(|e| AttemptFailure {
                message: e.to_string(),
                transient: e.is_retryable(),
            })?;

        if result.is_committed() {
            let payload = match result.outputs.get(&op.id) {
                Some(payload) => payload.clone(),
                // Dropped by conflict resolution; nothing was dispatched.
                None => json!({ "discarded": result.discarded.contains(&op.id) }),
            };
            return Ok(payload);
        }

        let (message, transient) = result
            .failure
            .as_ref()
            .map(|f| (f.error.clone(), f.transient))
            .unwrap_or_else(|| (format!("transaction ended {}", result.status), false));
        let message = if result.rollback_failed() {
            format!(
                "{message}; {} range(s) could not be restored",
                result.restoration_failures.len()
            )
        } else {
            message
        };
        Err(AttemptFailure { message, transient })
    }

    fn succeed(&self, mut outcome: OperationOutcome, started: Instant) -> TaskResult {
        outcome.status = OperationStatus::Succeeded;
        outcome.finished_at = Some(Utc::now());
        self.sink.record(EngineEvent::OperationCompleted {
            workflow_id: Some(self.workflow_id),
            operation_id: outcome.operation_id.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            from_cache: outcome.from_cache,
        });
        TaskResult { outcome, error: None }
    }

    fn fail(&self, mut outcome: OperationOutcome, op: &Operation, error: WorkflowError) -> TaskResult {
        outcome.status = if op.optional {
            OperationStatus::Skipped
        } else {
            OperationStatus::Failed
        };
        outcome.error = Some(error.to_string());
        outcome.finished_at = Some(Utc::now());
        tracing::warn!(
            workflow_id = %self.workflow_id,
            operation_id = %op.id,
            optional = op.optional,
            error = %error,
            "operation failed"
        );
        TaskResult {
            outcome,
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Executes validated workflows.
pub struct Orchestrator {
    executor: Arc<BoxOperationExecutor>,
    transactions: Arc<TransactionManager>,
    analyzer: Arc<ImpactAnalyzer>,
    results: Arc<ResultCache>,
    sink: Arc<dyn StatsSink>,
}

impl Orchestrator {
    pub fn new(
        executor: Arc<BoxOperationExecutor>,
        transactions: Arc<TransactionManager>,
        analyzer: Arc<ImpactAnalyzer>,
        results: Arc<ResultCache>,
        sink: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            executor,
            transactions,
            analyzer,
            results,
            sink,
        }
    }

    /// Levels to run, as indices into `workflow.operations`.
    ///
    /// - sequential: one operation per level, stable dependency order
    /// - parallel: the workflow's own levels
    /// - adaptive: levels recomputed from the graph, costliest first
    pub fn plan(&self, workflow: &Workflow) -> Result<Vec<Vec<usize>>, WorkflowError> {
        let ops = &workflow.operations;
        match workflow.strategy {
            ExecutionStrategy::Sequential => Ok(stable_order(ops, UnknownDependencies::Reject)?
                .into_iter()
                .map(|idx| vec![idx])
                .collect()),
            ExecutionStrategy::Parallel => {
                let planned: usize = workflow.levels.iter().map(Vec::len).sum();
                if planned == ops.len() {
                    Ok(workflow.levels.clone())
                } else {
                    build_levels(ops)
                }
            }
            ExecutionStrategy::Adaptive => {
                let mut levels = build_levels(ops)?;
                for level in &mut levels {
                    level.sort_by_key(|&idx| Reverse(self.analyzer.estimate_ms(&ops[idx])));
                }
                Ok(levels)
            }
        }
    }

    /// Run `workflow` to completion, failure, timeout or cancellation.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        mut context: ExecutionContext,
        config: &EngineConfig,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecutionResult, WorkflowFailure> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(workflow.timeout_ms);
        let workflow_id = workflow.id;

        let plan = match self.plan(workflow) {
            Ok(plan) => plan,
            Err(error) => {
                let partial = empty_result(workflow, vec![error.to_string()]);
                return Err(WorkflowFailure {
                    error,
                    partial: Box::new(partial),
                });
            }
        };
        let concurrency = match workflow.strategy {
            ExecutionStrategy::Sequential => 1,
            _ => workflow.max_concurrency.max(1),
        };

        tracing::info!(
            workflow_id = %workflow_id,
            operations = workflow.operations.len(),
            levels = plan.len(),
            strategy = %workflow.strategy,
            concurrency,
            "workflow started"
        );
        self.sink.record(EngineEvent::WorkflowStarted {
            workflow_id,
            operations: workflow.operations.len(),
            levels: plan.len(),
            strategy: workflow.strategy,
        });

        let runner = Arc::new(OperationRunner {
            workflow_id,
            executor: Arc::clone(&self.executor),
            transactions: Arc::clone(&self.transactions),
            analyzer: Arc::clone(&self.analyzer),
            results: Arc::clone(&self.results),
            sink: Arc::clone(&self.sink),
            retry: RetryPolicy::from_config(config),
            operation_timeout: config.operation_timeout(),
            cache_ttl: config.cache_ttl(),
            analyze_impact: config.analyze_impact,
            require_confirmation: config.require_confirmation_for_critical,
        });

        let stop = cancel.child_token();
        let mut outcomes: HashMap<String, OperationOutcome> = HashMap::new();
        let mut committed: Vec<(String, TransactionHandle)> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        let mut failure: Option<WorkflowError> = None;
        let mut levels_executed = 0;

        for (level_idx, level) in plan.iter().enumerate() {
            if stop.is_cancelled() {
                for &idx in level {
                    let op = &workflow.operations[idx];
                    outcomes.insert(
                        op.id.clone(),
                        OperationOutcome::cancelled(&op.id, level_idx, "workflow stopped before this level"),
                    );
                }
                continue;
            }

            levels_executed += 1;
            tracing::debug!(
                workflow_id = %workflow_id,
                level = level_idx,
                operations = level.len(),
                "processing level"
            );
            self.sink.record(EngineEvent::LevelStarted {
                workflow_id,
                level: level_idx,
                operations: level.len(),
            });

            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut join_set = JoinSet::new();
            let mut spawned: HashMap<tokio::task::Id, (String, bool)> = HashMap::new();

            for &idx in level {
                let op = &workflow.operations[idx];

                let blocked_by = op
                    .depends_on
                    .iter()
                    .find(|dep| outcomes.get(*dep).is_some_and(|o| !o.allows_dependents()));
                if let Some(dep) = blocked_by {
                    outcomes.insert(
                        op.id.clone(),
                        OperationOutcome::cancelled(
                            &op.id,
                            level_idx,
                            &format!("dependency '{dep}' did not succeed"),
                        ),
                    );
                    continue;
                }

                let resolved = match context.resolve_operation(op) {
                    Ok(resolved) => resolved,
                    Err(error) => {
                        let mut outcome = OperationOutcome::cancelled(&op.id, level_idx, &error.to_string());
                        outcome.status = if op.optional {
                            OperationStatus::Skipped
                        } else {
                            OperationStatus::Failed
                        };
                        tracing::warn!(
                            workflow_id = %workflow_id,
                            operation_id = %op.id,
                            error = %error,
                            "parameter inference failed"
                        );
                        errors.push(error.to_string());
                        outcomes.insert(op.id.clone(), outcome);
                        if !op.optional {
                            failure.get_or_insert(error);
                            stop.cancel();
                        }
                        continue;
                    }
                };

                let runner = Arc::clone(&runner);
                let semaphore = Arc::clone(&semaphore);
                let token = stop.clone();
                let op_id = op.id.clone();
                let handle = join_set.spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    let Some(_permit) = permit else {
                        return TaskResult {
                            outcome: OperationOutcome::cancelled(&op_id, level_idx, "workflow stopped before start"),
                            error: None,
                        };
                    };
                    runner.run(resolved, level_idx, token).await
                });
                spawned.insert(handle.id(), (op.id.clone(), op.is_mutating()));
            }

            loop {
                let next = if failure.is_some() {
                    join_set.join_next_with_id().await
                } else {
                    match tokio::time::timeout_at(deadline, join_set.join_next_with_id()).await {
                        Ok(next) => next,
                        Err(_) => {
                            tracing::warn!(
                                workflow_id = %workflow_id,
                                timeout_ms = workflow.timeout_ms,
                                "workflow deadline reached; draining running operations"
                            );
                            let error = WorkflowError::WorkflowTimeout(workflow.timeout_ms);
                            errors.push(error.to_string());
                            failure = Some(error);
                            stop.cancel();
                            continue;
                        }
                    }
                };

                let Some(joined) = next else {
                    break;
                };
                let task = match joined {
                    Ok((id, task)) => {
                        let mutating = spawned.get(&id).is_some_and(|(_, mutating)| *mutating);
                        (task, mutating)
                    }
                    Err(join_err) => {
                        let operation_id = spawned
                            .get(&join_err.id())
                            .map(|(op_id, _)| op_id.clone())
                            .unwrap_or_default();
                        let error = WorkflowError::OperationFailed {
                            operation_id: operation_id.clone(),
                            error: format!("task join error: {join_err}"),
                        };
                        let mut outcome = OperationOutcome::cancelled(&operation_id, level_idx, &error.to_string());
                        outcome.status = OperationStatus::Failed;
                        outcomes.insert(operation_id, outcome);
                        errors.push(error.to_string());
                        failure.get_or_insert(error);
                        stop.cancel();
                        continue;
                    }
                };

                let (TaskResult { outcome, error }, mutating) = task;
                if let Some(error) = error {
                    errors.push(error.to_string());
                    if outcome.status == OperationStatus::Failed {
                        failure.get_or_insert(error);
                        stop.cancel();
                    }
                }
                if outcome.status == OperationStatus::Succeeded {
                    if let Some(output) = &outcome.output {
                        context.set_output(&outcome.operation_id, output.clone());
                    }
                    if let (true, Some(tx)) = (mutating, outcome.transaction_id) {
                        committed.push((outcome.operation_id.clone(), tx));
                    }
                }
                outcomes.insert(outcome.operation_id.clone(), outcome);
            }
        }

        if failure.is_none() && cancel.is_cancelled() {
            errors.push(WorkflowError::Cancelled.to_string());
            failure = Some(WorkflowError::Cancelled);
        }

        if failure.is_some() && config.rollback_on_failure && !committed.is_empty() {
            self.compensate(workflow_id, &committed, &mut outcomes, &mut errors)
                .await;
        }
        // Compensation was the last use of these transactions.
        for (_, tx) in &committed {
            release(&self.transactions, *tx).await;
        }

        let ordered: Vec<OperationOutcome> = workflow
            .operations
            .iter()
            .map(|op| {
                outcomes.remove(&op.id).unwrap_or_else(|| {
                    OperationOutcome::cancelled(&op.id, workflow.level_of(&op.id).unwrap_or(0), "never scheduled")
                })
            })
            .collect();

        let duration_ms = started.elapsed().as_millis() as u64;
        let succeeded = ordered
            .iter()
            .filter(|o| o.status == OperationStatus::Succeeded)
            .count();
        let failed = ordered
            .iter()
            .filter(|o| o.status == OperationStatus::Failed)
            .count();
        let result = WorkflowExecutionResult {
            workflow_id,
            strategy: workflow.strategy,
            success: failure.is_none(),
            outcomes: ordered,
            levels_executed,
            duration_ms,
            errors,
            cancelled: cancel.is_cancelled(),
        };

        tracing::info!(
            workflow_id = %workflow_id,
            success = result.success,
            succeeded,
            failed,
            levels = levels_executed,
            duration_ms,
            "workflow finished"
        );
        self.sink.record(EngineEvent::WorkflowCompleted {
            workflow_id,
            success: result.success,
            duration_ms,
            succeeded,
            failed,
        });

        match failure {
            None => Ok(result),
            Some(error) => Err(WorkflowFailure {
                error,
                partial: Box::new(result),
            }),
        }
    }

    /// Restore committed operations, newest first.
    async fn compensate(
        &self,
        workflow_id: Uuid,
        committed: &[(String, TransactionHandle)],
        outcomes: &mut HashMap<String, OperationOutcome>,
        errors: &mut Vec<String>,
    ) {
        tracing::warn!(
            workflow_id = %workflow_id,
            operations = committed.len(),
            "compensating committed operations"
        );
        for (operation_id, tx) in committed.iter().rev() {
            match self.transactions.rollback(*tx).await {
                Ok(report) if report.status == TransactionStatus::RolledBack => {
                    if let Some(outcome) = outcomes.get_mut(operation_id) {
                        outcome.status = OperationStatus::RolledBack;
                    }
                }
                Ok(report) => errors.push(format!(
                    "compensation of '{operation_id}' left {} range(s) unrestored",
                    report.failures.len()
                )),
                Err(e) => errors.push(format!("compensation of '{operation_id}' failed: {e}")),
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("executor", &self.executor.name())
            .finish()
    }
}

/// Remove a finished workflow-owned transaction from the manager.
async fn release(transactions: &TransactionManager, tx: TransactionHandle) {
    if let Err(e) = transactions.discard(tx).await {
        tracing::debug!(transaction_id = %tx, error = %e, "transaction not released");
    }
}

fn empty_result(workflow: &Workflow, errors: Vec<String>) -> WorkflowExecutionResult {
    WorkflowExecutionResult {
        workflow_id: workflow.id,
        strategy: workflow.strategy,
        success: false,
        outcomes: workflow
            .operations
            .iter()
            .map(|op| OperationOutcome::cancelled(&op.id, 0, "workflow could not be planned"))
            .collect(),
        levels_executed: 0,
        duration_ms: 0,
        errors,
        cancelled: false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
