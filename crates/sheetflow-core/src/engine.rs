//! `Engine`: the facade that owns one instance of every component.
//!
//! All state (workflow registry, transaction registry, version ledger, result
//! cache, scope locks) lives behind the engine instance; callers only ever see
//! opaque handles. Engines are cheap to clone and share their state.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use sheetflow_types::config::EngineConfig;
use sheetflow_types::conflict::{Conflict, ResolutionStrategy, VersionRecord};
use sheetflow_types::event::EngineEvent;
use sheetflow_types::impact::ImpactReport;
use sheetflow_types::operation::Operation;
use sheetflow_types::range::{RangeKey, Scope};
use sheetflow_types::transaction::{
    CommitResult, RollbackReport, TransactionHandle, TransactionInfo,
};
use sheetflow_types::workflow::{ExecutionStrategy, WorkflowExecutionResult, WorkflowHandle};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::conflict::{ConflictDetector, ConflictError, Resolution, ResolutionInput};
use crate::event::{EventBus, FanoutSink, StatsSink};
use crate::executor::{BoxOperationExecutor, OperationExecutor};
use crate::impact::ImpactAnalyzer;
use crate::store::{BoxSnapshotStore, SnapshotStore};
use crate::transaction::{TransactionError, TransactionManager, TransactionOptions};
use crate::workflow::{ExecutionContext, Orchestrator, WorkflowError, WorkflowFailure, build_workflow};

/// Errors surfaced by the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workflow was rejected before anything ran.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// The workflow ran and ended in a terminal error.
    #[error(transparent)]
    Execution(#[from] WorkflowFailure),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowHandle),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The partial result of a workflow that failed while running.
    pub fn partial_result(&self) -> Option<&WorkflowExecutionResult> {
        match self {
            EngineError::Execution(failure) => Some(&failure.partial),
            _ => None,
        }
    }

    /// Whether the caller may retry the same call.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transaction(e) => e.is_retryable(),
            _ => false,
        }
    }
}

type WorkflowTask = JoinHandle<Result<WorkflowExecutionResult, WorkflowFailure>>;

struct WorkflowEntry {
    cancel: CancellationToken,
    /// Held by an `await_result` caller while it waits.
    task: Option<WorkflowTask>,
}

/// A task borrowed out of its `WorkflowEntry`. Dropped before the task
/// finishes, it goes back so a later `await_result` can collect it.
struct AwaitingTask<'a> {
    workflows: &'a DashMap<WorkflowHandle, WorkflowEntry>,
    handle: WorkflowHandle,
    task: Option<WorkflowTask>,
}

impl Drop for AwaitingTask<'_> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if let Some(mut entry) = self.workflows.get_mut(&self.handle) {
                entry.task = Some(task);
            }
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    bus: EventBus,
    detector: Arc<ConflictDetector>,
    transactions: Arc<TransactionManager>,
    analyzer: Arc<ImpactAnalyzer>,
    orchestrator: Arc<Orchestrator>,
    workflows: DashMap<WorkflowHandle, WorkflowEntry>,
}

/// Coordinates workflows and transactions over one executor and one
/// snapshot store.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new<E, S>(executor: E, store: S, config: EngineConfig) -> Result<Self, EngineError>
    where
        E: OperationExecutor + 'static,
        S: SnapshotStore + 'static,
    {
        Self::build(executor, store, config, None)
    }

    /// Like `new`, additionally forwarding every event to `sink`.
    pub fn with_sink<E, S>(
        executor: E,
        store: S,
        config: EngineConfig,
        sink: Arc<dyn StatsSink>,
    ) -> Result<Self, EngineError>
    where
        E: OperationExecutor + 'static,
        S: SnapshotStore + 'static,
    {
        Self::build(executor, store, config, Some(sink))
    }

    fn build<E, S>(
        executor: E,
        store: S,
        config: EngineConfig,
        extra_sink: Option<Arc<dyn StatsSink>>,
    ) -> Result<Self, EngineError>
    where
        E: OperationExecutor + 'static,
        S: SnapshotStore + 'static,
    {
        config.validate().map_err(EngineError::InvalidConfig)?;

        let bus = EventBus::new(config.event_bus_capacity);
        let mut fanout = FanoutSink::new(vec![Arc::new(bus.clone())]);
        if let Some(extra) = extra_sink {
            fanout.push(extra);
        }
        let sink: Arc<dyn StatsSink> = Arc::new(fanout);

        let executor = Arc::new(BoxOperationExecutor::new(executor));
        let store = Arc::new(BoxSnapshotStore::new(store));
        let results = Arc::new(ResultCache::new(config.cache_max_entries));
        let detector = Arc::new(ConflictDetector::new(Arc::clone(&store), &config, Arc::clone(&sink)));
        let transactions = Arc::new(TransactionManager::new(
            Arc::clone(&executor),
            Arc::clone(&store),
            Arc::clone(&detector),
            Arc::clone(&results),
            &config,
            Arc::clone(&sink),
        ));
        let analyzer = Arc::new(ImpactAnalyzer::new(store, &config, Arc::clone(&sink)));
        let orchestrator = Arc::new(Orchestrator::new(
            executor,
            Arc::clone(&transactions),
            Arc::clone(&analyzer),
            results,
            sink,
        ));

        tracing::debug!(
            max_concurrency = config.max_concurrency,
            require_exclusive_scope = config.require_exclusive_scope,
            "engine initialized"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                bus,
                detector,
                transactions,
                analyzer,
                orchestrator,
                workflows: DashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.bus.subscribe()
    }

    // -- Workflows -----------------------------------------------------------

    /// Validate and start a workflow in the background.
    ///
    /// `config` overrides the engine configuration for this run's
    /// orchestration (concurrency, retries, timeouts, impact gate). Version
    /// tracking, caching and transactions keep the engine configuration.
    pub fn submit_workflow(
        &self,
        operations: Vec<Operation>,
        strategy_hint: Option<ExecutionStrategy>,
        config: Option<EngineConfig>,
    ) -> Result<WorkflowHandle, EngineError> {
        self.submit_workflow_with_context(operations, strategy_hint, config, HashMap::new())
    }

    /// Like `submit_workflow`, seeding the shared context with `variables`.
    pub fn submit_workflow_with_context(
        &self,
        operations: Vec<Operation>,
        strategy_hint: Option<ExecutionStrategy>,
        config: Option<EngineConfig>,
        variables: HashMap<String, Value>,
    ) -> Result<WorkflowHandle, EngineError> {
        let config = match config {
            Some(config) => {
                config.validate().map_err(EngineError::InvalidConfig)?;
                config
            }
            None => self.inner.config.clone(),
        };
        let workflow = build_workflow(operations, strategy_hint, &config)?;
        let handle = WorkflowHandle(workflow.id);

        tracing::info!(
            workflow_id = %handle,
            operations = workflow.operations.len(),
            strategy = %workflow.strategy,
            "workflow submitted"
        );

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let orchestrator = Arc::clone(&self.inner.orchestrator);
        let context = ExecutionContext::with_variables(variables);
        let task = tokio::spawn(async move {
            orchestrator.execute(&workflow, context, &config, token).await
        });

        self.inner
            .workflows
            .insert(
                handle,
                WorkflowEntry {
                    cancel,
                    task: Some(task),
                },
            );
        Ok(handle)
    }

    /// Wait for a submitted workflow and release its handle.
    ///
    /// The handle stays cancellable while the caller waits.
    pub async fn await_result(&self, handle: WorkflowHandle) -> Result<WorkflowExecutionResult, EngineError> {
        let task = self
            .inner
            .workflows
            .get_mut(&handle)
            .ok_or(EngineError::WorkflowNotFound(handle))?
            .task
            .take()
            .ok_or_else(|| EngineError::Internal(format!("workflow {handle} is already being awaited")))?;

        let mut awaiting = AwaitingTask {
            workflows: &self.inner.workflows,
            handle,
            task: Some(task),
        };
        let joined = match awaiting.task.as_mut() {
            Some(task) => task.await,
            None => return Err(EngineError::Internal(format!("workflow {handle} lost its task"))),
        };
        awaiting.task = None;
        self.inner.workflows.remove(&handle);

        match joined {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(failure)) => Err(EngineError::Execution(failure)),
            Err(join_err) => {
                tracing::error!(workflow_id = %handle, error = %join_err, "workflow task failed");
                Err(EngineError::Internal(format!("workflow task failed: {join_err}")))
            }
        }
    }

    /// Submit and wait.
    pub async fn execute_workflow(
        &self,
        operations: Vec<Operation>,
        strategy_hint: Option<ExecutionStrategy>,
        config: Option<EngineConfig>,
    ) -> Result<WorkflowExecutionResult, EngineError> {
        let handle = self.submit_workflow(operations, strategy_hint, config)?;
        self.await_result(handle).await
    }

    /// Request cooperative cancellation. Running operations finish; nothing
    /// new starts. The outcome is still collected with `await_result`.
    pub fn cancel_workflow(&self, handle: WorkflowHandle) -> Result<(), EngineError> {
        let entry = self
            .inner
            .workflows
            .get(&handle)
            .ok_or(EngineError::WorkflowNotFound(handle))?;
        tracing::info!(workflow_id = %handle, "workflow cancellation requested");
        entry.cancel.cancel();
        Ok(())
    }

    /// Handles submitted but not yet collected.
    pub fn pending_workflows(&self) -> Vec<WorkflowHandle> {
        self.inner.workflows.iter().map(|e| *e.key()).collect()
    }

    // -- Transactions --------------------------------------------------------

    /// Begin a transaction over `scope`, exclusive per `require_exclusive_scope`.
    pub async fn begin_transaction(&self, scope: Scope) -> Result<TransactionHandle, EngineError> {
        self.begin_transaction_with(TransactionOptions::new(scope)).await
    }

    pub async fn begin_transaction_with(
        &self,
        options: TransactionOptions,
    ) -> Result<TransactionHandle, EngineError> {
        Ok(self.inner.transactions.begin(options).await?)
    }

    pub async fn enqueue_operation(
        &self,
        handle: TransactionHandle,
        operation: Operation,
    ) -> Result<(), EngineError> {
        Ok(self.inner.transactions.enqueue(handle, operation).await?)
    }

    /// Commit the queue. A dispatch failure is reported through the returned
    /// `CommitResult`, not as an error.
    pub async fn commit_transaction(&self, handle: TransactionHandle) -> Result<CommitResult, EngineError> {
        Ok(self.inner.transactions.commit(handle).await?)
    }

    pub async fn rollback_transaction(&self, handle: TransactionHandle) -> Result<RollbackReport, EngineError> {
        Ok(self.inner.transactions.rollback(handle).await?)
    }

    /// Drop a terminal transaction from the registry.
    pub async fn discard_transaction(&self, handle: TransactionHandle) -> Result<TransactionInfo, EngineError> {
        Ok(self.inner.transactions.discard(handle).await?)
    }

    pub async fn transaction_info(&self, handle: TransactionHandle) -> Result<TransactionInfo, EngineError> {
        Ok(self.inner.transactions.info(handle).await?)
    }

    // -- Analysis ------------------------------------------------------------

    pub async fn analyze_impact(&self, operation: &Operation) -> ImpactReport {
        self.inner.analyzer.analyze(operation).await
    }

    /// Current version of `key`, materializing it on first sight.
    pub async fn check_version(&self, key: &RangeKey) -> Result<VersionRecord, EngineError> {
        Ok(self.inner.detector.check_version(key).await?)
    }

    pub async fn detect_conflict(
        &self,
        key: &RangeKey,
        expected_version: u64,
    ) -> Result<Option<Conflict>, EngineError> {
        Ok(self.inner.detector.detect_conflict(key, expected_version).await?)
    }

    /// Dispose of a conflict returned by `detect_conflict`. Never writes;
    /// an `Apply` outcome is the caller's to dispatch.
    pub fn resolve_conflict(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
        ours: &ResolutionInput,
    ) -> Resolution {
        self.inner.detector.resolve(conflict, strategy, ours)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workflows", &self.inner.workflows.len())
            .field("transactions", &self.inner.transactions.len())
            .field("subscribers", &self.inner.bus.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::PendingWrite;
    use serde_json::json;
    use sheetflow_types::error::{OperationError, StoreError};
    use sheetflow_types::operation::{OperationKind, OperationOutput, ParamField};
    use sheetflow_types::range::Grid;
    use sheetflow_types::transaction::TransactionStatus;
    use sheetflow_types::workflow::OperationStatus;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Book {
        cells: Arc<Mutex<HashMap<RangeKey, Grid>>>,
        delay: Option<Duration>,
    }

    impl Book {
        fn get(&self, key: &RangeKey) -> Option<Grid> {
            self.cells.lock().unwrap().get(key).cloned()
        }
    }

    impl OperationExecutor for Book {
        fn name(&self) -> &str {
            "book"
        }

        async fn execute(&self, op: &Operation) -> Result<OperationOutput, OperationError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut cells = self.cells.lock().unwrap();
            match &op.kind {
                OperationKind::ReadRange => {
                    let values = cells.get(&op.target).cloned().unwrap_or_default();
                    Ok(OperationOutput::new(json!({ "values": values })))
                }
                OperationKind::WriteRange { values } => {
                    cells.insert(op.target.clone(), values.clone());
                    Ok(OperationOutput::new(json!({ "updated": 1 })))
                }
                _ => Ok(OperationOutput::new(Value::Null)),
            }
        }
    }

    impl SnapshotStore for Book {
        async fn read_range(&self, key: &RangeKey) -> Result<Grid, StoreError> {
            Ok(self.get(key).unwrap_or_default())
        }

        async fn write_range(&self, key: &RangeKey, values: &Grid) -> Result<(), StoreError> {
            self.cells.lock().unwrap().insert(key.clone(), values.clone());
            Ok(())
        }
    }

    fn key(a1: &str) -> RangeKey {
        RangeKey::parse("book", a1).unwrap()
    }

    fn engine(book: &Book) -> Engine {
        Engine::new(book.clone(), book.clone(), EngineConfig::default()).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let book = Book::default();
        let config = EngineConfig {
            max_concurrency: 0,
            ..EngineConfig::default()
        };
        let err = Engine::new(book.clone(), book, config).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn submitted_workflow_runs_to_completion() {
        let book = Book::default();
        let engine = engine(&book);
        let mut events = engine.subscribe();

        let ops = vec![
            Operation::write("w", key("S!A1"), vec![vec![json!("x")]]),
            Operation::read("r", key("S!A1")).depends_on(["w"]),
        ];
        let handle = engine.submit_workflow(ops, None, None).unwrap();
        let result = engine.await_result(handle).await.unwrap();

        assert!(result.success);
        assert_eq!(result.workflow_id, handle.0);
        assert_eq!(
            result.outcome("r").unwrap().output,
            Some(json!({ "values": [["x"]] }))
        );
        assert!(matches!(events.recv().await.unwrap(), EngineEvent::WorkflowStarted { .. }));

        // A collected handle is released.
        assert!(matches!(
            engine.await_result(handle).await,
            Err(EngineError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn build_errors_surface_before_submission() {
        let engine = engine(&Book::default());
        let ops = vec![
            Operation::read("a", key("S!A1")).depends_on(["b"]),
            Operation::read("b", key("S!A2")).depends_on(["a"]),
        ];
        let err = engine.submit_workflow(ops, None, None).unwrap_err();
        assert!(matches!(err, EngineError::Workflow(WorkflowError::CyclicDependency(_))));
        assert!(engine.pending_workflows().is_empty());
    }

    #[tokio::test]
    async fn context_variables_fill_parameters() {
        let book = Book::default();
        let engine = engine(&book);
        let ops = vec![Operation::write("w", key("S!B2"), vec![]).bind(ParamField::Values, "seed")];
        let variables = HashMap::from([("seed".to_string(), json!([[7]]))]);

        let handle = engine
            .submit_workflow_with_context(ops, None, None, variables)
            .unwrap();
        engine.await_result(handle).await.unwrap();
        assert_eq!(book.get(&key("S!B2")), Some(vec![vec![json!(7)]]));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_pending_levels() {
        let book = Book {
            delay: Some(Duration::from_millis(100)),
            ..Book::default()
        };
        let engine = engine(&book);
        let ops = vec![
            Operation::read("a", key("S!A1")),
            Operation::read("b", key("S!A2")).depends_on(["a"]),
        ];
        let handle = engine.submit_workflow(ops, None, None).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.cancel_workflow(handle).unwrap();

        let err = engine.await_result(handle).await.unwrap_err();
        let partial = err.partial_result().unwrap();
        assert!(partial.cancelled);
        assert_eq!(partial.outcome("a").unwrap().status, OperationStatus::Succeeded);
        assert_eq!(partial.outcome("b").unwrap().status, OperationStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_wait_leaves_result_collectable() {
        let book = Book {
            delay: Some(Duration::from_millis(100)),
            ..Book::default()
        };
        let engine = engine(&book);
        let ops = vec![Operation::write("w", key("S!A1"), vec![vec![json!("x")]])];
        let handle = engine.submit_workflow(ops, None, None).unwrap();

        let gave_up = tokio::time::timeout(Duration::from_millis(10), engine.await_result(handle)).await;
        assert!(gave_up.is_err());
        assert_eq!(engine.pending_workflows(), vec![handle]);

        let result = engine.await_result(handle).await.unwrap();
        assert!(result.success);
        assert!(engine.pending_workflows().is_empty());
        assert_eq!(engine.inner.transactions.len(), 0);
    }

    #[tokio::test]
    async fn transaction_round_trip_through_facade() {
        let book = Book::default();
        let engine = engine(&book);
        let target = key("S!A1:B1");

        let tx = engine
            .begin_transaction(Scope::single(target.clone()))
            .await
            .unwrap();
        engine
            .enqueue_operation(tx, Operation::write("w", target.clone(), vec![vec![json!(1), json!(2)]]))
            .await
            .unwrap();
        let result = engine.commit_transaction(tx).await.unwrap();
        assert!(result.is_committed());

        let info = engine.transaction_info(tx).await.unwrap();
        assert_eq!(info.status, TransactionStatus::Committed);
        assert_eq!(engine.check_version(&target).await.unwrap().version, 2);

        let conflict = engine.detect_conflict(&target, 1).await.unwrap().unwrap();
        let ours = ResolutionInput {
            pending: PendingWrite::Cells(vec![vec![json!(3)]]),
            written_at: chrono::Utc::now(),
        };
        assert_eq!(
            engine.resolve_conflict(&conflict, ResolutionStrategy::Cancel, &ours),
            Resolution::Discard
        );
        assert!(matches!(
            engine.resolve_conflict(&conflict, ResolutionStrategy::Manual, &ours),
            Resolution::Manual(_)
        ));

        engine.rollback_transaction(tx).await.unwrap();
        assert_eq!(book.get(&target), Some(Vec::new()));
        engine.discard_transaction(tx).await.unwrap();
        assert!(matches!(
            engine.transaction_info(tx).await,
            Err(EngineError::Transaction(TransactionError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn unknown_workflow_handle() {
        let engine = engine(&Book::default());
        let handle = WorkflowHandle(uuid::Uuid::now_v7());
        assert!(matches!(
            engine.cancel_workflow(handle),
            Err(EngineError::WorkflowNotFound(_))
        ));
    }
}
