//! End-to-end scenarios: the engine driving an in-memory workbook.

use std::time::Duration;

use serde_json::json;
use sheetflow_core::transaction::TransactionError;
use sheetflow_core::{Engine, EngineError};
use sheetflow_infra::InMemoryWorkbook;
use sheetflow_types::config::EngineConfig;
use sheetflow_types::conflict::ResolutionStrategy;
use sheetflow_types::error::OperationError;
use sheetflow_types::operation::Operation;
use sheetflow_types::range::{Grid, Scope};
use sheetflow_types::transaction::TransactionStatus;
use sheetflow_types::workflow::{ExecutionStrategy, OperationStatus};

fn workbook() -> InMemoryWorkbook {
    let wb = InMemoryWorkbook::new("budget");
    wb.add_sheet(
        "Q1",
        vec![
            vec![json!("old-1"), json!("old-2"), json!("old-3")],
            vec![json!(1), json!(2), json!(3)],
        ],
    );
    wb
}

fn engine(wb: &InMemoryWorkbook, config: EngineConfig) -> Engine {
    Engine::new(wb.clone(), wb.clone(), config).unwrap()
}

fn grid(value: &str) -> Grid {
    vec![vec![json!(value)]]
}

#[tokio::test(start_paused = true)]
async fn independent_reads_run_together_and_dependent_waits() {
    let wb = workbook();
    wb.set_latency(Duration::from_millis(50));
    let engine = engine(
        &wb,
        EngineConfig {
            max_concurrency: 2,
            ..EngineConfig::default()
        },
    );

    let ops = vec![
        Operation::read("A", wb.key("Q1!A1").unwrap()),
        Operation::read("B", wb.key("Q1!B1").unwrap()),
        Operation::read("C", wb.key("Q1!C1").unwrap()).depends_on(["A", "B"]),
    ];
    let result = engine
        .execute_workflow(ops, Some(ExecutionStrategy::Adaptive), None)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.levels_executed, 2);
    assert_eq!(wb.max_concurrency(), 2);
    let started = wb.started();
    assert_eq!(started.len(), 3);
    assert_eq!(started[2], "C");
}

#[tokio::test]
async fn failed_write_restores_earlier_ranges() {
    let wb = workbook();
    let engine = engine(&wb, EngineConfig::default());
    let (r1, r2, r3) = (
        wb.key("Q1!A1").unwrap(),
        wb.key("Q1!B1").unwrap(),
        wb.key("Q1!C1").unwrap(),
    );
    wb.fail_range(r3.clone(), OperationError::Permanent("protected".into()), 1);

    let tx = engine
        .begin_transaction(Scope::new(vec![r1.clone(), r2.clone(), r3.clone()]))
        .await
        .unwrap();
    engine
        .enqueue_operation(tx, Operation::write("w1", r1.clone(), grid("new-1")))
        .await
        .unwrap();
    engine
        .enqueue_operation(tx, Operation::write("w2", r2.clone(), grid("new-2")))
        .await
        .unwrap();
    engine
        .enqueue_operation(tx, Operation::write("w3", r3.clone(), grid("new-3")))
        .await
        .unwrap();

    let result = engine.commit_transaction(tx).await.unwrap();

    assert_eq!(result.status, TransactionStatus::RolledBack);
    let failure = result.failure.as_ref().unwrap();
    assert_eq!(failure.operation_id, "w3");
    assert!(failure.error.contains("protected"));
    assert!(result.restored.contains(&r1));
    assert!(result.restored.contains(&r2));
    assert!(!result.rollback_failed());
    assert_eq!(wb.values(&r1), Some(grid("old-1")));
    assert_eq!(wb.values(&r2), Some(grid("old-2")));
    assert_eq!(wb.values(&r3), Some(grid("old-3")));
}

/// Bring `Q1!A1` to version 5 through four committed writes.
async fn bump_to_version_five(engine: &Engine, wb: &InMemoryWorkbook) {
    let key = wb.key("Q1!A1").unwrap();
    for i in 0..4 {
        let tx = engine.begin_transaction(Scope::single(key.clone())).await.unwrap();
        engine
            .enqueue_operation(tx, Operation::write(format!("seed{i}"), key.clone(), grid(&format!("v{}", i + 2))))
            .await
            .unwrap();
        assert!(engine.commit_transaction(tx).await.unwrap().is_committed());
    }
    assert_eq!(engine.check_version(&key).await.unwrap().version, 5);
}

#[tokio::test]
async fn stale_writer_conflicts_under_manual_resolution() {
    let wb = workbook();
    let engine = engine(&wb, EngineConfig::default());
    bump_to_version_five(&engine, &wb).await;
    let key = wb.key("Q1!A1").unwrap();

    let actor2 = engine.begin_transaction(Scope::single(key.clone())).await.unwrap();
    engine
        .enqueue_operation(actor2, Operation::write("actor2", key.clone(), grid("two")).expect_version(5))
        .await
        .unwrap();

    let actor1 = engine.begin_transaction(Scope::single(key.clone())).await.unwrap();
    engine
        .enqueue_operation(actor1, Operation::write("actor1", key.clone(), grid("one")).expect_version(5))
        .await
        .unwrap();
    assert!(engine.commit_transaction(actor1).await.unwrap().is_committed());
    assert_eq!(engine.check_version(&key).await.unwrap().version, 6);

    let err = engine.commit_transaction(actor2).await.unwrap_err();
    let EngineError::Transaction(TransactionError::Conflict { conflicts }) = err else {
        panic!("expected a conflict, got {err:?}");
    };
    assert_eq!(conflicts[0].expected_version, 5);
    assert_eq!(conflicts[0].actual_version, 6);
    assert_eq!(wb.values(&key), Some(grid("one")));
    assert_eq!(
        engine.transaction_info(actor2).await.unwrap().status,
        TransactionStatus::Failed
    );
}

#[tokio::test]
async fn last_write_wins_compares_write_times() {
    let wb = workbook();
    let engine = engine(
        &wb,
        EngineConfig {
            auto_resolve_conflicts: true,
            default_resolution_strategy: ResolutionStrategy::LastWriteWins,
            ..EngineConfig::default()
        },
    );
    bump_to_version_five(&engine, &wb).await;
    let key = wb.key("Q1!A1").unwrap();

    // Written before actor 1 commits: older, dropped.
    let early = engine.begin_transaction(Scope::single(key.clone())).await.unwrap();
    engine
        .enqueue_operation(early, Operation::write("early", key.clone(), grid("early")).expect_version(5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let actor1 = engine.begin_transaction(Scope::single(key.clone())).await.unwrap();
    engine
        .enqueue_operation(actor1, Operation::write("actor1", key.clone(), grid("one")).expect_version(5))
        .await
        .unwrap();
    assert!(engine.commit_transaction(actor1).await.unwrap().is_committed());
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Written after actor 1 commits: newer, applied.
    let late = engine.begin_transaction(Scope::single(key.clone())).await.unwrap();
    engine
        .enqueue_operation(late, Operation::write("late", key.clone(), grid("late")).expect_version(5))
        .await
        .unwrap();

    let dropped = engine.commit_transaction(early).await.unwrap();
    assert_eq!(dropped.discarded, vec!["early".to_string()]);
    assert_eq!(wb.values(&key), Some(grid("one")));

    let applied = engine.commit_transaction(late).await.unwrap();
    assert!(applied.is_committed());
    assert_eq!(applied.applied, vec!["late".to_string()]);
    assert_eq!(wb.values(&key), Some(grid("late")));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_recover_with_recorded_retries() {
    let wb = workbook();
    wb.fail_operation("flaky", OperationError::Transient("rate limited".into()), 2);
    let engine = engine(
        &wb,
        EngineConfig {
            retry_max_attempts: 3,
            ..EngineConfig::default()
        },
    );

    let result = engine
        .execute_workflow(vec![Operation::read("flaky", wb.key("Q1!A2:C2").unwrap())], None, None)
        .await
        .unwrap();

    let outcome = result.outcome("flaky").unwrap();
    assert_eq!(outcome.status, OperationStatus::Succeeded);
    assert_eq!(outcome.retries.len(), 2);
    assert_eq!(outcome.output.as_ref().unwrap()["values"], json!([[1, 2, 3]]));
}

#[tokio::test(start_paused = true)]
async fn overlapping_exclusive_begins_admit_one() {
    let wb = workbook();
    let engine = engine(
        &wb,
        EngineConfig {
            require_exclusive_scope: true,
            scope_wait_ms: 100,
            ..EngineConfig::default()
        },
    );

    let (a, b) = tokio::join!(
        engine.begin_transaction(Scope::single(wb.key("Q1!A1:B2").unwrap())),
        engine.begin_transaction(Scope::single(wb.key("Q1!B2:C2").unwrap())),
    );
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let err = outcomes.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(err, EngineError::Transaction(TransactionError::ScopeUnavailable)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn rollback_is_idempotent_and_versions_only_grow() {
    let wb = workbook();
    let engine = engine(&wb, EngineConfig::default());
    let key = wb.key("Q1!A1:B1").unwrap();
    let mut versions = vec![engine.check_version(&key).await.unwrap().version];

    let tx = engine.begin_transaction(Scope::single(key.clone())).await.unwrap();
    engine
        .enqueue_operation(tx, Operation::write("w", key.clone(), vec![vec![json!("x"), json!("y")]]))
        .await
        .unwrap();
    engine.commit_transaction(tx).await.unwrap();
    versions.push(engine.check_version(&key).await.unwrap().version);

    let first = engine.rollback_transaction(tx).await.unwrap();
    assert!(!first.already_rolled_back);
    assert_eq!(first.restored, vec![key.clone()]);
    versions.push(engine.check_version(&key).await.unwrap().version);
    let writes = wb.store_writes();

    let second = engine.rollback_transaction(tx).await.unwrap();
    assert!(second.already_rolled_back);
    assert!(second.restored.is_empty());
    assert_eq!(wb.store_writes(), writes);
    versions.push(engine.check_version(&key).await.unwrap().version);

    assert_eq!(wb.values(&key), Some(vec![vec![json!("old-1"), json!("old-2")]]));
    assert!(versions.windows(2).all(|w| w[0] <= w[1]));
    assert!(versions[2] > versions[1]);
}

#[tokio::test(start_paused = true)]
async fn cached_reads_expire_and_commits_invalidate() {
    let wb = workbook();
    let engine = engine(
        &wb,
        EngineConfig {
            cache_ttl_ms: 1_000,
            ..EngineConfig::default()
        },
    );
    let read = || vec![Operation::read("r", wb.key("Q1!A1").unwrap())];
    let from_cache = |result: &sheetflow_types::workflow::WorkflowExecutionResult| {
        result.outcome("r").unwrap().from_cache
    };

    let first = engine.execute_workflow(read(), None, None).await.unwrap();
    let second = engine.execute_workflow(read(), None, None).await.unwrap();
    assert!(!from_cache(&first));
    assert!(from_cache(&second));

    tokio::time::advance(Duration::from_millis(1_001)).await;
    let expired = engine.execute_workflow(read(), None, None).await.unwrap();
    assert!(!from_cache(&expired));

    engine
        .execute_workflow(vec![Operation::write("w", wb.key("Q1!A1").unwrap(), grid("fresh"))], None, None)
        .await
        .unwrap();
    let after_write = engine.execute_workflow(read(), None, None).await.unwrap();
    assert!(!from_cache(&after_write));
    assert_eq!(
        after_write.outcome("r").unwrap().output.as_ref().unwrap()["values"],
        json!([["fresh"]])
    );
}
