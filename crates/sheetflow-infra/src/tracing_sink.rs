//! Statistics sink that writes engine events to `tracing`.
//!
//! Lifecycle events log at `debug`, outcomes that need attention (failures,
//! conflicts, rollbacks) at `warn` or `error`. Attach it with
//! `Engine::with_sink`.

use sheetflow_core::event::StatsSink;
use sheetflow_types::event::EngineEvent;

/// Target used for every event, so they can be filtered as a group
/// (`RUST_LOG=sheetflow::events=debug`).
pub const EVENT_TARGET: &str = "sheetflow::events";

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Self {
        Self
    }
}

impl StatsSink for TracingSink {
    fn record(&self, event: EngineEvent) {
        let name = event.name();
        match event {
            EngineEvent::WorkflowStarted {
                workflow_id,
                operations,
                levels,
                strategy,
            } => tracing::debug!(
                target: EVENT_TARGET,
                event = name,
                %workflow_id,
                operations,
                levels,
                %strategy
            ),
            EngineEvent::LevelStarted {
                workflow_id,
                level,
                operations,
            } => tracing::debug!(target: EVENT_TARGET, event = name, %workflow_id, level, operations),
            EngineEvent::WorkflowCompleted {
                workflow_id,
                success,
                duration_ms,
                succeeded,
                failed,
            } => {
                if success {
                    tracing::info!(
                        target: EVENT_TARGET,
                        event = name,
                        %workflow_id,
                        duration_ms,
                        succeeded,
                        failed
                    );
                } else {
                    tracing::warn!(
                        target: EVENT_TARGET,
                        event = name,
                        %workflow_id,
                        duration_ms,
                        succeeded,
                        failed
                    );
                }
            }
            EngineEvent::OperationStarted {
                operation_id,
                kind,
                attempt,
                ..
            } => tracing::debug!(target: EVENT_TARGET, event = name, %operation_id, %kind, attempt),
            EngineEvent::OperationCompleted {
                operation_id,
                duration_ms,
                from_cache,
                ..
            } => tracing::debug!(target: EVENT_TARGET, event = name, %operation_id, duration_ms, from_cache),
            EngineEvent::OperationFailed {
                operation_id,
                error,
                will_retry,
                ..
            } => tracing::warn!(target: EVENT_TARGET, event = name, %operation_id, %error, will_retry),
            EngineEvent::CacheHit { operation_id, kind } | EngineEvent::CacheMiss { operation_id, kind } => {
                tracing::trace!(target: EVENT_TARGET, event = name, %operation_id, %kind)
            }
            EngineEvent::ConflictDetected {
                key,
                expected_version,
                actual_version,
                severity,
            } => tracing::warn!(
                target: EVENT_TARGET,
                event = name,
                %key,
                expected_version,
                actual_version,
                ?severity
            ),
            EngineEvent::ConflictResolved { key, strategy, outcome } => {
                tracing::info!(target: EVENT_TARGET, event = name, %key, %strategy, %outcome)
            }
            EngineEvent::TransactionBegun {
                transaction_id,
                ranges,
                exclusive,
            } => tracing::debug!(target: EVENT_TARGET, event = name, %transaction_id, ranges, exclusive),
            EngineEvent::TransactionCommitted {
                transaction_id,
                operations,
                batches,
                duration_ms,
            } => tracing::info!(
                target: EVENT_TARGET,
                event = name,
                %transaction_id,
                operations,
                batches,
                duration_ms
            ),
            EngineEvent::TransactionRolledBack {
                transaction_id,
                restored,
                reason,
            } => tracing::warn!(target: EVENT_TARGET, event = name, %transaction_id, restored, %reason),
            EngineEvent::RollbackFailed {
                transaction_id,
                failed_ranges,
            } => tracing::error!(
                target: EVENT_TARGET,
                event = name,
                %transaction_id,
                failed_ranges = %failed_ranges.join(", ")
            ),
            EngineEvent::ImpactAssessed {
                operation_id,
                severity,
                cells,
                dependents,
            } => tracing::debug!(
                target: EVENT_TARGET,
                event = name,
                %operation_id,
                %severity,
                cells,
                dependents
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetflow_types::conflict::ConflictSeverity;
    use sheetflow_types::transaction::TransactionHandle;

    #[test]
    fn records_every_kind_without_subscriber() {
        let sink = TracingSink::new();
        sink.record(EngineEvent::ConflictDetected {
            key: "book/S!A1".into(),
            expected_version: 1,
            actual_version: 2,
            severity: ConflictSeverity::Error,
        });
        sink.record(EngineEvent::RollbackFailed {
            transaction_id: TransactionHandle::new(),
            failed_ranges: vec!["book/S!A1".into(), "book/S!B1".into()],
        });
    }
}
