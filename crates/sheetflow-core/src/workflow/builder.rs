//! Workflow construction and build-time validation.
//!
//! `build_workflow` checks each operation's payload against its kind once,
//! verifies the dependency graph is acyclic, and assigns topological levels.

use std::collections::HashSet;

use sheetflow_types::config::EngineConfig;
use sheetflow_types::impact::ImpactSeverity;
use sheetflow_types::operation::{Operation, OperationKind, ParamField};
use sheetflow_types::range::grid_dimensions;
use sheetflow_types::workflow::{ExecutionStrategy, Workflow};
use thiserror::Error;
use uuid::Uuid;

use super::dag::build_levels;

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

/// Errors from building or executing a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    /// The dependency graph has a cycle.
    #[error("cyclic dependency: {0}")]
    CyclicDependency(String),

    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("duplicate operation id '{0}'")]
    DuplicateOperation(String),

    /// Payload does not fit the operation kind.
    #[error("invalid operation '{operation_id}': {reason}")]
    InvalidOperation { operation_id: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Parameter inference failed. Terminal, never retried.
    #[error("operation '{operation_id}': cannot resolve parameter '{field}' from '{key}': {reason}")]
    StepParameterUnresolved {
        operation_id: String,
        field: ParamField,
        key: String,
        reason: String,
    },

    /// A critical-impact operation was not confirmed.
    #[error("operation '{operation_id}' has {severity} impact and requires confirmation")]
    ConfirmationRequired {
        operation_id: String,
        severity: ImpactSeverity,
    },

    /// Retries exhausted or a permanent failure.
    #[error("operation '{operation_id}' failed: {error}")]
    OperationFailed { operation_id: String, error: String },

    #[error("workflow timed out after {0} ms")]
    WorkflowTimeout(u64),

    #[error("workflow cancelled")]
    Cancelled,
}

impl WorkflowError {
    /// Validation and inference errors are never retried.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowError::OperationFailed { .. })
    }

    fn invalid(op: &Operation, reason: impl Into<String>) -> Self {
        WorkflowError::InvalidOperation {
            operation_id: op.id.clone(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check an operation's payload against its kind.
pub fn validate_operation(op: &Operation) -> Result<(), WorkflowError> {
    if op.id.trim().is_empty() {
        return Err(WorkflowError::invalid(op, "operation id is empty"));
    }
    if op.target.resource_id.trim().is_empty() {
        return Err(WorkflowError::invalid(op, "target resource id is empty"));
    }

    for binding in &op.bindings {
        if !op.kind.accepts(binding.field) {
            return Err(WorkflowError::invalid(
                op,
                format!(
                    "{} has no '{}' field to bind",
                    op.kind.name(),
                    binding.field
                ),
            ));
        }
        if binding.key.trim().is_empty() {
            return Err(WorkflowError::invalid(
                op,
                format!("binding for '{}' has an empty key", binding.field),
            ));
        }
    }

    let bound = |field: ParamField| op.bindings.iter().any(|b| b.field == field);
    let range = &op.target.range;

    match &op.kind {
        OperationKind::WriteRange { values } => {
            if bound(ParamField::Values) {
                return Ok(());
            }
            if values.is_empty() {
                return Err(WorkflowError::invalid(op, "write_range has no values"));
            }
            let (rows, cols) = grid_dimensions(values);
            if !range.is_whole_sheet()
                && (rows as u64 > range.row_count() || cols as u64 > range.column_count())
            {
                return Err(WorkflowError::invalid(
                    op,
                    format!(
                        "{rows}x{cols} values do not fit {range} ({}x{})",
                        range.row_count(),
                        range.column_count()
                    ),
                ));
            }
        }
        OperationKind::AppendRows { rows } => {
            if rows.is_empty() && !bound(ParamField::Rows) {
                return Err(WorkflowError::invalid(op, "append_rows has no rows"));
            }
        }
        OperationKind::DeleteSheet => {
            if !range.is_whole_sheet() {
                return Err(WorkflowError::invalid(
                    op,
                    format!("delete_sheet must target a whole sheet, got {range}"),
                ));
            }
        }
        OperationKind::FormatRange { format } => {
            if format.bold.is_none()
                && format.italic.is_none()
                && format.number_format.is_none()
                && format.background.is_none()
            {
                return Err(WorkflowError::invalid(op, "format_range sets no format"));
            }
        }
        OperationKind::ReadRange | OperationKind::ClearRange | OperationKind::CreateChart { .. } => {}
    }

    Ok(())
}

/// A qualified binding `dep.name` that names another operation of the
/// workflow must list it in `depends_on`; otherwise whether its output exists
/// at resolution time depends on scheduling.
fn check_binding_sources(operations: &[Operation]) -> Result<(), WorkflowError> {
    let ids: HashSet<&str> = operations.iter().map(|op| op.id.as_str()).collect();
    for op in operations {
        for binding in &op.bindings {
            let Some((source, _)) = binding.key.split_once('.') else {
                continue;
            };
            if ids.contains(source) && !op.depends_on.iter().any(|dep| dep == source) {
                return Err(WorkflowError::invalid(
                    op,
                    format!(
                        "binding '{}' reads from '{source}', which is not a declared dependency",
                        binding.key
                    ),
                ));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// build_workflow
// ---------------------------------------------------------------------------

/// Validate operations and assemble a `Workflow` with topological levels.
///
/// `strategy_hint` defaults to adaptive.
pub fn build_workflow(
    operations: Vec<Operation>,
    strategy_hint: Option<ExecutionStrategy>,
    config: &EngineConfig,
) -> Result<Workflow, WorkflowError> {
    config.validate().map_err(WorkflowError::InvalidConfig)?;

    for op in &operations {
        validate_operation(op)?;
    }
    check_binding_sources(&operations)?;
    let levels = build_levels(&operations)?;

    let workflow = Workflow {
        id: Uuid::now_v7(),
        operations,
        strategy: strategy_hint.unwrap_or_default(),
        max_concurrency: config.max_concurrency,
        timeout_ms: config.workflow_timeout_ms,
        levels,
    };

    tracing::debug!(
        workflow_id = %workflow.id,
        operations = workflow.operations.len(),
        levels = workflow.levels.len(),
        strategy = %workflow.strategy,
        "built workflow"
    );

    Ok(workflow)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sheetflow_types::operation::CellFormat;
    use sheetflow_types::range::RangeKey;

    fn key(a1: &str) -> RangeKey {
        RangeKey::parse("book", a1).unwrap()
    }

    #[test]
    fn builds_levels_and_defaults_to_adaptive() {
        let ops = vec![
            Operation::read("a", key("S!A1")),
            Operation::read("b", key("S!B1")),
            Operation::read("c", key("S!C1")).depends_on(["a", "b"]),
        ];
        let wf = build_workflow(ops, None, &EngineConfig::default()).unwrap();
        assert_eq!(wf.strategy, ExecutionStrategy::Adaptive);
        assert_eq!(wf.levels, vec![vec![0, 1], vec![2]]);
        assert_eq!(wf.max_concurrency, 4);
    }

    #[test]
    fn cycle_is_validation_error() {
        let ops = vec![
            Operation::read("a", key("S!A1")).depends_on(["b"]),
            Operation::read("b", key("S!A1")).depends_on(["a"]),
        ];
        let err = build_workflow(ops, None, &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, WorkflowError::CyclicDependency(_)));
        assert!(err.is_terminal());
    }

    #[test]
    fn write_must_fit_range() {
        let op = Operation::write("w", key("S!A1:B1"), vec![vec![json!(1), json!(2), json!(3)]]);
        let err = validate_operation(&op).unwrap_err();
        assert!(err.to_string().contains("do not fit"));

        let fits = Operation::write("w", key("S!A1:C1"), vec![vec![json!(1), json!(2), json!(3)]]);
        assert!(validate_operation(&fits).is_ok());
    }

    #[test]
    fn empty_write_needs_binding() {
        let empty = Operation::write("w", key("S!A1:B2"), vec![]);
        assert!(validate_operation(&empty).is_err());

        let bound = empty.bind(ParamField::Values, "read.values");
        assert!(validate_operation(&bound).is_ok());
    }

    #[test]
    fn binding_must_target_existing_field() {
        let op = Operation::read("r", key("S!A1")).bind(ParamField::Title, "title");
        let err = validate_operation(&op).unwrap_err();
        assert!(err.to_string().contains("no 'title' field"));

        let ok = Operation::read("r", key("S!A1")).bind(ParamField::Range, "source_range");
        assert!(validate_operation(&ok).is_ok());
    }

    #[test]
    fn qualified_binding_requires_declared_dependency() {
        let ops = vec![
            Operation::read("a", key("S!A1")),
            Operation::write("w", key("S!B1"), vec![]).bind(ParamField::Values, "a.values"),
        ];
        for strategy in [ExecutionStrategy::Sequential, ExecutionStrategy::Adaptive] {
            let err = build_workflow(ops.clone(), Some(strategy), &EngineConfig::default()).unwrap_err();
            assert!(matches!(
                &err,
                WorkflowError::InvalidOperation { operation_id, .. } if operation_id == "w"
            ));
            assert!(err.to_string().contains("not a declared dependency"));
        }

        let declared = vec![
            Operation::read("a", key("S!A1")),
            Operation::write("w", key("S!B1"), vec![])
                .depends_on(["a"])
                .bind(ParamField::Values, "a.values"),
        ];
        assert!(build_workflow(declared, None, &EngineConfig::default()).is_ok());
    }

    #[test]
    fn delete_sheet_requires_whole_sheet() {
        let partial = Operation::new("d", key("S!A1:B2"), OperationKind::DeleteSheet);
        assert!(validate_operation(&partial).is_err());
        let whole = Operation::new("d", key("S"), OperationKind::DeleteSheet);
        assert!(validate_operation(&whole).is_ok());
    }

    #[test]
    fn empty_format_rejected() {
        let op = Operation::new(
            "f",
            key("S!A1"),
            OperationKind::FormatRange {
                format: CellFormat::default(),
            },
        );
        assert!(validate_operation(&op).is_err());
    }

    #[test]
    fn invalid_config_rejected() {
        let config = EngineConfig {
            max_concurrency: 0,
            ..EngineConfig::default()
        };
        let err = build_workflow(vec![], None, &config).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidConfig(_)));
    }
}
