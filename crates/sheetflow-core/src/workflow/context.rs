//! Execution context and parameter inference.
//!
//! `ExecutionContext` carries caller-supplied variables and the named outputs
//! of completed operations through a workflow run. Before an operation with
//! `ParamBinding` markers is dispatched, `resolve_operation` fills each bound
//! field from the context and returns a fully specified copy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sheetflow_types::operation::{Operation, OperationKind, ParamBinding, ParamField};
use sheetflow_types::range::{CellRange, Grid, RangeKey};

use super::builder::WorkflowError;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Variables and operation outputs visible to parameter inference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Caller-supplied values, looked up before any operation output.
    pub variables: HashMap<String, Value>,
    /// Output payloads of completed operations keyed by operation ID.
    pub outputs: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            outputs: HashMap::new(),
        }
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn set_output(&mut self, operation_id: &str, output: Value) {
        self.outputs.insert(operation_id.to_string(), output);
    }

    pub fn output(&self, operation_id: &str) -> Option<&Value> {
        self.outputs.get(operation_id)
    }

    /// Look a binding key up for `op`.
    ///
    /// Order: variables, then `dep.name` against the output of a declared
    /// dependency, then a bare `name` against the outputs of `op`'s
    /// dependencies in declared order. Outputs of operations `op` does not
    /// depend on are never visible.
    fn lookup(&self, op: &Operation, key: &str) -> Option<&Value> {
        if let Some(value) = self.variables.get(key) {
            return Some(value);
        }
        let qualified = key
            .split_once('.')
            .filter(|(dep, _)| op.depends_on.iter().any(|d| d == dep))
            .and_then(|(dep, name)| self.outputs.get(dep)?.get(name));
        if qualified.is_some() {
            return qualified;
        }
        op.depends_on
            .iter()
            .filter_map(|dep| self.outputs.get(dep))
            .find_map(|out| out.get(key))
    }

    /// Return a copy of `op` with every bound field filled in.
    ///
    /// Operations without bindings come back unchanged. A binding that
    /// resolves to nothing (and has no default) or to a value of the wrong
    /// shape fails with `StepParameterUnresolved`.
    pub fn resolve_operation(&self, op: &Operation) -> Result<Operation, WorkflowError> {
        if !op.has_unresolved() {
            return Ok(op.clone());
        }

        let mut resolved = op.clone();
        resolved.bindings.clear();

        for binding in &op.bindings {
            let value = self
                .lookup(op, &binding.key)
                .or(binding.default.as_ref())
                .ok_or_else(|| {
                    unresolved(op, binding, "no value in variables or dependency outputs")
                })?;
            apply(&mut resolved, binding, value).map_err(|reason| unresolved(op, binding, &reason))?;
        }

        tracing::debug!(
            operation_id = %op.id,
            bindings = op.bindings.len(),
            "resolved operation parameters"
        );
        Ok(resolved)
    }
}

fn unresolved(op: &Operation, binding: &ParamBinding, reason: &str) -> WorkflowError {
    WorkflowError::StepParameterUnresolved {
        operation_id: op.id.clone(),
        field: binding.field,
        key: binding.key.clone(),
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Field conversion
// ---------------------------------------------------------------------------

fn apply(op: &mut Operation, binding: &ParamBinding, value: &Value) -> Result<(), String> {
    match (binding.field, &mut op.kind) {
        (ParamField::Values, OperationKind::WriteRange { values }) => {
            *values = to_grid(value)?;
        }
        (ParamField::Rows, OperationKind::AppendRows { rows }) => {
            *rows = to_grid(value)?;
        }
        (ParamField::Title, OperationKind::CreateChart { title, .. }) => {
            *title = Some(match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                other => return Err(format!("expected a string title, got {}", type_name(other))),
            });
        }
        (ParamField::Range, _) => {
            let a1 = value
                .as_str()
                .ok_or_else(|| format!("expected an A1 range string, got {}", type_name(value)))?;
            let range = CellRange::parse(a1).map_err(|e| e.to_string())?;
            op.target = RangeKey::new(op.target.resource_id.clone(), range);
        }
        (field, kind) => {
            return Err(format!("{} has no '{field}' field", kind.name()));
        }
    }
    Ok(())
}

/// Accept an array of arrays, or an array of scalars as a single row.
fn to_grid(value: &Value) -> Result<Grid, String> {
    let Value::Array(items) = value else {
        return Err(format!("expected a grid, got {}", type_name(value)));
    };
    if items.iter().all(Value::is_array) {
        Ok(items
            .iter()
            .map(|row| row.as_array().cloned().unwrap_or_default())
            .collect())
    } else if items.iter().any(Value::is_array) {
        Err("grid mixes rows and scalar cells".to_string())
    } else {
        Ok(vec![items.clone()])
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sheetflow_types::operation::ChartType;

    fn key(a1: &str) -> RangeKey {
        RangeKey::parse("book", a1).unwrap()
    }

    fn ctx_with_read() -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.set_output("read", json!({ "values": [[1, 2], [3, 4]], "range": "Src!A1:B2" }));
        ctx
    }

    #[test]
    fn qualified_key_resolves_from_named_output() {
        let op = Operation::write("copy", key("Out!A1:B2"), vec![])
            .depends_on(["read"])
            .bind(ParamField::Values, "read.values");
        let resolved = ctx_with_read().resolve_operation(&op).unwrap();
        assert_eq!(
            resolved.kind,
            OperationKind::WriteRange {
                values: vec![vec![json!(1), json!(2)], vec![json!(3), json!(4)]]
            }
        );
        assert!(!resolved.has_unresolved());
    }

    #[test]
    fn bare_key_searches_dependencies() {
        let op = Operation::write("copy", key("Out!A1:B2"), vec![])
            .depends_on(["read"])
            .bind(ParamField::Values, "values");
        assert!(ctx_with_read().resolve_operation(&op).is_ok());

        // Not a dependency: bare key does not reach it.
        let unrelated = Operation::write("copy", key("Out!A1:B2"), vec![])
            .bind(ParamField::Values, "values");
        assert!(ctx_with_read().resolve_operation(&unrelated).is_err());
    }

    #[test]
    fn qualified_key_ignores_operations_outside_dependencies() {
        let op = Operation::write("copy", key("Out!A1:B2"), vec![]).bind(ParamField::Values, "read.values");
        let err = ctx_with_read().resolve_operation(&op).unwrap_err();
        assert!(matches!(err, WorkflowError::StepParameterUnresolved { .. }));

        // A variable with a dotted name still resolves.
        let mut ctx = ctx_with_read();
        ctx.set_variable("read.values", json!([["var"]]));
        assert!(ctx.resolve_operation(&op).is_ok());
    }

    #[test]
    fn variables_take_precedence() {
        let mut ctx = ctx_with_read();
        ctx.set_variable("values", json!([["override"]]));
        let op = Operation::write("copy", key("Out!A1"), vec![])
            .depends_on(["read"])
            .bind(ParamField::Values, "values");
        let resolved = ctx.resolve_operation(&op).unwrap();
        assert_eq!(
            resolved.kind,
            OperationKind::WriteRange {
                values: vec![vec![json!("override")]]
            }
        );
    }

    #[test]
    fn scalar_array_becomes_single_row() {
        let mut ctx = ExecutionContext::new();
        ctx.set_variable("row", json!(["a", "b"]));
        let op = Operation::new(
            "append",
            key("Log!A1:B100"),
            OperationKind::AppendRows { rows: vec![] },
        )
        .bind(ParamField::Rows, "row");
        let resolved = ctx.resolve_operation(&op).unwrap();
        assert_eq!(
            resolved.kind,
            OperationKind::AppendRows {
                rows: vec![vec![json!("a"), json!("b")]]
            }
        );
    }

    #[test]
    fn range_binding_retargets_same_resource() {
        let op = Operation::read("r", key("S!A1"))
            .depends_on(["read"])
            .bind(ParamField::Range, "read.range");
        let resolved = ctx_with_read().resolve_operation(&op).unwrap();
        assert_eq!(resolved.target, key("Src!A1:B2"));
    }

    #[test]
    fn default_applies_when_missing() {
        let op = Operation::new(
            "chart",
            key("S!A1:B5"),
            OperationKind::CreateChart {
                chart_type: ChartType::Bar,
                title: None,
            },
        )
        .bind_with_default(ParamField::Title, "title", json!("Totals"));
        let resolved = ExecutionContext::new().resolve_operation(&op).unwrap();
        assert_eq!(
            resolved.kind,
            OperationKind::CreateChart {
                chart_type: ChartType::Bar,
                title: Some("Totals".into())
            }
        );
    }

    #[test]
    fn wrong_shape_is_unresolved() {
        let mut ctx = ExecutionContext::new();
        ctx.set_variable("values", json!({ "not": "a grid" }));
        let op = Operation::write("w", key("S!A1"), vec![]).bind(ParamField::Values, "values");
        let err = ctx.resolve_operation(&op).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::StepParameterUnresolved { field: ParamField::Values, .. }
        ));
        assert!(err.to_string().contains("expected a grid"));
    }

    #[test]
    fn missing_value_is_unresolved() {
        let op = Operation::write("w", key("S!A1"), vec![]).bind(ParamField::Values, "nowhere");
        let err = ExecutionContext::new().resolve_operation(&op).unwrap_err();
        assert!(err.is_terminal());
        assert!(err.to_string().contains("nowhere"));
    }
}
