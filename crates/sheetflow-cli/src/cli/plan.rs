//! Workflow plan files.
//!
//! A plan lists operations against one workbook with ranges in A1 notation:
//!
//! ```yaml
//! strategy: adaptive
//! variables:
//!   title: Q1 totals
//! operations:
//!   - id: totals
//!     type: read_range
//!     range: Q1!A1:C10
//!   - id: copy
//!     type: write_range
//!     range: Summary!A1
//!     depends_on: [totals]
//!     bindings:
//!       - { field: values, key: totals.values }
//! ```
//!
//! Files ending in `.yaml`/`.yml` are parsed as YAML, anything else as JSON.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sheetflow_types::conflict::ResolutionStrategy;
use sheetflow_types::operation::{Operation, OperationKind, ParamBinding};
use sheetflow_types::range::RangeKey;
use sheetflow_types::workflow::ExecutionStrategy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ExecutionStrategy>,
    /// Seed values for the shared execution context.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub operations: Vec<PlanOperation>,
}

/// One operation as written in a plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOperation {
    pub id: String,
    /// A1 range, e.g. `Sheet1!A1:C3` or `Sheet1` for the whole sheet.
    pub range: String,
    /// Overrides the workbook's resource id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(flatten)]
    pub kind: OperationKind,
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub bindings: Vec<ParamBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionStrategy>,
    #[serde(default)]
    pub confirmed: bool,
}

impl PlanOperation {
    fn into_operation(self, default_resource: &str) -> Result<Operation> {
        let resource = self.resource_id.as_deref().unwrap_or(default_resource);
        let target = RangeKey::parse(resource, &self.range)
            .with_context(|| format!("operation '{}' has an invalid range '{}'", self.id, self.range))?;

        let mut op = Operation::new(self.id, target, self.kind);
        // Reads are always safe to re-dispatch.
        op.idempotent = self.idempotent || op.kind.is_read_only();
        op.optional = self.optional;
        op.depends_on = self.depends_on;
        op.bindings = self.bindings;
        op.expected_version = self.expected_version;
        op.resolution = self.resolution;
        op.confirmed = self.confirmed;
        Ok(op)
    }
}

impl Plan {
    pub fn parse(content: &str, yaml: bool) -> Result<Self> {
        if yaml {
            serde_yaml_ng::from_str(content).context("invalid YAML plan")
        } else {
            serde_json::from_str(content).context("invalid JSON plan")
        }
    }

    /// Operations with targets resolved against `default_resource`.
    pub fn operations(&self, default_resource: &str) -> Result<Vec<Operation>> {
        self.operations
            .iter()
            .cloned()
            .map(|op| op.into_operation(default_resource))
            .collect()
    }
}

/// Read and parse a plan file.
pub async fn load_plan(path: &Path) -> Result<Plan> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    let yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let plan = Plan::parse(&content, yaml).with_context(|| format!("in {}", path.display()))?;
    tracing::debug!(
        path = %path.display(),
        operations = plan.operations.len(),
        "plan loaded"
    );
    Ok(plan)
}
