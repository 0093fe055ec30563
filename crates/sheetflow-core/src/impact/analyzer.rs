//! Impact analyzer.
//!
//! Assessments are side-effect free: the only remote call is the artifact
//! catalog lookup, and a failing lookup degrades to a warning.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use sheetflow_types::config::EngineConfig;
use sheetflow_types::event::EngineEvent;
use sheetflow_types::impact::{ArtifactKind, DependentArtifact, ImpactReport, ImpactSeverity};
use sheetflow_types::operation::{Operation, OperationKind};
use sheetflow_types::range::grid_dimensions;

use crate::event::StatsSink;
use crate::store::BoxSnapshotStore;

use super::cost::CostModel;

const CRITICAL_CELLS: u64 = 100_000;
const HIGH_CELLS: u64 = 10_000;
const MEDIUM_CELLS: u64 = 1_000;
const HIGH_DEPENDENTS: usize = 5;

/// Classify an operation from its scope size and dependent artifacts.
///
/// Reads never rise above medium and ignore dependents.
pub fn classify_severity(kind: &OperationKind, cells: u64, dependents: &[DependentArtifact]) -> ImpactSeverity {
    if kind.is_read_only() {
        return if cells > HIGH_CELLS {
            ImpactSeverity::Medium
        } else {
            ImpactSeverity::Low
        };
    }

    let severity = if kind.is_structural() || cells > CRITICAL_CELLS {
        ImpactSeverity::Critical
    } else if cells > HIGH_CELLS || dependents.len() >= HIGH_DEPENDENTS {
        ImpactSeverity::High
    } else if cells > MEDIUM_CELLS || !dependents.is_empty() {
        ImpactSeverity::Medium
    } else {
        ImpactSeverity::Low
    };

    if dependents.iter().any(|d| d.kind == ArtifactKind::ProtectedRange) {
        severity.max(ImpactSeverity::High)
    } else {
        severity
    }
}

/// Rows, columns and cells an operation touches.
///
/// Payload-carrying kinds are measured by their payload; everything else by
/// the target range.
fn scope_dimensions(operation: &Operation) -> (u64, u64) {
    let payload = match &operation.kind {
        OperationKind::WriteRange { values } => Some(values),
        OperationKind::AppendRows { rows } => Some(rows),
        _ => None,
    };
    match payload.map(grid_dimensions) {
        Some((rows, cols)) if rows > 0 => (rows as u64, cols as u64),
        _ => (
            operation.target.range.row_count(),
            operation.target.range.column_count(),
        ),
    }
}

fn artifact_label(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Formula => "formula",
        ArtifactKind::Chart => "chart",
        ArtifactKind::PivotTable => "pivot table",
        ArtifactKind::ValidationRule => "validation rule",
        ArtifactKind::NamedRange => "named range",
        ArtifactKind::ProtectedRange => "protected range",
        ArtifactKind::ConditionalFormat => "conditional format",
    }
}

fn artifact_warning(kind: ArtifactKind, names: &[&str]) -> String {
    let list = names.join(", ");
    let label = artifact_label(kind);
    match kind {
        ArtifactKind::Formula => {
            format!("{} {label}(s) read from this range and will recalculate: {list}", names.len())
        }
        ArtifactKind::Chart | ArtifactKind::PivotTable => {
            format!("{} {label}(s) source data from this range: {list}", names.len())
        }
        ArtifactKind::ValidationRule => {
            format!("{label}(s) may reject the new values: {list}")
        }
        ArtifactKind::NamedRange => format!("named range(s) cover this range: {list}"),
        ArtifactKind::ProtectedRange => {
            format!("protected range(s) overlap and the service may refuse the change: {list}")
        }
        ArtifactKind::ConditionalFormat => {
            format!("{label} rule(s) will re-evaluate: {list}")
        }
    }
}

/// Pre-execution risk assessment.
pub struct ImpactAnalyzer {
    store: Arc<BoxSnapshotStore>,
    cost: CostModel,
    require_confirmation_for_critical: bool,
    sink: Arc<dyn StatsSink>,
}

impl ImpactAnalyzer {
    pub fn new(store: Arc<BoxSnapshotStore>, config: &EngineConfig, sink: Arc<dyn StatsSink>) -> Self {
        Self {
            store,
            cost: CostModel::new(),
            require_confirmation_for_critical: config.require_confirmation_for_critical,
            sink,
        }
    }

    pub fn with_cost_model(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost
    }

    /// Estimated duration without consulting the artifact catalog.
    pub fn estimate_ms(&self, operation: &Operation) -> u64 {
        let (rows, cols) = scope_dimensions(operation);
        self.cost.estimate_ms(&operation.kind, rows.saturating_mul(cols))
    }

    /// Assess `operation`. Never fails and never writes.
    pub async fn analyze(&self, operation: &Operation) -> ImpactReport {
        let (rows, columns) = scope_dimensions(operation);
        let cells = rows.saturating_mul(columns);
        let mut warnings = Vec::new();

        let dependents = if operation.kind.is_read_only() {
            Vec::new()
        } else {
            self.dependents(operation, &mut warnings).await
        };

        let severity = classify_severity(&operation.kind, cells, &dependents);
        let requires_confirmation =
            severity == ImpactSeverity::Critical && self.require_confirmation_for_critical;

        let mut grouped: BTreeMap<u8, (ArtifactKind, Vec<&str>)> = BTreeMap::new();
        for dep in &dependents {
            grouped
                .entry(dep.kind as u8)
                .or_insert_with(|| (dep.kind, Vec::new()))
                .1
                .push(dep.name.as_str());
        }
        for (kind, names) in grouped.values() {
            warnings.push(artifact_warning(*kind, names));
        }

        if operation.target.range.is_whole_sheet() && !operation.kind.is_structural() {
            warnings.push("targets a whole sheet; counts are upper bounds".to_string());
        }
        if operation.kind.is_structural() {
            warnings.push(format!(
                "deleting sheet '{}' also removes its formatting and charts, which rollback cannot restore",
                operation.target.sheet()
            ));
        } else if operation.is_mutating() && !operation.kind.changes_values() {
            warnings.push(format!("{} changes are not undone by rollback", operation.kind.name()));
        }
        if cells > HIGH_CELLS {
            warnings.push(format!("large scope: {cells} cells"));
        }

        let recommendations = self.recommendations(operation, cells, severity, &dependents, requires_confirmation);
        let estimated_duration_ms = self.cost.estimate_ms(&operation.kind, cells);

        tracing::info!(
            operation_id = %operation.id,
            kind = operation.kind.name(),
            severity = %severity,
            cells,
            dependents = dependents.len(),
            estimated_duration_ms,
            "impact assessed"
        );
        self.sink.record(EngineEvent::ImpactAssessed {
            operation_id: operation.id.clone(),
            severity,
            cells,
            dependents: dependents.len(),
        });

        ImpactReport {
            operation_id: operation.id.clone(),
            operation_kind: operation.kind.name().to_string(),
            target: operation.target.clone(),
            cells,
            rows,
            columns,
            dependents,
            estimated_duration_ms,
            severity,
            warnings,
            recommendations,
            requires_confirmation,
            analyzed_at: Utc::now(),
        }
    }

    async fn dependents(&self, operation: &Operation, warnings: &mut Vec<String>) -> Vec<DependentArtifact> {
        match self
            .store
            .dependent_artifacts(&operation.target.resource_id)
            .await
        {
            Ok(artifacts) => artifacts
                .into_iter()
                .filter(|a| a.range.overlaps(&operation.target.range))
                .collect(),
            Err(e) => {
                tracing::warn!(
                    operation_id = %operation.id,
                    error = %e,
                    "artifact catalog unavailable"
                );
                warnings.push(format!("dependent artifacts unknown: {e}"));
                Vec::new()
            }
        }
    }

    fn recommendations(
        &self,
        operation: &Operation,
        cells: u64,
        severity: ImpactSeverity,
        dependents: &[DependentArtifact],
        requires_confirmation: bool,
    ) -> Vec<String> {
        let mut out = Vec::new();
        if severity >= ImpactSeverity::High && operation.kind.changes_values() {
            out.push(format!("back up {} before running", operation.target));
        }
        let dispatches = self.cost.dispatches(cells);
        if dispatches > 1 && !operation.kind.is_structural() {
            out.push(format!(
                "split into {dispatches} batches of at most {} cells",
                self.cost.cells_per_dispatch
            ));
        }
        if dependents.iter().any(|d| d.kind == ArtifactKind::Formula) {
            out.push("review dependent formulas after the change".to_string());
        }
        if dependents.iter().any(|d| d.kind == ArtifactKind::ProtectedRange) {
            out.push("request edit access to the protected ranges first".to_string());
        }
        if requires_confirmation {
            out.push("mark the operation confirmed to proceed".to_string());
        }
        out
    }
}

impl std::fmt::Debug for ImpactAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpactAnalyzer")
            .field("cost", &self.cost)
            .field("require_confirmation_for_critical", &self.require_confirmation_for_critical)
            .finish()
    }
}
