//! Impact assessment types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::range::{CellRange, RangeKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ImpactSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ImpactSeverity::Low => "low",
            ImpactSeverity::Medium => "medium",
            ImpactSeverity::High => "high",
            ImpactSeverity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Workbook artifacts that can depend on cell content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Formula,
    Chart,
    PivotTable,
    ValidationRule,
    NamedRange,
    ProtectedRange,
    ConditionalFormat,
}

/// An artifact whose source range may be affected by an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentArtifact {
    pub kind: ArtifactKind,
    pub name: String,
    /// Range the artifact reads from or guards.
    pub range: CellRange,
}

/// Pre-execution assessment of a proposed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub operation_id: String,
    pub operation_kind: String,
    pub target: RangeKey,
    pub cells: u64,
    pub rows: u64,
    pub columns: u64,
    #[serde(default)]
    pub dependents: Vec<DependentArtifact>,
    pub estimated_duration_ms: u64,
    pub severity: ImpactSeverity,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Whether the orchestrator will refuse the operation without confirmation.
    pub requires_confirmation: bool,
    pub analyzed_at: DateTime<Utc>,
}

impl ImpactReport {
    pub fn dependents_of(&self, kind: ArtifactKind) -> impl Iterator<Item = &DependentArtifact> {
        self.dependents.iter().filter(move |d| d.kind == kind)
    }
}
