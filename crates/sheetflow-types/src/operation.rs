//! Operation descriptors.
//!
//! An `Operation` is a single unit of work against one range of a remote
//! spreadsheet. Its payload shape is fixed per kind by the `OperationKind`
//! tagged enum; fields that are only known at run time are declared as
//! `ParamBinding` markers and filled in by parameter inference.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conflict::ResolutionStrategy;
use crate::range::{Grid, RangeKey};

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A single unit of work targeting a scoped resource range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Caller-assigned ID, unique within a workflow or transaction.
    pub id: String,
    /// Resource and range the operation acts on.
    pub target: RangeKey,
    /// Kind and kind-specific payload.
    pub kind: OperationKind,
    /// Safe to re-dispatch after an ambiguous failure.
    #[serde(default)]
    pub idempotent: bool,
    /// Failure does not fail the enclosing workflow or transaction.
    #[serde(default)]
    pub optional: bool,
    /// IDs of operations that must reach a terminal state first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Fields resolved at run time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<ParamBinding>,
    /// Version of the target the caller last observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
    /// Per-operation conflict strategy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionStrategy>,
    /// Caller confirmed a critical-impact operation.
    #[serde(default)]
    pub confirmed: bool,
}

impl Operation {
    pub fn new(id: impl Into<String>, target: RangeKey, kind: OperationKind) -> Self {
        Self {
            id: id.into(),
            target,
            kind,
            idempotent: false,
            optional: false,
            depends_on: Vec::new(),
            bindings: Vec::new(),
            expected_version: None,
            resolution: None,
            confirmed: false,
        }
    }

    pub fn read(id: impl Into<String>, target: RangeKey) -> Self {
        Self::new(id, target, OperationKind::ReadRange).idempotent()
    }

    pub fn write(id: impl Into<String>, target: RangeKey, values: Grid) -> Self {
        Self::new(id, target, OperationKind::WriteRange { values })
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn bind(mut self, field: ParamField, key: impl Into<String>) -> Self {
        self.bindings.push(ParamBinding {
            field,
            key: key.into(),
            default: None,
        });
        self
    }

    pub fn bind_with_default(
        mut self,
        field: ParamField,
        key: impl Into<String>,
        default: Value,
    ) -> Self {
        self.bindings.push(ParamBinding {
            field,
            key: key.into(),
            default: Some(default),
        });
        self
    }

    pub fn expect_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn resolve_with(mut self, strategy: ResolutionStrategy) -> Self {
        self.resolution = Some(strategy);
        self
    }

    pub fn is_mutating(&self) -> bool {
        self.kind.is_mutating()
    }

    /// Whether the operation still has fields waiting for inference.
    pub fn has_unresolved(&self) -> bool {
        !self.bindings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

/// Kind-specific payload. Internally tagged by `type`:
///
/// ```json
/// { "type": "write_range", "values": [[1, 2], [3, 4]] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    /// Read the values of the target range.
    ReadRange,
    /// Overwrite the target range, anchored at its top-left cell.
    WriteRange {
        #[serde(default)]
        values: Grid,
    },
    /// Append rows after the last non-blank row of the target range.
    AppendRows {
        #[serde(default)]
        rows: Grid,
    },
    /// Blank every cell of the target range.
    ClearRange,
    /// Apply cell formatting without touching values.
    FormatRange { format: CellFormat },
    /// Create a chart sourced from the target range.
    CreateChart {
        chart_type: ChartType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// Delete the target sheet.
    DeleteSheet,
}

impl OperationKind {
    /// Stable snake_case name, matching the serde tag.
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::ReadRange => "read_range",
            OperationKind::WriteRange { .. } => "write_range",
            OperationKind::AppendRows { .. } => "append_rows",
            OperationKind::ClearRange => "clear_range",
            OperationKind::FormatRange { .. } => "format_range",
            OperationKind::CreateChart { .. } => "create_chart",
            OperationKind::DeleteSheet => "delete_sheet",
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, OperationKind::ReadRange)
    }

    pub fn is_mutating(&self) -> bool {
        !self.is_read_only()
    }

    /// Removes or reshapes sheet structure rather than cell content.
    pub fn is_structural(&self) -> bool {
        matches!(self, OperationKind::DeleteSheet)
    }

    /// Changes cell values (as opposed to formatting or charts).
    pub fn changes_values(&self) -> bool {
        matches!(
            self,
            OperationKind::WriteRange { .. }
                | OperationKind::AppendRows { .. }
                | OperationKind::ClearRange
                | OperationKind::DeleteSheet
        )
    }

    /// Whether a parameter marker may target `field` on this kind.
    pub fn accepts(&self, field: ParamField) -> bool {
        match field {
            ParamField::Range => true,
            ParamField::Values => matches!(self, OperationKind::WriteRange { .. }),
            ParamField::Rows => matches!(self, OperationKind::AppendRows { .. }),
            ParamField::Title => matches!(self, OperationKind::CreateChart { .. }),
        }
    }
}

/// Formatting applied by `format_range`. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bold: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub italic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    Bar,
    Line,
    Pie,
    Scatter,
    Area,
}

// ---------------------------------------------------------------------------
// Parameter markers
// ---------------------------------------------------------------------------

/// A payload field that can be filled in at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamField {
    /// `write_range.values` (a grid).
    Values,
    /// `append_rows.rows` (a grid).
    Rows,
    /// The target range, as an A1 string on the same resource.
    Range,
    /// `create_chart.title` (a string).
    Title,
}

impl std::fmt::Display for ParamField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParamField::Values => "values",
            ParamField::Rows => "rows",
            ParamField::Range => "range",
            ParamField::Title => "title",
        };
        f.write_str(name)
    }
}

/// Unresolved-parameter marker.
///
/// `key` is looked up in the shared context first, then in the named outputs
/// of completed dependencies (`dep_id.name` pins one dependency, a bare name
/// searches them in declared order), then `default` applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamBinding {
    pub field: ParamField,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

// ---------------------------------------------------------------------------
// OperationOutput
// ---------------------------------------------------------------------------

/// Typed success payload returned by the executor.
///
/// Top-level object fields are the operation's named outputs, available to
/// dependents during parameter inference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationOutput {
    pub payload: Value,
}

impl OperationOutput {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    pub fn named(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
