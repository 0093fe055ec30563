//! In-memory workbook implementing both the executor and the snapshot store.
//!
//! One workbook is one spreadsheet resource: named sheets of row-major cell
//! grids anchored at A1, plus a catalog of dependent artifacts (formulas,
//! charts, protected ranges...). It backs the CLI and the integration tests,
//! so it also supports:
//!
//! - failure injection per operation id, per overlapping range, and for
//!   store reads/writes
//! - dispatch latency, globally or per operation
//! - batching (`execute_batch` as one remote call)
//! - call tracking: start order, peak concurrency, dispatch and write counts
//!
//! Cloning shares state.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sheetflow_core::executor::OperationExecutor;
use sheetflow_core::store::SnapshotStore;
use sheetflow_types::error::{BatchError, OperationError, RangeError, StoreError};
use sheetflow_types::impact::{ArtifactKind, DependentArtifact};
use sheetflow_types::operation::{CellFormat, Operation, OperationKind, OperationOutput};
use sheetflow_types::range::{CellRange, Grid, RangeKey, is_blank};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Serialized form
// ---------------------------------------------------------------------------

/// On-disk workbook: `{"resource_id": ..., "sheets": {...}, "artifacts": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkbookData {
    pub resource_id: String,
    #[serde(default)]
    pub sheets: BTreeMap<String, Grid>,
    #[serde(default)]
    pub artifacts: Vec<DependentArtifact>,
}

#[derive(Debug, Error)]
pub enum WorkbookError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid workbook {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct Sheet {
    rows: Grid,
    formats: Vec<(CellRange, CellFormat)>,
}

struct RangeFailure {
    key: RangeKey,
    error: OperationError,
    remaining: usize,
}

#[derive(Default)]
struct Inner {
    resource_id: String,
    sheets: DashMap<String, Sheet>,
    artifacts: Mutex<Vec<DependentArtifact>>,

    batching: AtomicBool,
    latency: Mutex<Duration>,
    delays: DashMap<String, Duration>,

    failures: DashMap<String, VecDeque<OperationError>>,
    range_failures: Mutex<Vec<RangeFailure>>,
    read_failures: AtomicUsize,
    write_failures: AtomicUsize,

    started: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    dispatches: AtomicUsize,
    store_writes: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrement `counter` if positive; true when it was.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Counts a dispatch as running until dropped.
struct Running<'a> {
    running: &'a AtomicUsize,
}

impl<'a> Running<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.running.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_running.fetch_max(now, Ordering::SeqCst);
        inner.dispatches.fetch_add(1, Ordering::SeqCst);
        Self {
            running: &inner.running,
        }
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// InMemoryWorkbook
// ---------------------------------------------------------------------------

/// A single spreadsheet held in memory.
#[derive(Clone)]
pub struct InMemoryWorkbook {
    inner: Arc<Inner>,
}

impl InMemoryWorkbook {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                resource_id: resource_id.into(),
                ..Inner::default()
            }),
        }
    }

    pub fn from_data(data: WorkbookData) -> Self {
        let workbook = Self::new(data.resource_id);
        for (name, rows) in data.sheets {
            workbook.add_sheet(name, rows);
        }
        *lock(&workbook.inner.artifacts) = data.artifacts;
        workbook
    }

    pub fn to_data(&self) -> WorkbookData {
        WorkbookData {
            resource_id: self.inner.resource_id.clone(),
            sheets: self
                .inner
                .sheets
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().rows.clone()))
                .collect(),
            artifacts: self.artifacts(),
        }
    }

    /// Load a workbook from a JSON file.
    pub async fn load(path: &Path) -> Result<Self, WorkbookError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| WorkbookError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let data: WorkbookData = serde_json::from_str(&content).map_err(|source| WorkbookError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(
            path = %path.display(),
            resource_id = %data.resource_id,
            sheets = data.sheets.len(),
            "workbook loaded"
        );
        Ok(Self::from_data(data))
    }

    /// Write the workbook back as pretty-printed JSON.
    pub async fn save(&self, path: &Path) -> Result<(), WorkbookError> {
        let content = serde_json::to_string_pretty(&self.to_data()).map_err(|source| WorkbookError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        tokio::fs::write(path, content)
            .await
            .map_err(|source| WorkbookError::Write {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn resource_id(&self) -> &str {
        &self.inner.resource_id
    }

    /// A range key on this workbook.
    pub fn key(&self, a1: &str) -> Result<RangeKey, RangeError> {
        RangeKey::parse(self.inner.resource_id.clone(), a1)
    }

    // -- Content -------------------------------------------------------------

    pub fn add_sheet(&self, name: impl Into<String>, rows: Grid) {
        self.inner.sheets.insert(
            name.into(),
            Sheet {
                rows,
                formats: Vec::new(),
            },
        );
    }

    pub fn add_artifact(&self, kind: ArtifactKind, name: impl Into<String>, range: CellRange) {
        lock(&self.inner.artifacts).push(DependentArtifact {
            kind,
            name: name.into(),
            range,
        });
    }

    pub fn sheet_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.sheets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Current content of a range, clipped to the used area.
    pub fn values(&self, key: &RangeKey) -> Option<Grid> {
        self.inner
            .sheets
            .get(key.sheet())
            .map(|sheet| read_grid(&sheet.rows, &key.range))
    }

    pub fn artifacts(&self) -> Vec<DependentArtifact> {
        lock(&self.inner.artifacts).clone()
    }

    /// Formats applied to a sheet, in application order.
    pub fn formats(&self, sheet: &str) -> Vec<(CellRange, CellFormat)> {
        self.inner
            .sheets
            .get(sheet)
            .map(|s| s.formats.clone())
            .unwrap_or_default()
    }

    // -- Behaviour -----------------------------------------------------------

    /// Dispatch `execute_batch` as one remote call.
    pub fn set_batching(&self, enabled: bool) {
        self.inner.batching.store(enabled, Ordering::SeqCst);
    }

    /// Latency added to every dispatch.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = latency;
    }

    /// Latency for one operation id, replacing the global latency.
    pub fn delay_operation(&self, operation_id: impl Into<String>, delay: Duration) {
        self.inner.delays.insert(operation_id.into(), delay);
    }

    /// Fail the next `times` dispatches of `operation_id` with `error`.
    pub fn fail_operation(&self, operation_id: impl Into<String>, error: OperationError, times: usize) {
        self.inner
            .failures
            .entry(operation_id.into())
            .or_default()
            .extend(std::iter::repeat_n(error, times));
    }

    /// Fail the next `times` dispatches whose target overlaps `key`.
    pub fn fail_range(&self, key: RangeKey, error: OperationError, times: usize) {
        lock(&self.inner.range_failures).push(RangeFailure {
            key,
            error,
            remaining: times,
        });
    }

    /// Fail the next `times` snapshot reads with `Unavailable`.
    pub fn fail_store_reads(&self, times: usize) {
        self.inner.read_failures.fetch_add(times, Ordering::SeqCst);
    }

    /// Fail the next `times` snapshot write-backs with `Unavailable`.
    pub fn fail_store_writes(&self, times: usize) {
        self.inner.write_failures.fetch_add(times, Ordering::SeqCst);
    }

    // -- Tracking ------------------------------------------------------------

    /// Operation ids in dispatch start order.
    pub fn started(&self) -> Vec<String> {
        lock(&self.inner.started).clone()
    }

    /// Highest number of dispatches observed in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_running.load(Ordering::SeqCst)
    }

    /// Remote calls made; a batch counts once.
    pub fn dispatches(&self) -> usize {
        self.inner.dispatches.load(Ordering::SeqCst)
    }

    /// Successful snapshot write-backs.
    pub fn store_writes(&self) -> usize {
        self.inner.store_writes.load(Ordering::SeqCst)
    }

    pub fn reset_tracking(&self) {
        lock(&self.inner.started).clear();
        self.inner.max_running.store(0, Ordering::SeqCst);
        self.inner.dispatches.store(0, Ordering::SeqCst);
        self.inner.store_writes.store(0, Ordering::SeqCst);
    }

    // -- Dispatch internals --------------------------------------------------

    fn latency_for(&self, operation_id: &str) -> Duration {
        match self.inner.delays.get(operation_id) {
            Some(delay) => *delay,
            None => *lock(&self.inner.latency),
        }
    }

    fn take_failure(&self, op: &Operation) -> Option<OperationError> {
        if let Some(mut queue) = self.inner.failures.get_mut(&op.id) {
            if let Some(error) = queue.pop_front() {
                return Some(error);
            }
        }
        let mut range_failures = lock(&self.inner.range_failures);
        let failure = range_failures
            .iter_mut()
            .find(|f| f.remaining > 0 && f.key.overlaps(&op.target))?;
        failure.remaining -= 1;
        Some(failure.error.clone())
    }

    fn record_start(&self, op: &Operation) {
        tracing::debug!(
            operation_id = %op.id,
            kind = op.kind.name(),
            range = %op.target,
            "dispatching"
        );
        lock(&self.inner.started).push(op.id.clone());
    }

    fn dispatch(&self, op: &Operation) -> Result<OperationOutput, OperationError> {
        if let Some(error) = self.take_failure(op) {
            tracing::debug!(operation_id = %op.id, error = %error, "injected failure");
            return Err(error);
        }
        self.apply(op)
    }

    fn apply(&self, op: &Operation) -> Result<OperationOutput, OperationError> {
        if op.target.resource_id != self.inner.resource_id {
            return Err(OperationError::Permanent(format!(
                "spreadsheet '{}' not found",
                op.target.resource_id
            )));
        }
        let sheet_name = op.target.sheet();
        let range = &op.target.range;

        if let OperationKind::DeleteSheet = op.kind {
            if self.inner.sheets.remove(sheet_name).is_none() {
                return Err(sheet_missing(sheet_name));
            }
            lock(&self.inner.artifacts).retain(|a| a.range.sheet != sheet_name);
            return Ok(OperationOutput::new(json!({ "deleted_sheet": sheet_name })));
        }

        let mut sheet = self
            .inner
            .sheets
            .get_mut(sheet_name)
            .ok_or_else(|| sheet_missing(sheet_name))?;

        let payload = match &op.kind {
            OperationKind::ReadRange => {
                let values = read_grid(&sheet.rows, range);
                json!({ "range": range.to_string(), "values": values })
            }
            OperationKind::WriteRange { values } => {
                write_anchored(&mut sheet.rows, range.start_row, range.start_col, values);
                let cells: usize = values.iter().map(Vec::len).sum();
                json!({ "updated_range": range.to_string(), "updated_cells": cells })
            }
            OperationKind::AppendRows { rows } => {
                let at = next_free_row(&sheet.rows, range);
                write_anchored(&mut sheet.rows, at, range.start_col, rows);
                let width = rows.iter().map(Vec::len).max().unwrap_or(1).max(1) as u32;
                let height = rows.len().max(1) as u32;
                let updated = CellRange::new(
                    range.sheet.clone(),
                    (at, range.start_col),
                    (at + height - 1, range.start_col + width - 1),
                );
                json!({ "updated_range": updated.to_string(), "appended_rows": rows.len() })
            }
            OperationKind::ClearRange => {
                blank_range(&mut sheet.rows, range);
                json!({ "cleared_range": range.to_string() })
            }
            OperationKind::FormatRange { format } => {
                sheet.formats.push((range.clone(), format.clone()));
                json!({ "formatted_range": range.to_string() })
            }
            OperationKind::CreateChart { chart_type, title } => {
                let mut artifacts = lock(&self.inner.artifacts);
                let charts = artifacts.iter().filter(|a| a.kind == ArtifactKind::Chart).count();
                let name = title.clone().unwrap_or_else(|| format!("Chart {}", charts + 1));
                artifacts.push(DependentArtifact {
                    kind: ArtifactKind::Chart,
                    name: name.clone(),
                    range: range.clone(),
                });
                json!({ "chart": name, "chart_type": chart_type, "source_range": range.to_string() })
            }
            OperationKind::DeleteSheet => Value::Null,
        };
        Ok(OperationOutput::new(payload))
    }
}

impl std::fmt::Debug for InMemoryWorkbook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryWorkbook")
            .field("resource_id", &self.inner.resource_id)
            .field("sheets", &self.inner.sheets.len())
            .finish()
    }
}

fn sheet_missing(sheet: &str) -> OperationError {
    OperationError::Permanent(format!("sheet '{sheet}' not found"))
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

impl OperationExecutor for InMemoryWorkbook {
    fn name(&self) -> &str {
        "in-memory"
    }

    fn supports_batching(&self) -> bool {
        self.inner.batching.load(Ordering::SeqCst)
    }

    async fn execute(&self, operation: &Operation) -> Result<OperationOutput, OperationError> {
        let _running = Running::enter(&self.inner);
        self.record_start(operation);
        let latency = self.latency_for(&operation.id);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.dispatch(operation)
    }

    async fn execute_batch(&self, operations: &[Operation]) -> Result<Vec<OperationOutput>, BatchError> {
        if !self.supports_batching() {
            let mut outputs = Vec::with_capacity(operations.len());
            for (failed_index, operation) in operations.iter().enumerate() {
                let output = self
                    .execute(operation)
                    .await
                    .map_err(|error| BatchError { failed_index, error })?;
                outputs.push(output);
            }
            return Ok(outputs);
        }

        let _running = Running::enter(&self.inner);
        let latency = operations
            .iter()
            .map(|op| self.latency_for(&op.id))
            .max()
            .unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut outputs = Vec::with_capacity(operations.len());
        for (failed_index, operation) in operations.iter().enumerate() {
            self.record_start(operation);
            let output = self
                .dispatch(operation)
                .map_err(|error| BatchError { failed_index, error })?;
            outputs.push(output);
        }
        Ok(outputs)
    }
}

impl SnapshotStore for InMemoryWorkbook {
    async fn read_range(&self, key: &RangeKey) -> Result<Grid, StoreError> {
        if take_one(&self.inner.read_failures) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        if key.resource_id != self.inner.resource_id {
            return Err(StoreError::ResourceNotFound(key.resource_id.clone()));
        }
        self.values(key)
            .ok_or_else(|| StoreError::SheetNotFound(key.sheet().to_string()))
    }

    async fn write_range(&self, key: &RangeKey, values: &Grid) -> Result<(), StoreError> {
        if take_one(&self.inner.write_failures) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        if key.resource_id != self.inner.resource_id {
            return Err(StoreError::ResourceNotFound(key.resource_id.clone()));
        }
        let mut sheet = self.inner.sheets.entry(key.sheet().to_string()).or_default();
        blank_range(&mut sheet.rows, &key.range);
        write_clipped(&mut sheet.rows, &key.range, values);
        self.inner.store_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dependent_artifacts(&self, resource_id: &str) -> Result<Vec<DependentArtifact>, StoreError> {
        if resource_id != self.inner.resource_id {
            return Err(StoreError::ResourceNotFound(resource_id.to_string()));
        }
        Ok(self.artifacts())
    }
}

// ---------------------------------------------------------------------------
// Grid helpers
// ---------------------------------------------------------------------------

fn used_columns(rows: &Grid) -> u32 {
    rows.iter().map(Vec::len).max().unwrap_or(0) as u32
}

fn cell(rows: &Grid, row: u32, col: u32) -> Value {
    rows.get(row as usize)
        .and_then(|r| r.get(col as usize))
        .cloned()
        .unwrap_or(Value::Null)
}

fn set_cell(rows: &mut Grid, row: u32, col: u32, value: Value) {
    let (row, col) = (row as usize, col as usize);
    if rows.len() <= row {
        rows.resize_with(row + 1, Vec::new);
    }
    let cells = &mut rows[row];
    if cells.len() <= col {
        cells.resize(col + 1, Value::Null);
    }
    cells[col] = value;
}

/// The part of `range` inside the used area, blanks filled in.
fn read_grid(rows: &Grid, range: &CellRange) -> Grid {
    let used_rows = rows.len() as u32;
    let used_cols = used_columns(rows);
    if range.start_row >= used_rows || range.start_col >= used_cols {
        return Vec::new();
    }
    let last_row = range.end_row.min(used_rows - 1);
    let last_col = range.end_col.min(used_cols - 1);
    (range.start_row..=last_row)
        .map(|r| (range.start_col..=last_col).map(|c| cell(rows, r, c)).collect())
        .collect()
}

fn write_anchored(rows: &mut Grid, start_row: u32, start_col: u32, values: &Grid) {
    for (dr, row) in values.iter().enumerate() {
        for (dc, value) in row.iter().enumerate() {
            set_cell(rows, start_row + dr as u32, start_col + dc as u32, value.clone());
        }
    }
}

/// Anchored write that drops values falling outside `range`.
fn write_clipped(rows: &mut Grid, range: &CellRange, values: &Grid) {
    for (dr, row) in values.iter().enumerate().take(range.row_count() as usize) {
        for (dc, value) in row.iter().enumerate().take(range.column_count() as usize) {
            set_cell(rows, range.start_row + dr as u32, range.start_col + dc as u32, value.clone());
        }
    }
}

fn blank_range(rows: &mut Grid, range: &CellRange) {
    let last_row = (range.end_row as usize).min(rows.len().saturating_sub(1));
    for r in (range.start_row as usize)..=last_row {
        let Some(cells) = rows.get_mut(r) else {
            break;
        };
        let last_col = (range.end_col as usize).min(cells.len().saturating_sub(1));
        for c in (range.start_col as usize)..=last_col {
            if let Some(value) = cells.get_mut(c) {
                *value = Value::Null;
            }
        }
    }
}

/// First row after the last non-blank row of `range`, or its first row.
fn next_free_row(rows: &Grid, range: &CellRange) -> u32 {
    let used_rows = rows.len() as u32;
    if used_rows == 0 || range.start_row >= used_rows {
        return range.start_row;
    }
    let last = range.end_row.min(used_rows - 1);
    (range.start_row..=last)
        .rev()
        .find(|&r| (range.start_col..=range.end_col.min(used_columns(rows))).any(|c| !is_blank(&cell(rows, r, c))))
        .map_or(range.start_row, |r| r + 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sheetflow_types::operation::ChartType;
    use tempfile::TempDir;

    fn workbook() -> InMemoryWorkbook {
        let wb = InMemoryWorkbook::new("book");
        wb.add_sheet(
            "Data",
            vec![
                vec![json!("name"), json!("qty")],
                vec![json!("apple"), json!(3)],
                vec![json!("pear"), json!(5)],
            ],
        );
        wb
    }

    #[tokio::test]
    async fn read_clips_to_used_area() {
        let wb = workbook();
        let out = wb
            .execute(&Operation::read("r", wb.key("Data!A2:D100").unwrap()))
            .await
            .unwrap();
        assert_eq!(
            out.payload["values"],
            json!([["apple", 3], ["pear", 5]])
        );
        assert_eq!(wb.values(&wb.key("Data!Z1").unwrap()), Some(vec![]));
    }

    #[tokio::test]
    async fn write_and_clear() {
        let wb = workbook();
        wb.execute(&Operation::write("w", wb.key("Data!B2").unwrap(), vec![vec![json!(10)]]))
            .await
            .unwrap();
        assert_eq!(wb.values(&wb.key("Data!B2").unwrap()), Some(vec![vec![json!(10)]]));

        wb.execute(&Operation::new("c", wb.key("Data!A2:B3").unwrap(), OperationKind::ClearRange))
            .await
            .unwrap();
        assert_eq!(
            wb.values(&wb.key("Data!A2:B3").unwrap()),
            Some(vec![vec![Value::Null, Value::Null], vec![Value::Null, Value::Null]])
        );
    }

    #[tokio::test]
    async fn append_lands_after_last_non_blank_row() {
        let wb = workbook();
        let op = Operation::new(
            "a",
            wb.key("Data!A1:B1000").unwrap(),
            OperationKind::AppendRows {
                rows: vec![vec![json!("plum"), json!(7)]],
            },
        );
        let out = wb.execute(&op).await.unwrap();
        assert_eq!(out.payload["updated_range"], json!("Data!A4:B4"));
        assert_eq!(wb.values(&wb.key("Data!A4:B4").unwrap()), Some(vec![vec![json!("plum"), json!(7)]]));
    }

    #[tokio::test]
    async fn missing_sheet_is_permanent() {
        let wb = workbook();
        let err = wb
            .execute(&Operation::read("r", wb.key("Nope!A1").unwrap()))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(
            wb.read_range(&wb.key("Nope!A1").unwrap()).await,
            Err(StoreError::SheetNotFound("Nope".into()))
        );
    }

    #[tokio::test]
    async fn delete_sheet_drops_its_artifacts() {
        let wb = workbook();
        wb.add_artifact(ArtifactKind::Formula, "total", CellRange::parse("Data!B2:B3").unwrap());
        wb.execute(&Operation::new("d", wb.key("Data").unwrap(), OperationKind::DeleteSheet))
            .await
            .unwrap();
        assert!(wb.sheet_names().is_empty());
        assert!(wb.artifacts().is_empty());
    }

    #[tokio::test]
    async fn chart_is_registered_as_artifact() {
        let wb = workbook();
        let op = Operation::new(
            "chart",
            wb.key("Data!A1:B3").unwrap(),
            OperationKind::CreateChart {
                chart_type: ChartType::Bar,
                title: None,
            },
        );
        wb.execute(&op).await.unwrap();
        let artifacts = wb.dependent_artifacts("book").await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "Chart 1");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let wb = workbook();
        wb.fail_operation("r", OperationError::Transient("429".into()), 1);
        wb.fail_range(wb.key("Data!B1:B100").unwrap(), OperationError::Permanent("locked".into()), 1);

        let read = Operation::read("r", wb.key("Data!B2").unwrap());
        assert!(wb.execute(&read).await.unwrap_err().is_transient());
        assert!(!wb.execute(&read).await.unwrap_err().is_transient());
        assert!(wb.execute(&read).await.is_ok());
        assert_eq!(wb.started(), vec!["r", "r", "r"]);
    }

    #[tokio::test]
    async fn batch_is_one_dispatch_and_reports_failed_index() {
        let wb = workbook();
        wb.set_batching(true);
        wb.fail_operation("w2", OperationError::Permanent("bad".into()), 1);
        let ops = vec![
            Operation::write("w1", wb.key("Data!A5").unwrap(), vec![vec![json!(1)]]),
            Operation::write("w2", wb.key("Data!A6").unwrap(), vec![vec![json!(2)]]),
        ];
        let err = wb.execute_batch(&ops).await.unwrap_err();
        assert_eq!(err.failed_index, 1);
        assert_eq!(wb.dispatches(), 1);
        assert_eq!(wb.values(&wb.key("Data!A5").unwrap()), Some(vec![vec![json!(1)]]));
    }

    #[tokio::test]
    async fn store_write_replaces_range_and_creates_sheet() {
        let wb = workbook();
        wb.write_range(&wb.key("Data!A2:B3").unwrap(), &vec![vec![json!("x")]])
            .await
            .unwrap();
        assert_eq!(
            wb.values(&wb.key("Data!A2:B3").unwrap()),
            Some(vec![vec![json!("x"), Value::Null], vec![Value::Null, Value::Null]])
        );

        wb.write_range(&wb.key("Fresh!A1").unwrap(), &vec![vec![json!(1)]])
            .await
            .unwrap();
        assert_eq!(wb.sheet_names(), vec!["Data", "Fresh"]);
        assert_eq!(wb.store_writes(), 2);

        wb.fail_store_writes(1);
        assert!(wb.write_range(&wb.key("Data!A1").unwrap(), &vec![]).await.is_err());
        assert!(wb.write_range(&wb.key("Data!A1").unwrap(), &vec![]).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_dispatches_are_tracked() {
        let wb = workbook();
        wb.set_latency(Duration::from_millis(20));
        let a = Operation::read("a", wb.key("Data!A1").unwrap());
        let b = Operation::read("b", wb.key("Data!B1").unwrap());
        let (ra, rb) = tokio::join!(wb.execute(&a), wb.execute(&b));
        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(wb.max_concurrency(), 2);
        assert_eq!(wb.dispatches(), 2);
    }

    #[tokio::test]
    async fn save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("book.json");
        let wb = workbook();
        wb.add_artifact(ArtifactKind::NamedRange, "fruits", CellRange::parse("Data!A2:A3").unwrap());
        wb.save(&path).await.unwrap();

        let loaded = InMemoryWorkbook::load(&path).await.unwrap();
        assert_eq!(loaded.to_data(), wb.to_data());

        tokio::fs::write(&path, "not json").await.unwrap();
        assert!(matches!(
            InMemoryWorkbook::load(&path).await,
            Err(WorkbookError::Format { .. })
        ));
    }
}
