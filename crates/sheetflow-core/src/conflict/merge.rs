//! Cell diffing and three-way merge.
//!
//! Grids are compared position by position with ragged rows padded by
//! blanks; `null` and `""` are the same blank cell.

use serde_json::Value;
use sheetflow_types::range::{Grid, grid_cell, grid_dimensions, is_blank};

/// Blank-aware cell equality.
pub fn cells_equal(a: &Value, b: &Value) -> bool {
    (is_blank(a) && is_blank(b)) || a == b
}

/// Relative `(row, col)` positions whose value differs between two grids.
pub fn changed_cells(before: &Grid, after: &Grid) -> Vec<(usize, usize)> {
    let (r1, c1) = grid_dimensions(before);
    let (r2, c2) = grid_dimensions(after);
    let (rows, cols) = (r1.max(r2), c1.max(c2));

    let mut changed = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            if !cells_equal(grid_cell(before, row, col), grid_cell(after, row, col)) {
                changed.push((row, col));
            }
        }
    }
    changed
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Grid to write in place of ours.
    Merged(Grid),
    /// Both sides changed these cells to different non-blank values.
    Conflicted(Vec<(usize, usize)>),
}

/// Cell-level three-way merge of `ours` against `base` and `theirs`.
///
/// The merged grid has the shape of `ours`, since that is what gets written.
/// Per cell: an unchanged side yields to the changed one; equal changes
/// agree; a blank loses to a non-blank value; two different non-blank values
/// conflict.
pub fn three_way_merge(base: &Grid, theirs: &Grid, ours: &Grid) -> MergeOutcome {
    let mut merged = Vec::with_capacity(ours.len());
    let mut conflicted = Vec::new();

    for (row, our_row) in ours.iter().enumerate() {
        let mut merged_row = Vec::with_capacity(our_row.len());
        for (col, o) in our_row.iter().enumerate() {
            let b = grid_cell(base, row, col);
            let t = grid_cell(theirs, row, col);

            let value = if cells_equal(o, b) {
                t
            } else if cells_equal(t, b) || cells_equal(t, o) || is_blank(t) {
                o
            } else if is_blank(o) {
                t
            } else {
                conflicted.push((row, col));
                o
            };
            merged_row.push(value.clone());
        }
        merged.push(merged_row);
    }

    if conflicted.is_empty() {
        MergeOutcome::Merged(merged)
    } else {
        MergeOutcome::Conflicted(conflicted)
    }
}
