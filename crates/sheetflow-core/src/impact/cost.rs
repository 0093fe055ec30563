//! Duration cost model for remote spreadsheet operations.
//!
//! Estimates are a fixed latency per remote dispatch plus a per-cell cost,
//! scaled by how expensive the operation kind is for the service:
//! - read: 0.5x
//! - write, append, clear: 1x
//! - format: 1.5x
//! - chart: 2x
//! - sheet deletion: 3x

use std::time::Duration;

use sheetflow_types::operation::OperationKind;

/// Calibrated cost parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CostModel {
    /// Round-trip latency of one remote call.
    pub dispatch_latency_ms: f64,
    pub per_cell_ms: f64,
    /// Cells the service accepts per call before a payload must be split.
    pub cells_per_dispatch: u64,
}

impl CostModel {
    pub fn new() -> Self {
        Self {
            dispatch_latency_ms: 150.0,
            per_cell_ms: 0.05,
            cells_per_dispatch: 50_000,
        }
    }

    pub fn multiplier(kind: &OperationKind) -> f64 {
        match kind {
            OperationKind::ReadRange => 0.5,
            OperationKind::WriteRange { .. }
            | OperationKind::AppendRows { .. }
            | OperationKind::ClearRange => 1.0,
            OperationKind::FormatRange { .. } => 1.5,
            OperationKind::CreateChart { .. } => 2.0,
            OperationKind::DeleteSheet => 3.0,
        }
    }

    /// Remote calls needed to move `cells` cells.
    pub fn dispatches(&self, cells: u64) -> u64 {
        cells.div_ceil(self.cells_per_dispatch.max(1)).max(1)
    }

    pub fn estimate_ms(&self, kind: &OperationKind, cells: u64) -> u64 {
        let latency = self.dispatches(cells) as f64 * self.dispatch_latency_ms;
        let work = cells as f64 * self.per_cell_ms * Self::multiplier(kind);
        (latency + work).round() as u64
    }

    pub fn estimate(&self, kind: &OperationKind, cells: u64) -> Duration {
        Duration::from_millis(self.estimate_ms(kind, cells))
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetflow_types::operation::ChartType;

    #[test]
    fn test_single_dispatch_estimate() {
        let model = CostModel::new();
        // 150 ms latency + 1000 cells * 0.05 ms
        assert_eq!(model.estimate_ms(&OperationKind::ClearRange, 1_000), 200);
        assert_eq!(model.estimate_ms(&OperationKind::ReadRange, 1_000), 175);
        assert_eq!(model.estimate_ms(&OperationKind::DeleteSheet, 1_000), 300);
    }

    #[test]
    fn test_large_scope_needs_several_dispatches() {
        let model = CostModel::new();
        assert_eq!(model.dispatches(0), 1);
        assert_eq!(model.dispatches(49_999), 1);
        assert_eq!(model.dispatches(50_000), 1);
        assert_eq!(model.dispatches(50_001), 2);
        assert_eq!(model.dispatches(120_000), 3);
        assert_eq!(
            model.estimate_ms(&OperationKind::ClearRange, 120_000),
            3 * 150 + 6_000
        );
    }

    #[test]
    fn test_costlier_kinds_estimate_higher() {
        let model = CostModel::new();
        let read = model.estimate(&OperationKind::ReadRange, 10_000);
        let chart = model.estimate(
            &OperationKind::CreateChart {
                chart_type: ChartType::Bar,
                title: None,
            },
            10_000,
        );
        assert!(chart > read);
    }
}
