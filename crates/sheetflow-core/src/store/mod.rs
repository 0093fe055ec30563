//! Snapshot store port.
//!
//! Atomic range reads and write-backs used for snapshots, restoration and
//! version materialization, plus the workbook's artifact catalog for impact
//! analysis.

pub mod box_store;

pub use box_store::BoxSnapshotStore;

use sheetflow_types::error::StoreError;
use sheetflow_types::impact::DependentArtifact;
use sheetflow_types::range::{Grid, RangeKey};

/// Range-level access to the remote spreadsheet.
pub trait SnapshotStore: Send + Sync {
    /// Read the current content of a range.
    ///
    /// Grids are clipped to the sheet's used area; cells past the end of a
    /// row or past the last row read as blank.
    fn read_range(
        &self,
        key: &RangeKey,
    ) -> impl std::future::Future<Output = Result<Grid, StoreError>> + Send;

    /// Replace the content of a range in one call.
    ///
    /// Cells of the range not covered by `values` become blank. Creates the
    /// sheet if it no longer exists.
    fn write_range(
        &self,
        key: &RangeKey,
        values: &Grid,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Formulas, charts, named and protected ranges that read from or guard
    /// cells of a resource. Stores without metadata report none.
    fn dependent_artifacts(
        &self,
        _resource_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<DependentArtifact>, StoreError>> + Send {
        async { Ok(Vec::new()) }
    }
}
