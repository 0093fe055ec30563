//! BoxSnapshotStore -- object-safe dynamic dispatch wrapper for SnapshotStore.

use std::future::Future;
use std::pin::Pin;

use sheetflow_types::error::StoreError;
use sheetflow_types::impact::DependentArtifact;
use sheetflow_types::range::{Grid, RangeKey};

use super::SnapshotStore;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`SnapshotStore`] with boxed futures.
pub trait SnapshotStoreDyn: Send + Sync {
    fn read_range_boxed<'a>(&'a self, key: &'a RangeKey) -> BoxFuture<'a, Result<Grid, StoreError>>;

    fn write_range_boxed<'a>(
        &'a self,
        key: &'a RangeKey,
        values: &'a Grid,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn dependent_artifacts_boxed<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<DependentArtifact>, StoreError>>;
}

impl<T: SnapshotStore> SnapshotStoreDyn for T {
    fn read_range_boxed<'a>(&'a self, key: &'a RangeKey) -> BoxFuture<'a, Result<Grid, StoreError>> {
        Box::pin(self.read_range(key))
    }

    fn write_range_boxed<'a>(
        &'a self,
        key: &'a RangeKey,
        values: &'a Grid,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.write_range(key, values))
    }

    fn dependent_artifacts_boxed<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<DependentArtifact>, StoreError>> {
        Box::pin(self.dependent_artifacts(resource_id))
    }
}

/// Type-erased snapshot store shared by the detector, the transaction
/// manager and the impact analyzer.
pub struct BoxSnapshotStore {
    inner: Box<dyn SnapshotStoreDyn + Send + Sync>,
}

impl BoxSnapshotStore {
    pub fn new<T: SnapshotStore + 'static>(store: T) -> Self {
        Self {
            inner: Box::new(store),
        }
    }

    pub async fn read_range(&self, key: &RangeKey) -> Result<Grid, StoreError> {
        self.inner.read_range_boxed(key).await
    }

    pub async fn write_range(&self, key: &RangeKey, values: &Grid) -> Result<(), StoreError> {
        self.inner.write_range_boxed(key, values).await
    }

    pub async fn dependent_artifacts(
        &self,
        resource_id: &str,
    ) -> Result<Vec<DependentArtifact>, StoreError> {
        self.inner.dependent_artifacts_boxed(resource_id).await
    }
}

impl std::fmt::Debug for BoxSnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxSnapshotStore").finish_non_exhaustive()
    }
}
