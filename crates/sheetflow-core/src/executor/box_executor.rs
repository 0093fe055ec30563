//! BoxOperationExecutor -- object-safe dynamic dispatch wrapper for OperationExecutor.
//!
//! 1. Define an object-safe `OperationExecutorDyn` trait with boxed futures
//! 2. Blanket-impl `OperationExecutorDyn` for all `T: OperationExecutor`
//! 3. `BoxOperationExecutor` wraps `Box<dyn OperationExecutorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use sheetflow_types::error::{BatchError, OperationError};
use sheetflow_types::operation::{Operation, OperationOutput};

use super::OperationExecutor;

/// Object-safe version of [`OperationExecutor`] with boxed futures.
pub trait OperationExecutorDyn: Send + Sync {
    fn name(&self) -> &str;

    fn supports_batching(&self) -> bool;

    fn execute_boxed<'a>(
        &'a self,
        operation: &'a Operation,
    ) -> Pin<Box<dyn Future<Output = Result<OperationOutput, OperationError>> + Send + 'a>>;

    fn execute_batch_boxed<'a>(
        &'a self,
        operations: &'a [Operation],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OperationOutput>, BatchError>> + Send + 'a>>;
}

impl<T: OperationExecutor> OperationExecutorDyn for T {
    fn name(&self) -> &str {
        OperationExecutor::name(self)
    }

    fn supports_batching(&self) -> bool {
        OperationExecutor::supports_batching(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        operation: &'a Operation,
    ) -> Pin<Box<dyn Future<Output = Result<OperationOutput, OperationError>> + Send + 'a>> {
        Box::pin(self.execute(operation))
    }

    fn execute_batch_boxed<'a>(
        &'a self,
        operations: &'a [Operation],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OperationOutput>, BatchError>> + Send + 'a>> {
        Box::pin(self.execute_batch(operations))
    }
}

/// Type-erased executor injected into the engine at construction.
///
/// `OperationExecutor` uses RPITIT and cannot be a trait object directly, so
/// the engine holds this wrapper instead of a generic parameter.
pub struct BoxOperationExecutor {
    inner: Box<dyn OperationExecutorDyn + Send + Sync>,
}

impl BoxOperationExecutor {
    pub fn new<T: OperationExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn supports_batching(&self) -> bool {
        self.inner.supports_batching()
    }

    pub async fn execute(&self, operation: &Operation) -> Result<OperationOutput, OperationError> {
        self.inner.execute_boxed(operation).await
    }

    pub async fn execute_batch(
        &self,
        operations: &[Operation],
    ) -> Result<Vec<OperationOutput>, BatchError> {
        self.inner.execute_batch_boxed(operations).await
    }
}

impl std::fmt::Debug for BoxOperationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxOperationExecutor")
            .field("name", &self.inner.name())
            .field("supports_batching", &self.inner.supports_batching())
            .finish()
    }
}
