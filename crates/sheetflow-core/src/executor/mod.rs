//! Operation executor port.
//!
//! The executor maps a resolved `Operation` onto a concrete remote API. The
//! core never branches on which implementation it was given; one executor is
//! injected at engine construction.

pub mod box_executor;

pub use box_executor::BoxOperationExecutor;

use sheetflow_types::error::{BatchError, OperationError};
use sheetflow_types::operation::{Operation, OperationOutput};

/// Dispatches resolved operations to the remote spreadsheet service.
///
/// Uses RPITIT for the async methods. Implementations live in
/// `sheetflow-infra` (e.g. `InMemoryWorkbook`).
pub trait OperationExecutor: Send + Sync {
    /// Human-readable executor name, used in logs.
    fn name(&self) -> &str;

    /// Whether `execute_batch` coalesces operations into one remote call.
    fn supports_batching(&self) -> bool {
        false
    }

    /// Dispatch a single operation.
    fn execute(
        &self,
        operation: &Operation,
    ) -> impl std::future::Future<Output = Result<OperationOutput, OperationError>> + Send;

    /// Dispatch several operations against one resource in a single call.
    ///
    /// Outputs are returned in input order. On failure, operations before
    /// `failed_index` may have been applied.
    ///
    /// The default dispatches sequentially through `execute`.
    fn execute_batch(
        &self,
        operations: &[Operation],
    ) -> impl std::future::Future<Output = Result<Vec<OperationOutput>, BatchError>> + Send {
        async move {
            let mut outputs = Vec::with_capacity(operations.len());
            for (failed_index, operation) in operations.iter().enumerate() {
                let output = self
                    .execute(operation)
                    .await
                    .map_err(|error| BatchError {
                        failed_index,
                        error,
                    })?;
                outputs.push(output);
            }
            Ok(outputs)
        }
    }
}
