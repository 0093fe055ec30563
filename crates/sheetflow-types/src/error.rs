use thiserror::Error;

/// Errors from parsing A1 range notation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("range is empty")]
    Empty,

    #[error("range '{0}' has no sheet name")]
    MissingSheet(String),

    #[error("invalid cell reference '{0}'")]
    InvalidCell(String),

    #[error("cell reference '{0}' is out of bounds")]
    OutOfBounds(String),
}

/// Typed failure returned by an operation executor.
///
/// The tag decides retry eligibility: transient failures (timeouts, rate
/// limits) are retried per policy, permanent ones are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("transient executor error: {0}")]
    Transient(String),

    #[error("permanent executor error: {0}")]
    Permanent(String),
}

impl OperationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, OperationError::Transient(_))
    }
}

/// Failure of a batched dispatch.
///
/// `failed_index` is the position inside the batch of the operation that
/// failed. Operations before it may have been applied remotely.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("batch dispatch failed at operation {failed_index}: {error}")]
pub struct BatchError {
    pub failed_index: usize,
    pub error: OperationError,
}

/// Errors from the snapshot store (range reads and write-backs).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("sheet not found: {0}")]
    SheetNotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    /// The addressed structure no longer exists.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            StoreError::SheetNotFound(_) | StoreError::ResourceNotFound(_)
        )
    }
}
