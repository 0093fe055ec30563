//! Workflow orchestration: graph validation, scheduling, and execution.
//!
//! - `builder` -- payload validation and workflow assembly
//! - `dag` -- dependency graph, cycle detection, level computation
//! - `context` -- execution context and parameter inference
//! - `retry` -- retry policy with exponential backoff
//! - `orchestrator` -- level-by-level concurrent execution with compensation

pub mod builder;
pub mod context;
pub mod dag;
pub mod orchestrator;
pub mod retry;

pub use builder::{WorkflowError, build_workflow, validate_operation};
pub use context::ExecutionContext;
pub use orchestrator::{Orchestrator, WorkflowFailure};
pub use retry::RetryPolicy;
