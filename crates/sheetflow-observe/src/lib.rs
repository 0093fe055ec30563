//! Observability for sheetflow: subscriber setup and span attribute names.

pub mod attrs;
pub mod tracing_setup;

pub use tracing_setup::{TracingOptions, init_tracing, init_tracing_with, shutdown_tracing};
