//! Infrastructure layer for sheetflow.
//!
//! Concrete adapters for the ports defined in `sheetflow-core`: an in-memory
//! workbook implementing both the operation executor and the snapshot store,
//! a statistics sink that writes engine events to `tracing`, and the TOML
//! configuration loader.

pub mod config;
pub mod tracing_sink;
pub mod workbook;

pub use config::{ConfigError, default_config_path, load_engine_config, load_engine_config_strict};
pub use tracing_sink::TracingSink;
pub use workbook::{InMemoryWorkbook, WorkbookData, WorkbookError};
