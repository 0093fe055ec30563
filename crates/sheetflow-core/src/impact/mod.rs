//! Impact analysis: read-only risk assessment of proposed operations.
//!
//! - `cost` -- calibrated duration model keyed on scope size and kind
//! - `analyzer` -- `ImpactAnalyzer`: dimensions, dependents, severity, advice

pub mod analyzer;
pub mod cost;

pub use analyzer::{ImpactAnalyzer, classify_severity};
pub use cost::CostModel;
