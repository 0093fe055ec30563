//! Span names shared by sheetflow binaries.
//!
//! Naming convention: `"{binary}.{command}"`, so exported traces group by
//! entry point.

/// Running a workflow plan end to end.
pub const SPAN_RUN: &str = "sflow.run";

/// Impact analysis of a plan without dispatching anything.
pub const SPAN_ANALYZE: &str = "sflow.analyze";

/// Building and validating a plan's dependency levels.
pub const SPAN_VALIDATE: &str = "sflow.validate";

/// Every span name, for exporters that filter on them.
pub const ALL_SPANS: [&str; 3] = [SPAN_RUN, SPAN_ANALYZE, SPAN_VALIDATE];
