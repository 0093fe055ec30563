//! Coordination core for sheetflow.
//!
//! This crate defines the ports (executor, snapshot store, statistics sink)
//! that the infrastructure layer implements, and the four components built on
//! them: the workflow orchestrator, the transaction manager, the conflict
//! detector and the impact analyzer. `Engine` wires them together behind
//! opaque handles. It depends only on `sheetflow-types`.

pub mod cache;
pub mod conflict;
pub mod engine;
pub mod event;
pub mod executor;
pub mod impact;
pub mod store;
pub mod transaction;
pub mod workflow;

pub use engine::{Engine, EngineError};
