//! Shared domain types for sheetflow.
//!
//! Ranges and scopes, operation descriptors, workflows, transactions,
//! conflicts, impact reports, engine events, configuration, and the error
//! types exchanged with executor and snapshot-store adapters.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod conflict;
pub mod error;
pub mod event;
pub mod impact;
pub mod operation;
pub mod range;
pub mod transaction;
pub mod workflow;
