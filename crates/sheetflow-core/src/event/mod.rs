//! Engine event distribution.
//!
//! Provides an `EventBus` that distributes `EngineEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel, and the `StatsSink`
//! port the components publish through.

pub mod bus;
pub mod sink;

pub use bus::EventBus;
pub use sink::{FanoutSink, NoopSink, StatsSink};
