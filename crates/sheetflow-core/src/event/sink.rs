//! Statistics sink port.
//!
//! Components emit structured `EngineEvent`s through a `StatsSink`. The
//! engine always feeds its `EventBus`; extra sinks (e.g. the tracing sink in
//! `sheetflow-infra`) are attached with `FanoutSink`.

use std::sync::Arc;

use sheetflow_types::event::EngineEvent;

/// Receives engine events. Must not block.
pub trait StatsSink: Send + Sync {
    fn record(&self, event: EngineEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl StatsSink for NoopSink {
    fn record(&self, _event: EngineEvent) {}
}

/// Forwards each event to every inner sink, in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn StatsSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn StatsSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn StatsSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl StatsSink for FanoutSink {
    fn record(&self, event: EngineEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

impl std::fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
