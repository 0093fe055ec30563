//! In-process broadcast of engine events.
//!
//! Every component reports through the engine's `EventBus`; callers observe
//! it with `Engine::subscribe`. Slow subscribers lag and skip ahead rather
//! than slowing the engine down.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sheetflow_types::event::EngineEvent;
use tokio::sync::broadcast;

use super::sink::StatsSink;

/// Multi-consumer bus for engine events. Clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    published: Arc<AtomicU64>,
}

impl EventBus {
    /// A bus buffering up to `capacity` events per subscriber (at least one).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Deliver `event` to current subscribers. Returns how many received it;
    /// with none listening the event is dropped.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.sender.send(event).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events published since creation, delivered or not.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl StatsSink for EventBus {
    fn record(&self, event: EngineEvent) {
        self.publish(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.receiver_count())
            .field("published", &self.published())
            .finish()
    }
}
