//! Broadcast event bus for run progress.
//!
//! Publishing never blocks the executor: with no subscribers the event is
//! dropped, and a slow subscriber lags instead of applying backpressure.

use gantry_types::event::EngineEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for `EngineEvent`s. Clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(run_id = %event.run_id(), ?event, "engine event");
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
