//! Broadcaster Adapters
//!
//! Implements the `Broadcaster` port with various sinks.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::domain::events::GardenEvent;
use crate::domain::ports::Broadcaster;

/// Default capacity of the live-update channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Logging-based broadcaster.
///
/// Writes garden events to the tracing system. Used when no live clients
/// are attached.
#[derive(Debug, Clone, Default)]
pub struct LoggingBroadcaster {
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

#[async_trait]
impl Broadcaster for LoggingBroadcaster {
    async fn broadcast(&self, event: GardenEvent) {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if self.info_level {
            info!(event_type = %event_type, event = %json, "Garden event");
        } else {
            debug!(event_type = %event_type, event = %json, "Garden event");
        }
    }
}

/// Fans events out to every subscriber of a tokio broadcast channel.
///
/// Slow subscribers lag and lose the oldest events; having no subscribers
/// at all is not an error.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<GardenEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GardenEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    async fn broadcast(&self, event: GardenEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => trace!(event_type, receivers, "Event broadcast"),
            Err(_) => trace!(event_type, "No subscribers for event"),
        }
    }
}

/// In-memory event collector for testing.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<GardenEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GardenEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events of a specific type, in broadcast order
    pub fn events_of_type(&self, event_type: &str) -> Vec<GardenEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Broadcaster for InMemoryEventCollector {
    async fn broadcast(&self, event: GardenEvent) {
        self.events.write().push(event);
    }
}

/// Sends every event to each inner broadcaster in turn.
#[derive(Default)]
pub struct CompositeBroadcaster {
    sinks: Vec<Box<dyn Broadcaster>>,
}

impl CompositeBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink<B: Broadcaster + 'static>(mut self, sink: B) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl std::fmt::Debug for CompositeBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeBroadcaster")
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl Broadcaster for CompositeBroadcaster {
    async fn broadcast(&self, event: GardenEvent) {
        for sink in &self.sinks {
            sink.broadcast(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_logging_broadcaster() {
        let broadcaster = LoggingBroadcaster::info_level();

        // Should not panic
        broadcaster
            .broadcast(GardenEvent::signal_updated("weather", "signal:weather:current"))
            .await;
    }

    #[tokio::test]
    async fn test_in_memory_collector() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        collector
            .broadcast(GardenEvent::signal_updated("weather", "signal:weather:current"))
            .await;
        collector
            .broadcast(GardenEvent::signal_failed("music", "timeout"))
            .await;

        assert_eq!(collector.len(), 2);
        assert_eq!(collector.events_of_type("SignalFailed").len(), 1);

        collector.clear();
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_channel_broadcaster_delivers_to_subscribers() {
        let broadcaster = ChannelBroadcaster::new(8);

        // No subscribers yet; the event is dropped quietly.
        broadcaster
            .broadcast(GardenEvent::signal_failed("music", "timeout"))
            .await;

        let mut rx = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster
            .broadcast(GardenEvent::signal_updated("weather", "signal:weather:current"))
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "SignalUpdated");
    }

    #[tokio::test]
    async fn test_composite_broadcaster() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let composite = CompositeBroadcaster::new()
            .with_sink(LoggingBroadcaster::debug_level())
            .with_sink(Arc::clone(&collector));

        composite
            .broadcast(GardenEvent::signal_updated("github", "signal:github:current"))
            .await;

        assert_eq!(collector.len(), 1);
    }
}
