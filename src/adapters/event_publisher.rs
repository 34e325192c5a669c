//! Event Publisher Adapters
//!
//! Sinks for reconcile events: the log, an in-memory buffer for tests, and a
//! fan-out over several sinks.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn, Level};

use crate::domain::events::ReconcileEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Writes events to the tracing subscriber as structured fields.
#[derive(Debug, Clone)]
pub struct LoggingEventPublisher {
    level: Level,
}

impl LoggingEventPublisher {
    /// Publisher logging at info level.
    pub fn new() -> Self {
        Self { level: Level::INFO }
    }

    /// Publisher logging at `level`. Anything below info logs at debug.
    pub fn with_level(level: Level) -> Self {
        Self { level }
    }
}

impl Default for LoggingEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: ReconcileEvent) -> Result<()> {
        let event_type = event.event_type();
        let namespace = event.namespace();
        let subject = event.subject();

        if self.level <= Level::INFO {
            info!(event_type, namespace, subject, details = ?event, "Reconcile event");
        } else {
            debug!(event_type, namespace, subject, details = ?event, "Reconcile event");
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<ReconcileEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Buffers events for inspection in tests.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: RwLock<Vec<ReconcileEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReconcileEvent> {
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

    /// Events whose type name is `event_type`, e.g. `"PeeringBound"`.
    pub fn events_of_type(&self, event_type: &str) -> Vec<ReconcileEvent> {
        self.filtered(|e| e.event_type() == event_type)
    }

    /// Events about the object `name` in `namespace`.
    pub fn events_for(&self, namespace: &str, name: &str) -> Vec<ReconcileEvent> {
        self.filtered(|e| e.namespace() == namespace && e.subject() == name)
    }

    fn filtered(&self, keep: impl Fn(&ReconcileEvent) -> bool) -> Vec<ReconcileEvent> {
        self.events.read().iter().filter(|e| keep(e)).cloned().collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: ReconcileEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<ReconcileEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

/// Fans every event out to all inner publishers.
///
/// A failing publisher does not stop delivery to the others; the first
/// error is returned once all have been tried.
#[derive(Default)]
pub struct CompositeEventPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("publishers", &self.publishers.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: ReconcileEvent) -> Result<()> {
        self.publish_all(vec![event]).await
    }

    async fn publish_all(&self, events: Vec<ReconcileEvent>) -> Result<()> {
        let mut first_error = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish_all(events.clone()).await {
                warn!(error = %e, "Event publisher failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;

    struct Failing;

    #[async_trait]
    impl EventPublisher for Failing {
        async fn publish(&self, _event: ReconcileEvent) -> Result<()> {
            Err(Error::Transient("sink unavailable".into()))
        }

        async fn publish_all(&self, _events: Vec<ReconcileEvent>) -> Result<()> {
            Err(Error::Transient("sink unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_logging_publisher_accepts_events() {
        let publisher = LoggingEventPublisher::with_level(Level::DEBUG);
        publisher
            .publish(ReconcileEvent::child_created("Prefix", "ns", "nic-0", "nic"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collector_filters() {
        let collector = InMemoryEventCollector::new();
        collector
            .publish_all(vec![
                ReconcileEvent::child_created("Prefix", "ns", "nic-0", "nic"),
                ReconcileEvent::child_deleted("Prefix", "ns", "nic-1", "nic"),
                ReconcileEvent::child_created("VirtualIp", "other", "nic", "nic"),
            ])
            .await
            .unwrap();

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.events_of_type("ChildCreated").len(), 2);
        assert_eq!(collector.events_for("ns", "nic-1").len(), 1);
        assert!(collector.events_for("ns", "nic").is_empty());

        collector.clear();
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_composite_delivers_past_failures() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let composite = CompositeEventPublisher::new()
            .with_publisher(Arc::new(Failing))
            .with_publisher(collector.clone());

        let err = composite
            .publish(ReconcileEvent::peering_bound("ns", "a", "to-b", "ns/b"))
            .await
            .unwrap_err();

        assert_matches!(err, Error::Transient(_));
        assert_eq!(collector.events_of_type("PeeringBound").len(), 1);
    }
}
