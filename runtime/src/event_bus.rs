//! In-process event bus backed by `tokio::sync::broadcast`.
//!
//! Each topic owns one broadcast channel, created on first use. Publishing
//! with no subscriber is not an error; the event is simply dropped. A
//! subscriber that falls more than `capacity` events behind receives
//! [`EventBusError::Lagged`] and then continues with the oldest retained event.

use crate::metrics::EventBusMetrics;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use studyhub_core::event::SerializedEvent;
use studyhub_core::event_bus::{EventBus, EventBusError, EventStream};
use tokio::sync::broadcast::{self, error::RecvError};

/// Default per-topic buffer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast-channel event bus for a single process.
#[derive(Debug)]
pub struct InMemoryEventBus {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<SerializedEvent>>>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    /// Bus with [`DEFAULT_CAPACITY`] events buffered per topic.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus with `capacity` events buffered per topic (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<SerializedEvent> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

fn topic_stream(
    mut receiver: broadcast::Receiver<SerializedEvent>,
) -> impl futures::Stream<Item = Result<SerializedEvent, EventBusError>> + Send {
    async_stream::stream! {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    EventBusMetrics::record_consume();
                    yield Ok(event);
                },
                Err(RecvError::Lagged(skipped)) => {
                    EventBusMetrics::record_lag(skipped);
                    tracing::warn!(skipped, "Subscriber lagged behind the event bus");
                    yield Err(EventBusError::Lagged(skipped));
                },
                Err(RecvError::Closed) => break,
            }
        }
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let result = if topic.is_empty() {
            EventBusMetrics::record_publish_error();
            Err(EventBusError::InvalidTopic(topic.to_string()))
        } else {
            let start = Instant::now();
            let delivered = self.sender(topic).send(event.clone()).unwrap_or(0);
            EventBusMetrics::record_publish(start.elapsed());
            tracing::trace!(
                topic,
                event_type = %event.event_type,
                subscribers = delivered,
                "Event published"
            );
            Ok(())
        };

        Box::pin(async move { result })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let result = if topics.is_empty() || topics.iter().any(|t| t.is_empty()) {
            Err(EventBusError::SubscriptionFailed {
                topics: topics.iter().map(ToString::to_string).collect(),
                reason: "at least one non-empty topic is required".to_string(),
            })
        } else {
            let streams: Vec<_> = topics
                .iter()
                .map(|topic| topic_stream(self.sender(topic).subscribe()).boxed())
                .collect();
            tracing::debug!(topics = ?topics, "Subscribed to topics");
            let merged: EventStream = Box::pin(stream::select_all(streams));
            Ok(merged)
        };

        Box::pin(async move { result })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn event(event_type: &str) -> SerializedEvent {
        SerializedEvent::new(event_type.to_string(), vec![1, 2, 3], None)
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_publish_order() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["enrollments"]).await.unwrap();

        bus.publish("enrollments", &event("EnrollmentCreated.v1")).await.unwrap();
        bus.publish("enrollments", &event("EnrollmentPromoted.v1")).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.event_type, "EnrollmentCreated.v1");
        assert_eq!(second.event_type, "EnrollmentPromoted.v1");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_ok() {
        let bus = InMemoryEventBus::new();
        assert!(bus.publish("nobody-listens", &event("X.v1")).await.is_ok());
        assert_eq!(bus.subscriber_count("nobody-listens"), 0);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["a"]).await.unwrap();

        bus.publish("b", &event("Other.v1")).await.unwrap();
        bus.publish("a", &event("Mine.v1")).await.unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.event_type, "Mine.v1");
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let bus = InMemoryEventBus::with_capacity(2);
        let mut stream = bus.subscribe(&["t"]).await.unwrap();

        for i in 0..5 {
            bus.publish("t", &event(&format!("E{i}.v1"))).await.unwrap();
        }

        let first = stream.next().await.unwrap();
        assert_eq!(first, Err(EventBusError::Lagged(3)));
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.event_type, "E3.v1");
    }

    #[tokio::test]
    async fn empty_topic_is_rejected() {
        let bus = InMemoryEventBus::new();
        assert!(matches!(
            bus.publish("", &event("X.v1")).await,
            Err(EventBusError::InvalidTopic(_))
        ));
        assert!(bus.subscribe(&[]).await.is_err());
    }
}
