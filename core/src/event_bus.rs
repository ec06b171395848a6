//! Event bus abstraction between the admission engine and its observers.
//!
//! The engine never calls the notifier directly. Committed domain events are
//! published to a topic on an [`EventBus`]; the notifier (and any other
//! observer) subscribes to that topic and reacts on its own task.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐     ┌──────────┐
//! │   Command   │────▶│   Reducer   │────▶│ 1. Commit    │────▶│ 2. Bus   │
//! └─────────────┘     └─────────────┘     │    state     │     │ publish  │
//!                                         └──────────────┘     └────┬─────┘
//!                                                                   │
//!                                                                   ▼
//!                                                             ┌──────────┐
//!                                                             │ Notifier │
//!                                                             └──────────┘
//! ```
//!
//! # Key Principles
//!
//! - **Commit first**: an event is published only after its mutation is applied
//! - **Ordered per event**: events of one gathering are published in commit order
//! - **Fire and observe**: a slow or failing consumer never blocks the engine

use crate::event::SerializedEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// A subscriber fell behind and missed events
    #[error("Subscriber lagged, {0} events skipped")]
    Lagged(u64),

    /// Topic not found or invalid
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
}

/// Stream of events from a subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SerializedEvent, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// # Dyn Compatibility
///
/// Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so the
/// bus can be shared as `Arc<dyn EventBus>` and captured inside effects.
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of events.
    ///
    /// Only events published after the subscription was created are delivered.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}
