//! # Study Hub Testing
//!
//! Test doubles and harnesses for admission reducers and stores.
//!
//! This crate provides:
//! - Clocks with fixed or manually advanced time
//! - An event bus that records every publication and can be told to fail
//! - [`ReducerTest`], a Given-When-Then harness for reducers
//!
//! ## Example
//!
//! ```ignore
//! use studyhub_testing::{RecordingEventBus, test_clock};
//!
//! #[tokio::test]
//! async fn promotion_is_announced() {
//!     let bus = Arc::new(RecordingEventBus::new());
//!     let service = AdmissionService::new(config, Arc::new(test_clock()), bus.clone());
//!     // ...
//!     assert_eq!(bus.event_types(), vec!["EnrollmentPromoted.v1"]);
//! }
//! ```

use chrono::{DateTime, Utc};
use studyhub_core::environment::Clock;


/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Mutex, PoisonError};
    use studyhub_core::event::SerializedEvent;
    use studyhub_core::event_bus::{EventBus, EventBusError, EventStream};
    use tokio::sync::broadcast;

    /// Fixed clock for deterministic tests
    ///
    /// # Example
    ///
    /// ```
    /// use studyhub_testing::mocks::FixedClock;
    /// use studyhub_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded timestamp fails to parse, which never happens.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Clock whose time only moves when a test says so
    ///
    /// Used to cross enrollment deadlines and event starts deliberately.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward (or backward, for a negative duration)
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    #[derive(Debug, Default)]
    struct Recording {
        published: Vec<(String, SerializedEvent)>,
        failures_remaining: usize,
        fail_always: bool,
    }

    /// Event bus that records every successful publication
    ///
    /// Subscribers receive live events published after they subscribed.
    /// Failures can be injected to exercise retry and failure feedback.
    #[derive(Debug)]
    pub struct RecordingEventBus {
        recording: Mutex<Recording>,
        live: broadcast::Sender<(String, SerializedEvent)>,
    }

    impl Default for RecordingEventBus {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RecordingEventBus {
        /// Create an empty recording bus
        #[must_use]
        pub fn new() -> Self {
            Self {
                recording: Mutex::new(Recording::default()),
                live: broadcast::channel(1024).0,
            }
        }

        /// Fail the next `count` publish attempts
        pub fn fail_next(&self, count: usize) {
            self.lock().failures_remaining = count;
        }

        /// Fail every publish attempt until [`Self::recover`]
        pub fn fail_always(&self) {
            self.lock().fail_always = true;
        }

        /// Stop injecting failures
        pub fn recover(&self) {
            let mut recording = self.lock();
            recording.fail_always = false;
            recording.failures_remaining = 0;
        }

        /// All successfully published events, in publish order
        #[must_use]
        pub fn published(&self) -> Vec<SerializedEvent> {
            self.lock().published.iter().map(|(_, e)| e.clone()).collect()
        }

        /// Event types of all successfully published events, in publish order
        #[must_use]
        pub fn event_types(&self) -> Vec<String> {
            self.lock()
                .published
                .iter()
                .map(|(_, e)| e.event_type.clone())
                .collect()
        }

        /// Events published to `topic`, in publish order
        #[must_use]
        pub fn published_to(&self, topic: &str) -> Vec<SerializedEvent> {
            self.lock()
                .published
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, e)| e.clone())
                .collect()
        }

        /// Forget all recorded events
        pub fn clear(&self) {
            self.lock().published.clear();
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Recording> {
            self.recording.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl EventBus for RecordingEventBus {
        fn publish(
            &self,
            topic: &str,
            event: &SerializedEvent,
        ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
            let result = {
                let mut recording = self.lock();
                if recording.fail_always || recording.failures_remaining > 0 {
                    recording.failures_remaining = recording.failures_remaining.saturating_sub(1);
                    Err(EventBusError::PublishFailed {
                        topic: topic.to_string(),
                        reason: "injected failure".to_string(),
                    })
                } else {
                    recording.published.push((topic.to_string(), event.clone()));
                    let _ = self.live.send((topic.to_string(), event.clone()));
                    Ok(())
                }
            };
            Box::pin(async move { result })
        }

        fn subscribe(
            &self,
            topics: &[&str],
        ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
            let topics: Vec<String> = topics.iter().map(ToString::to_string).collect();
            let mut receiver = self.live.subscribe();

            Box::pin(async move {
                let stream: EventStream = Box::pin(async_stream::stream! {
                    loop {
                        match receiver.recv().await {
                            Ok((topic, event)) if topics.contains(&topic) => {
                                yield Ok(event);
                            },
                            Ok(_) => {},
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                yield Err(EventBusError::Lagged(skipped));
                            },
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
                Ok(stream)
            })
        }
    }
}

pub use mocks::{FixedClock, ManualClock, RecordingEventBus, test_clock};
pub use reducer_test::{ReducerTest, assertions};
