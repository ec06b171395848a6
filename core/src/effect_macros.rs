//! Declarative macros for ergonomic effect construction

/// Create an `Effect::PublishEvent` operation
///
/// # Example
///
/// ```rust,ignore
/// use studyhub_core::publish_event;
///
/// publish_event! {
///     bus: env.event_bus,
///     topic: "enrollment-events",
///     event: serialized_event,
///     on_success: || None,
///     on_error: |error| Some(AdmissionAction::PublicationFailed { error: error.to_string() })
/// }
/// ```
#[macro_export]
macro_rules! publish_event {
    (
        bus: $bus:expr,
        topic: $topic:expr,
        event: $event:expr,
        on_success: || $success_body:expr,
        on_error: |$error_param:ident| $error_body:expr
    ) => {
        $crate::effect::Effect::PublishEvent(
            $crate::effect::EventBusOperation::Publish {
                event_bus: ::std::sync::Arc::clone(&$bus),
                topic: $topic.to_string(),
                event: $event,
                on_success: ::std::boxed::Box::new(move |()| $success_body),
                on_error: ::std::boxed::Box::new(move |$error_param| $error_body),
            }
        )
    };
}

#[cfg(test)]
mod tests {
    use crate::effect::Effect;
    use crate::event::SerializedEvent;
    use crate::event_bus::{EventBus, EventBusError, EventStream};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;

    #[derive(Debug)]
    enum TestAction {
        Failed { error: String },
    }

    struct NullBus;

    impl EventBus for NullBus {
        fn publish(
            &self,
            _topic: &str,
            _event: &SerializedEvent,
        ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn subscribe(
            &self,
            topics: &[&str],
        ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
            let topics = topics.iter().map(ToString::to_string).collect();
            Box::pin(async move {
                Err(EventBusError::SubscriptionFailed {
                    topics,
                    reason: "null bus".to_string(),
                })
            })
        }
    }

    #[test]
    fn test_publish_event_macro() {
        let bus: Arc<dyn EventBus> = Arc::new(NullBus);
        let event = SerializedEvent::new("EnrollmentCreated.v1".to_string(), vec![1], None);

        let effect: Effect<TestAction> = publish_event! {
            bus: bus,
            topic: "enrollment-events",
            event: event,
            on_success: || None,
            on_error: |error| Some(TestAction::Failed { error: error.to_string() })
        };

        assert!(matches!(effect, Effect::PublishEvent(_)));
        assert_eq!(effect.published_event_types(), vec!["EnrollmentCreated.v1"]);
    }
}
