//! # Study Hub Core
//!
//! Core traits and types shared by the admission engine and its runtime.
//!
//! The engine is written as a reducer: a pure function that validates a
//! command against the current state, mutates that state in place and returns
//! descriptions of the side effects (domain-event publication) that the
//! runtime performs once the mutation has been committed.
//!
//! ## Core Concepts
//!
//! - **State**: Domain state owned by one aggregate (one event and its enrollments)
//! - **Action**: All possible inputs to a reducer (commands and the domain events they produce)
//! - **Reducer**: `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: Side effect descriptions, never executed by the reducer itself
//! - **Environment**: Injected dependencies (clock, event bus)
//!
//! ## Example
//!
//! ```ignore
//! use studyhub_core::*;
//!
//! impl Reducer for AdmissionReducer {
//!     type State = AdmissionState;
//!     type Action = AdmissionAction;
//!     type Environment = AdmissionEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut AdmissionState,
//!         action: AdmissionAction,
//!         env: &AdmissionEnvironment,
//!     ) -> SmallVec<[Effect<AdmissionAction>; 4]> {
//!         // Validate, apply, describe effects
//!         SmallVec::new()
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{smallvec, SmallVec};

/// Domain event trait and its serialized wire form
pub mod event;

/// Event bus abstraction used to hand committed domain events to consumers
pub mod event_bus;

mod effect_macros;

/// Reducer module - the core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`.
/// They contain all admission rules and are deterministic and testable.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    ///
    /// # Example
    ///
    /// ```ignore
    /// impl Reducer for AdmissionReducer {
    ///     type State = AdmissionState;
    ///     type Action = AdmissionAction;
    ///     type Environment = AdmissionEnvironment;
    ///
    ///     fn reduce(
    ///         &self,
    ///         state: &mut AdmissionState,
    ///         action: AdmissionAction,
    ///         env: &AdmissionEnvironment,
    ///     ) -> SmallVec<[Effect<AdmissionAction>; 4]> {
    ///         match action {
    ///             AdmissionAction::RequestEnrollment { .. } => {
    ///                 // Business logic here
    ///                 SmallVec::new()
    ///             }
    ///             _ => SmallVec::new(),
    ///         }
    ///     }
    /// }
    /// ```
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// This is a pure function that:
        /// 1. Validates the action
        /// 2. Updates state in place (only when validation passed)
        /// 3. Returns effect descriptions to be executed after commit
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - side effect descriptions
///
/// Effects describe side effects to be performed by the runtime.
/// They are values, returned from reducers and executed by the Store only
/// after the state mutation that produced them has been committed.
pub mod effect {
    use crate::event::SerializedEvent;
    use crate::event_bus::{EventBus, EventBusError};
    use std::sync::Arc;

    /// Callback invoked after a successful publish
    pub type OnPublished<Action> = Box<dyn FnOnce(()) -> Option<Action> + Send>;

    /// Callback invoked when a publish failed after all retries
    pub type OnPublishFailed<Action> = Box<dyn FnOnce(EventBusError) -> Option<Action> + Send>;

    /// Effect type - describes a side effect to be executed
    ///
    /// # Type Parameters
    ///
    /// - `Action`: The action type that effects can feed back into the reducer
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects in parallel
        Parallel(Vec<Effect<Action>>),

        /// Run effects sequentially, in order
        Sequential(Vec<Effect<Action>>),

        /// Publish a serialized domain event to the event bus
        PublishEvent(EventBusOperation<Action>),
    }

    /// Event bus operation carried by [`Effect::PublishEvent`]
    pub enum EventBusOperation<Action> {
        /// Publish one event to one topic
        Publish {
            /// Bus to publish on
            event_bus: Arc<dyn EventBus>,
            /// Destination topic
            topic: String,
            /// Serialized domain event
            event: SerializedEvent,
            /// Action to feed back on success
            on_success: OnPublished<Action>,
            /// Action to feed back on failure
            on_error: OnPublishFailed<Action>,
        },
    }

    // Manual Debug implementation since the callbacks don't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::PublishEvent(EventBusOperation::Publish { topic, event, .. }) => f
                    .debug_struct("Effect::PublishEvent")
                    .field("topic", topic)
                    .field("event_type", &event.event_type)
                    .finish(),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Event types published by this effect tree, in execution order
        #[must_use]
        pub fn published_event_types(&self) -> Vec<&str> {
            match self {
                Effect::None => Vec::new(),
                Effect::Parallel(effects) | Effect::Sequential(effects) => effects
                    .iter()
                    .flat_map(Effect::published_event_types)
                    .collect(),
                Effect::PublishEvent(EventBusOperation::Publish { event, .. }) => {
                    vec![event.event_type.as_str()]
                },
            }
        }
    }
}

/// Environment module - dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the Environment parameter.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The admission engine never runs a background timer; deadlines are
    /// compared against whatever this clock returns when a command arrives.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
