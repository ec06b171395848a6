//! # Study Hub Runtime
//!
//! Runtime for admission reducers.
//!
//! A [`Store`] owns the state of one aggregate. Every command is reduced
//! under the store's write lock, so mutations of one aggregate are
//! linearizable. The effects a reducer returns are executed only after the
//! mutation has been committed, and in the order the mutations were committed.
//!
//! ## Core Components
//!
//! - **Store**: serializes commands for one aggregate and runs their effects
//! - **`InMemoryEventBus`**: broadcast-channel bus used to reach observers
//! - **`RetryPolicy`**: exponential backoff around publication
//! - **`MetricsServer`**: Prometheus recorder
//!
//! ## Example
//!
//! ```ignore
//! use studyhub_runtime::Store;
//!
//! let store = Store::new(AdmissionState::default(), AdmissionReducer::new(), env);
//!
//! let error = store
//!     .send_with(AdmissionAction::RequestEnrollment { .. }, |s| s.last_error.clone())
//!     .await?;
//!
//! let waiting = store.state(|s| s.waitlist_len()).await;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use studyhub_core::{effect::Effect, reducer::Reducer};
use tokio::sync::RwLock;

/// In-process event bus
pub mod event_bus;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

pub use error::StoreError;
pub use event_bus::InMemoryEventBus;
pub use retry::RetryPolicy;
pub use store::Store;

/// Error types for the Store runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur during Store operations
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new commands
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for publications to complete
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),
    }
}

/// Decrements the shared pending counter when dropped.
struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        let pending = counter.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::StoreMetrics::record_pending(pending);
        Self(Arc::clone(counter))
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let pending = self.0.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        crate::metrics::StoreMetrics::record_pending(pending);
    }
}

/// Store runtime for coordinating reducer execution and effect handling.
pub mod store {
    use super::{
        Arc, AtomicBool, AtomicUsize, Duration, Effect, Ordering, PendingGuard, Reducer, RwLock,
        StoreError,
    };
    use crate::metrics::StoreMetrics;
    use crate::retry::{RetryPolicy, retry_with_backoff};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use studyhub_core::effect::EventBusOperation;
    use tokio::sync::Mutex;

    /// The Store - runtime coordinator for one aggregate
    ///
    /// The Store manages:
    /// 1. State (behind `RwLock`; the reducer runs under the write lock)
    /// 2. Reducer (business logic)
    /// 3. Environment (injected dependencies)
    /// 4. Effect execution, serialized in commit order by an emission lock
    ///
    /// # Commit Ordering
    ///
    /// Before releasing the state lock after a mutation that produced effects,
    /// the store acquires its emission lock. The next mutation can therefore
    /// only start emitting once the previous one has finished, and observers
    /// see events in exactly the order the mutations were committed.
    ///
    /// # Type Parameters
    ///
    /// - `S`: State type
    /// - `A`: Action type
    /// - `E`: Environment type
    /// - `R`: Reducer implementation
    pub struct Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        state: Arc<RwLock<S>>,
        reducer: R,
        environment: E,
        retry_policy: RetryPolicy,
        emission: Arc<Mutex<()>>,
        shutdown: Arc<AtomicBool>,
        pending_effects: Arc<AtomicUsize>,
    }

    type EffectFuture<'a, A> = Pin<Box<dyn Future<Output = Vec<A>> + Send + 'a>>;

    impl<S, A, E, R> Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
        A: Send + 'static,
        S: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        /// Create a new store with the default retry policy
        #[must_use]
        pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
            Self::with_retry_policy(initial_state, reducer, environment, RetryPolicy::default())
        }

        /// Create a new store whose publications retry according to `retry_policy`
        #[must_use]
        pub fn with_retry_policy(
            initial_state: S,
            reducer: R,
            environment: E,
            retry_policy: RetryPolicy,
        ) -> Self {
            Self {
                state: Arc::new(RwLock::new(initial_state)),
                reducer,
                environment,
                retry_policy,
                emission: Arc::new(Mutex::new(())),
                shutdown: Arc::new(AtomicBool::new(false)),
                pending_effects: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Send an action to the store
        ///
        /// Reduces the action, then runs its effects. Returns once the effects
        /// (and any actions they fed back) have completed.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
        pub async fn send(&self, action: A) -> Result<(), StoreError> {
            self.send_with(action, |_| ()).await
        }

        /// Send an action and inspect the resulting state atomically
        ///
        /// `inspect` runs under the same write lock as the reducer, so it sees
        /// exactly the state produced by this action. This is how callers learn
        /// whether their command was rejected.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
        #[tracing::instrument(skip(self, action, inspect), name = "store_send")]
        pub async fn send_with<F, T>(&self, action: A, inspect: F) -> Result<T, StoreError>
        where
            F: FnOnce(&S) -> T,
        {
            if self.shutdown.load(Ordering::Acquire) {
                tracing::warn!("Rejected action: store is shutting down");
                StoreMetrics::record_rejected_during_shutdown();
                return Err(StoreError::ShutdownInProgress);
            }

            let (output, feedback) = self.dispatch(action, inspect).await;

            // Feedback actions are reduced after the emission lock was released.
            let mut queue = VecDeque::from(feedback);
            while let Some(next) = queue.pop_front() {
                let ((), more) = self.dispatch(next, |_| ()).await;
                queue.extend(more);
            }

            Ok(output)
        }

        async fn dispatch<F, T>(&self, action: A, inspect: F) -> (T, Vec<A>)
        where
            F: FnOnce(&S) -> T,
        {
            let (output, effects, emission_guard) = {
                let mut state = self.state.write().await;
                tracing::trace!("Acquired write lock on state");

                let start = std::time::Instant::now();
                let effects = self.reducer.reduce(&mut state, action, &self.environment);
                StoreMetrics::record_reduce(start.elapsed());
                tracing::trace!("Reducer completed, returned {} effects", effects.len());

                let output = inspect(&state);

                let emission_guard = if effects.is_empty() {
                    None
                } else {
                    Some(Arc::clone(&self.emission).lock_owned().await)
                };

                (output, effects, emission_guard)
            };

            let Some(guard) = emission_guard else {
                return (output, Vec::new());
            };

            let _pending = PendingGuard::new(&self.pending_effects);
            let mut feedback = Vec::new();
            for effect in effects {
                feedback.extend(self.execute_effect(effect).await);
            }
            drop(guard);

            (output, feedback)
        }

        /// Execute one effect tree, returning the actions it fed back
        ///
        /// - `None`: no-op
        /// - `Sequential`: in order, each awaited before the next
        /// - `Parallel`: concurrently
        /// - `PublishEvent`: publish with retry, then invoke the callback
        fn execute_effect(&self, effect: Effect<A>) -> EffectFuture<'_, A> {
            Box::pin(async move {
                match effect {
                    Effect::None => Vec::new(),
                    Effect::Sequential(effects) => {
                        let mut feedback = Vec::new();
                        for effect in effects {
                            feedback.extend(self.execute_effect(effect).await);
                        }
                        feedback
                    },
                    Effect::Parallel(effects) => {
                        let branches =
                            effects.into_iter().map(|effect| self.execute_effect(effect));
                        futures::future::join_all(branches)
                            .await
                            .into_iter()
                            .flatten()
                            .collect()
                    },
                    Effect::PublishEvent(EventBusOperation::Publish {
                        event_bus,
                        topic,
                        event,
                        on_success,
                        on_error,
                    }) => {
                        tracing::debug!(
                            topic = %topic,
                            event_type = %event.event_type,
                            "Executing publish"
                        );

                        let result = retry_with_backoff(&self.retry_policy, "publish", || {
                            event_bus.publish(&topic, &event)
                        })
                        .await;

                        let action = match result {
                            Ok(()) => on_success(()),
                            Err(error) => {
                                tracing::warn!(
                                    topic = %topic,
                                    event_type = %event.event_type,
                                    error = %error,
                                    "publish failed"
                                );
                                on_error(error)
                            },
                        };
                        action.into_iter().collect()
                    },
                }
            })
        }

        /// Read current state via a closure
        ///
        /// ```ignore
        /// let waiting = store.state(|s| s.waitlist_len()).await;
        /// ```
        pub async fn state<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            let state = self.state.read().await;
            f(&state)
        }

        /// Whether [`Self::shutdown`] has been called
        #[must_use]
        pub fn is_shutting_down(&self) -> bool {
            self.shutdown.load(Ordering::Acquire)
        }

        /// Stop accepting commands and wait for in-flight publications
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownTimeout`] if the timeout expires before all
        /// pending effects complete.
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            tracing::info!("Initiating graceful shutdown");
            self.shutdown.store(true, Ordering::Release);

            let start = std::time::Instant::now();
            let poll_interval = Duration::from_millis(10);

            loop {
                let pending = self.pending_effects.load(Ordering::Acquire);

                if pending == 0 {
                    tracing::info!("All effects completed, shutdown successful");
                    return Ok(());
                }

                if start.elapsed() >= timeout {
                    tracing::error!(pending_effects = pending, "Shutdown timeout");
                    return Err(StoreError::ShutdownTimeout(pending));
                }

                tokio::time::sleep(poll_interval).await;
            }
        }
    }

    impl<S, A, E, R> Clone for Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Clone,
        E: Clone,
    {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
                reducer: self.reducer.clone(),
                environment: self.environment.clone(),
                retry_policy: self.retry_policy.clone(),
                emission: Arc::clone(&self.emission),
                shutdown: Arc::clone(&self.shutdown),
                pending_effects: Arc::clone(&self.pending_effects),
            }
        }
    }
}
