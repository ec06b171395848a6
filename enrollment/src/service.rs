//! Admission service: one store per event.
//!
//! Every mutating operation is a command sent to the event's [`Store`], so it
//! runs under that event's write lock and publishes its domain events in
//! commit order. The registry lock is only held to look up, insert or remove
//! a store handle; different events proceed in parallel.

use crate::aggregates::{AdmissionAction, AdmissionEnvironment, AdmissionReducer, AdmissionState};
use crate::config::Config;
use crate::error::AdmissionError;
use crate::types::{
    AccountId, AdmissionPolicy, Capacity, Enrollment, EnrollmentId, Event, EventDetails, EventId,
};
use crate::validation::AdmissionLimits;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use studyhub_core::environment::Clock;
use studyhub_core::event::Event as _;
use studyhub_core::event_bus::EventBus;
use studyhub_runtime::{RetryPolicy, Store, StoreError};
use thiserror::Error;
use tokio::sync::RwLock;

/// Store of one admission aggregate
pub type AdmissionStore =
    Store<AdmissionState, AdmissionAction, AdmissionEnvironment, AdmissionReducer>;

/// Errors returned by [`AdmissionService`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The command was refused; nothing changed and nothing was published
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// The store did not accept the command
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    /// The admission error, if this is one
    #[must_use]
    pub const fn admission(&self) -> Option<&AdmissionError> {
        match self {
            Self::Admission(error) => Some(error),
            Self::Store(_) => None,
        }
    }
}

/// Entry point for all admission operations
pub struct AdmissionService {
    events: RwLock<HashMap<EventId, Arc<AdmissionStore>>>,
    clock: Arc<dyn Clock>,
    event_bus: Arc<dyn EventBus>,
    topic: String,
    limits: AdmissionLimits,
    retry_policy: RetryPolicy,
    shutting_down: AtomicBool,
}

impl AdmissionService {
    /// Create a service with default limits, topic and retry policy
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, event_bus: Arc<dyn EventBus>) -> Self {
        Self::from_config(&Config::default(), clock, event_bus)
    }

    /// Create a service from loaded configuration
    #[must_use]
    pub fn from_config(
        config: &Config,
        clock: Arc<dyn Clock>,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            clock,
            event_bus,
            topic: config.bus.topic.clone(),
            limits: config.limits(),
            retry_policy: config.retry_policy(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Topic domain events are published on
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn new_store(&self) -> AdmissionStore {
        let environment = AdmissionEnvironment::new(
            Arc::clone(&self.clock),
            Arc::clone(&self.event_bus),
            self.topic.clone(),
            self.limits,
        );
        Store::with_retry_policy(
            AdmissionState::default(),
            AdmissionReducer::new(),
            environment,
            self.retry_policy.clone(),
        )
    }

    async fn store(&self, event_id: EventId) -> Result<Arc<AdmissionStore>, ServiceError> {
        self.events
            .read()
            .await
            .get(&event_id)
            .cloned()
            .ok_or(ServiceError::Admission(AdmissionError::EventNotFound))
    }

    /// Send a command and report its outcome
    ///
    /// Returns the enrollments the command promoted.
    async fn execute(
        store: &AdmissionStore,
        action: AdmissionAction,
    ) -> Result<Vec<EnrollmentId>, ServiceError> {
        Self::execute_with(store, action, |_| ())
            .await
            .map(|(promoted, ())| promoted)
    }

    /// Send a command, reading `observe` from the state it committed
    ///
    /// `observe` runs under the same write lock as the command, so no later
    /// command can interleave.
    #[allow(clippy::cast_precision_loss)] // Gauge values are f64
    async fn execute_with<T>(
        store: &AdmissionStore,
        action: AdmissionAction,
        observe: impl FnOnce(&AdmissionState) -> T,
    ) -> Result<(Vec<EnrollmentId>, T), ServiceError> {
        let command = action.event_type();
        metrics::counter!("admission.commands.total", "command" => command).increment(1);

        let (outcome, observed) = store
            .send_with(action, |state| {
                let outcome = match &state.last_error {
                    Some(error) => Err(error.clone()),
                    None => Ok(state.last_promoted.clone()),
                };
                if let Some(event) = &state.event {
                    metrics::gauge!(
                        "admission.event.admitted",
                        "event_id" => event.id.to_string()
                    )
                    .set(event.admitted_count() as f64);
                }
                (outcome, observe(state))
            })
            .await?;

        match outcome {
            Ok(promoted) => {
                if !promoted.is_empty() {
                    metrics::counter!("admission.enrollments.promoted")
                        .increment(promoted.len() as u64);
                    tracing::info!(command, promoted = promoted.len(), "Waitlist promoted");
                }
                Ok((promoted, observed))
            },
            Err(error) => {
                metrics::counter!("admission.commands.rejected", "command" => command)
                    .increment(1);
                tracing::debug!(command, error = %error, "Command rejected");
                Err(error.into())
            },
        }
    }

    async fn send(
        &self,
        event_id: EventId,
        action: AdmissionAction,
    ) -> Result<Vec<EnrollmentId>, ServiceError> {
        let store = self.store(event_id).await?;
        Self::execute(&store, action).await
    }

    // ------------------------------------------------------------------------
    // Event lifecycle
    // ------------------------------------------------------------------------

    /// Create an event with a fresh id
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::InvalidDetails`] if the form is invalid.
    pub async fn create_event(
        &self,
        study: impl Into<String>,
        organizer: AccountId,
        details: EventDetails,
    ) -> Result<EventId, ServiceError> {
        let event_id = EventId::new();
        self.create_event_with_id(event_id, study, organizer, details).await?;
        Ok(event_id)
    }

    /// Create an event under a caller-chosen id
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EventAlreadyExists`] if the id is taken,
    /// [`AdmissionError::InvalidDetails`] if the form is invalid and
    /// [`StoreError::ShutdownInProgress`] once the service is shutting down.
    #[tracing::instrument(skip(self, study, details), fields(title = %details.title))]
    pub async fn create_event_with_id(
        &self,
        event_id: EventId,
        study: impl Into<String>,
        organizer: AccountId,
        details: EventDetails,
    ) -> Result<(), ServiceError> {
        let store = {
            let mut events = self.events.write().await;
            if self.shutting_down.load(Ordering::Acquire) {
                tracing::warn!("Rejected event: service is shutting down");
                return Err(StoreError::ShutdownInProgress.into());
            }
            if events.contains_key(&event_id) {
                return Err(AdmissionError::EventAlreadyExists.into());
            }
            let store = Arc::new(self.new_store());
            events.insert(event_id, Arc::clone(&store));
            store
        };

        let result = Self::execute(
            &store,
            AdmissionAction::CreateEvent {
                event_id,
                study: study.into(),
                organizer,
                details,
            },
        )
        .await;

        if result.is_err() {
            let mut events = self.events.write().await;
            if events.get(&event_id).is_some_and(|current| Arc::ptr_eq(current, &store)) {
                events.remove(&event_id);
            }
        } else {
            tracing::info!("Event created");
        }

        result.map(|_| ())
    }

    /// Cancel an event; later operations on it fail with `EventNotFound`
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EventNotFound`] if the event does not exist.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_event(&self, event_id: EventId) -> Result<(), ServiceError> {
        let store = self.store(event_id).await?;
        Self::execute(&store, AdmissionAction::CancelEvent).await?;

        let mut events = self.events.write().await;
        if events.get(&event_id).is_some_and(|current| Arc::ptr_eq(current, &store)) {
            events.remove(&event_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Member operations
    // ------------------------------------------------------------------------

    /// Request enrollment now
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotEnrollable`] if the account is already
    /// enrolled or enrollment has closed.
    pub async fn request_enrollment(
        &self,
        event_id: EventId,
        account_id: AccountId,
    ) -> Result<EnrollmentId, ServiceError> {
        self.request_enrollment_at(event_id, account_id, self.clock.now()).await
    }

    /// Request enrollment at an explicit instant
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotEnrollable`] if the account is already
    /// enrolled or `now` is at or past the enrollment deadline.
    #[tracing::instrument(skip(self))]
    pub async fn request_enrollment_at(
        &self,
        event_id: EventId,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentId, ServiceError> {
        let store = self.store(event_id).await?;
        let enrollment_id = EnrollmentId::new();

        let (_, admitted) = Self::execute_with(
            &store,
            AdmissionAction::RequestEnrollment {
                enrollment_id,
                account_id,
                requested_at: now,
            },
            |state| {
                state
                    .event
                    .as_ref()
                    .and_then(|e| e.enrollment(enrollment_id))
                    .is_some_and(|e| e.admitted)
            },
        )
        .await?;

        let outcome = if admitted { "admitted" } else { "waitlisted" };
        metrics::counter!("admission.enrollments.created", "outcome" => outcome).increment(1);
        tracing::debug!(%enrollment_id, outcome, "Enrollment recorded");

        Ok(enrollment_id)
    }

    /// Withdraw the account's enrollment
    ///
    /// Returns the enrollments promoted into the freed seat.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotWithdrawable`] if there is no enrollment or
    /// it was already checked in.
    #[tracing::instrument(skip(self))]
    pub async fn withdraw_enrollment(
        &self,
        event_id: EventId,
        account_id: AccountId,
    ) -> Result<Vec<EnrollmentId>, ServiceError> {
        self.send(event_id, AdmissionAction::WithdrawEnrollment { account_id }).await
    }

    // ------------------------------------------------------------------------
    // Organizer operations
    // ------------------------------------------------------------------------

    /// Admit a waiting enrollment (organizer-confirmed events only)
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::PolicyViolation`] if the event is not
    /// organizer confirmed, is full, or the enrollment is already admitted or
    /// attended.
    #[tracing::instrument(skip(self))]
    pub async fn organizer_accept(
        &self,
        event_id: EventId,
        enrollment_id: EnrollmentId,
    ) -> Result<(), ServiceError> {
        self.send(event_id, AdmissionAction::AcceptEnrollment { enrollment_id })
            .await
            .map(|_| ())
    }

    /// Revoke an admission (organizer-confirmed events only)
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::PolicyViolation`] if the event is not
    /// organizer confirmed or the enrollment is not admitted or attended.
    #[tracing::instrument(skip(self))]
    pub async fn organizer_reject(
        &self,
        event_id: EventId,
        enrollment_id: EnrollmentId,
    ) -> Result<(), ServiceError> {
        self.send(event_id, AdmissionAction::RejectEnrollment { enrollment_id })
            .await
            .map(|_| ())
    }

    /// Record attendance
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EnrollmentNotFound`] if the enrollment does
    /// not belong to the event.
    pub async fn check_in(
        &self,
        event_id: EventId,
        enrollment_id: EnrollmentId,
    ) -> Result<(), ServiceError> {
        self.send(event_id, AdmissionAction::CheckIn { enrollment_id })
            .await
            .map(|_| ())
    }

    /// Undo a recorded attendance
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EnrollmentNotFound`] if the enrollment does
    /// not belong to the event.
    pub async fn cancel_check_in(
        &self,
        event_id: EventId,
        enrollment_id: EnrollmentId,
    ) -> Result<(), ServiceError> {
        self.send(event_id, AdmissionAction::CancelCheckIn { enrollment_id })
            .await
            .map(|_| ())
    }

    /// Change the capacity, promoting into any room it frees
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::InvalidCapacityChange`] if the capacity is
    /// below the admitted count.
    #[tracing::instrument(skip(self))]
    pub async fn update_capacity(
        &self,
        event_id: EventId,
        capacity: Capacity,
    ) -> Result<Vec<EnrollmentId>, ServiceError> {
        self.send(event_id, AdmissionAction::UpdateCapacity { capacity }).await
    }

    /// Change the admission policy; switching to first come, first served promotes
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EventNotFound`] if the event does not exist.
    #[tracing::instrument(skip(self))]
    pub async fn update_policy(
        &self,
        event_id: EventId,
        policy: AdmissionPolicy,
    ) -> Result<Vec<EnrollmentId>, ServiceError> {
        self.send(event_id, AdmissionAction::UpdatePolicy { policy }).await
    }

    /// Edit the event form; the current admission policy is kept
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::InvalidDetails`] for form problems and
    /// [`AdmissionError::InvalidCapacityChange`] if the capacity is below the
    /// admitted count.
    #[tracing::instrument(skip(self, details))]
    pub async fn update_event_details(
        &self,
        event_id: EventId,
        details: EventDetails,
    ) -> Result<Vec<EnrollmentId>, ServiceError> {
        self.send(event_id, AdmissionAction::UpdateEventDetails { details }).await
    }

    /// Admit waiting enrollments into free capacity
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EventNotFound`] if the event does not exist.
    pub async fn promote_waitlist(
        &self,
        event_id: EventId,
    ) -> Result<Vec<EnrollmentId>, ServiceError> {
        self.send(event_id, AdmissionAction::PromoteWaitlist).await
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    async fn query<T>(
        &self,
        event_id: EventId,
        f: impl FnOnce(&Event) -> T,
    ) -> Result<T, ServiceError> {
        let store = self.store(event_id).await?;
        store
            .state(|s| s.event.as_ref().map(f))
            .await
            .ok_or(ServiceError::Admission(AdmissionError::EventNotFound))
    }

    /// Snapshot of the event and its enrollments
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EventNotFound`] if the event does not exist.
    pub async fn event(&self, event_id: EventId) -> Result<Event, ServiceError> {
        self.query(event_id, Event::clone).await
    }

    /// Whether the account may request enrollment now
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EventNotFound`] if the event does not exist.
    pub async fn is_enrollable(
        &self,
        event_id: EventId,
        account_id: AccountId,
    ) -> Result<bool, ServiceError> {
        let now = self.clock.now();
        self.query(event_id, |e| e.is_enrollable(account_id, now)).await
    }

    /// Whether the account has an enrollment it can withdraw
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EventNotFound`] if the event does not exist.
    pub async fn is_withdrawable(
        &self,
        event_id: EventId,
        account_id: AccountId,
    ) -> Result<bool, ServiceError> {
        self.query(event_id, |e| e.is_withdrawable(account_id)).await
    }

    /// Signed `capacity - admitted`; `None` when unlimited
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EventNotFound`] if the event does not exist.
    pub async fn remaining_slots(&self, event_id: EventId) -> Result<Option<i64>, ServiceError> {
        self.query(event_id, Event::remaining_slots).await
    }

    /// Waiting enrollments in priority order
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EventNotFound`] if the event does not exist.
    pub async fn waitlist(&self, event_id: EventId) -> Result<Vec<Enrollment>, ServiceError> {
        self.query(event_id, |e| e.waitlist().into_iter().cloned().collect())
            .await
    }

    /// The account's enrollments across all events, newest first
    pub async fn enrollments_of(&self, account_id: AccountId, admitted: bool) -> Vec<Enrollment> {
        let stores: Vec<Arc<AdmissionStore>> =
            self.events.read().await.values().cloned().collect();

        let mut enrollments = Vec::new();
        for store in stores {
            let found = store
                .state(|s| {
                    s.event
                        .as_ref()
                        .and_then(|e| e.enrollment_for(account_id))
                        .filter(|e| e.admitted == admitted)
                        .cloned()
                })
                .await;
            enrollments.extend(found);
        }

        enrollments.sort_by(|a, b| b.enrolled_at.cmp(&a.enrolled_at));
        enrollments
    }

    /// Number of live events
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    /// Domain events of this event that could not be published
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EventNotFound`] if the event does not exist.
    pub async fn publication_failures(&self, event_id: EventId) -> Result<u64, ServiceError> {
        let store = self.store(event_id).await?;
        Ok(store.state(|s| s.publication_failures).await)
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop every store and wait for in-flight publications
    ///
    /// Events created after this call are refused.
    ///
    /// # Errors
    ///
    /// Returns the first [`StoreError::ShutdownTimeout`] encountered.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ServiceError> {
        self.shutting_down.store(true, Ordering::Release);
        let stores: Vec<Arc<AdmissionStore>> =
            self.events.read().await.values().cloned().collect();
        tracing::info!(events = stores.len(), "Shutting down admission service");

        let results =
            futures::future::join_all(stores.iter().map(|store| store.shutdown(timeout))).await;
        results.into_iter().collect::<Result<Vec<()>, StoreError>>()?;
        Ok(())
    }
}
