//! Admission aggregate: one event and its enrollments.
//!
//! Commands are validated against the current event, turned into domain
//! events, applied to state and published. A rejected command records
//! `last_error` and produces no effects.
//!
//! Under first come, first served every operation that can free capacity
//! (withdrawal, capacity increase, switching to the policy, an explicit
//! promotion) ends by admitting the earliest waiting enrollments that fit.

use crate::error::{
    AdmissionError, NotEnrollableReason, NotWithdrawableReason, PolicyViolationReason,
};
use crate::types::{
    AccountId, AdmissionPolicy, Capacity, Enrollment, EnrollmentId, Event, EventDetails, EventId,
};
use crate::validation::{
    AdmissionLimits, validate_capacity_change, validate_event_update, validate_new_event,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use studyhub_core::{
    SmallVec, effect::Effect, environment::Clock, event::SerializedEvent, event_bus::EventBus,
    publish_event, reducer::Reducer,
};

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Actions for the admission aggregate
///
/// Commands express intent, events record what happened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AdmissionAction {
    // Commands
    /// Create the event
    CreateEvent {
        /// Event identifier
        event_id: EventId,
        /// Owning study group
        study: String,
        /// Organizer creating the event
        organizer: AccountId,
        /// Event form
        details: EventDetails,
    },

    /// Ask to join the event
    RequestEnrollment {
        /// Identifier for the new enrollment
        enrollment_id: EnrollmentId,
        /// Requesting account
        account_id: AccountId,
        /// When the request was made
        requested_at: DateTime<Utc>,
    },

    /// Withdraw an account's enrollment
    WithdrawEnrollment {
        /// Withdrawing account
        account_id: AccountId,
    },

    /// Organizer admits a waiting enrollment
    AcceptEnrollment {
        /// Enrollment to admit
        enrollment_id: EnrollmentId,
    },

    /// Organizer revokes an admission
    RejectEnrollment {
        /// Enrollment to reject
        enrollment_id: EnrollmentId,
    },

    /// Record attendance
    CheckIn {
        /// Enrollment that attended
        enrollment_id: EnrollmentId,
    },

    /// Undo a recorded attendance
    CancelCheckIn {
        /// Enrollment to mark absent
        enrollment_id: EnrollmentId,
    },

    /// Change the capacity
    UpdateCapacity {
        /// New capacity
        capacity: Capacity,
    },

    /// Change the admission policy
    UpdatePolicy {
        /// New policy
        policy: AdmissionPolicy,
    },

    /// Edit title, description, capacity and schedule
    UpdateEventDetails {
        /// New form; its admission policy is ignored
        details: EventDetails,
    },

    /// Admit waiting enrollments into free capacity
    PromoteWaitlist,

    /// Cancel the event and drop all enrollments
    CancelEvent,

    // Events
    /// The event was created
    EventCreated {
        /// Event identifier
        event_id: EventId,
        /// Owning study group
        study: String,
        /// Organizer
        organizer: AccountId,
        /// Validated form
        details: EventDetails,
        /// Creation time
        created_at: DateTime<Utc>,
        /// Human-readable description
        summary: String,
    },

    /// A request was recorded, admitted or waiting
    EnrollmentCreated {
        /// The new enrollment
        enrollment: Enrollment,
        /// Human-readable description
        summary: String,
    },

    /// An enrollment was withdrawn and discarded
    EnrollmentWithdrawn {
        /// Event
        event_id: EventId,
        /// Withdrawn enrollment
        enrollment_id: EnrollmentId,
        /// Its account
        account_id: AccountId,
        /// Whether it held a seat
        was_admitted: bool,
        /// Human-readable description
        summary: String,
    },

    /// A waiting enrollment was admitted automatically
    EnrollmentPromoted {
        /// Event
        event_id: EventId,
        /// Promoted enrollment
        enrollment_id: EnrollmentId,
        /// Its account
        account_id: AccountId,
        /// Human-readable description
        summary: String,
    },

    /// An organizer admitted an enrollment
    EnrollmentAccepted {
        /// Event
        event_id: EventId,
        /// Accepted enrollment
        enrollment_id: EnrollmentId,
        /// Its account
        account_id: AccountId,
        /// Human-readable description
        summary: String,
    },

    /// An organizer revoked an admission
    EnrollmentRejected {
        /// Event
        event_id: EventId,
        /// Rejected enrollment
        enrollment_id: EnrollmentId,
        /// Its account
        account_id: AccountId,
        /// Human-readable description
        summary: String,
    },

    /// Attendance was recorded
    AttendanceChecked {
        /// Event
        event_id: EventId,
        /// Enrollment
        enrollment_id: EnrollmentId,
        /// Its account
        account_id: AccountId,
        /// Human-readable description
        summary: String,
    },

    /// Attendance was withdrawn
    AttendanceCancelled {
        /// Event
        event_id: EventId,
        /// Enrollment
        enrollment_id: EnrollmentId,
        /// Its account
        account_id: AccountId,
        /// Human-readable description
        summary: String,
    },

    /// The capacity changed
    EventCapacityChanged {
        /// Event
        event_id: EventId,
        /// Capacity before the change
        previous: Capacity,
        /// Capacity after the change
        capacity: Capacity,
        /// Human-readable description
        summary: String,
    },

    /// The admission policy changed
    AdmissionPolicyChanged {
        /// Event
        event_id: EventId,
        /// Policy before the change
        previous: AdmissionPolicy,
        /// Policy after the change
        policy: AdmissionPolicy,
        /// Human-readable description
        summary: String,
    },

    /// Title, description or schedule changed
    EventDetailsUpdated {
        /// Event
        event_id: EventId,
        /// Form as applied
        details: EventDetails,
        /// Human-readable description
        summary: String,
    },

    /// The event was cancelled
    EventCancelled {
        /// Event
        event_id: EventId,
        /// Enrollments dropped with it
        enrollments: Vec<Enrollment>,
        /// Human-readable description
        summary: String,
    },

    /// A domain event could not be published
    PublicationFailed {
        /// Type of the lost event
        event_type: String,
        /// Last publish error
        error: String,
    },

    /// Command validation failed
    ValidationFailed {
        /// Why
        error: AdmissionError,
    },
}

impl AdmissionAction {
    /// Whether this action expresses intent
    #[must_use]
    pub const fn is_command(&self) -> bool {
        matches!(
            self,
            Self::CreateEvent { .. }
                | Self::RequestEnrollment { .. }
                | Self::WithdrawEnrollment { .. }
                | Self::AcceptEnrollment { .. }
                | Self::RejectEnrollment { .. }
                | Self::CheckIn { .. }
                | Self::CancelCheckIn { .. }
                | Self::UpdateCapacity { .. }
                | Self::UpdatePolicy { .. }
                | Self::UpdateEventDetails { .. }
                | Self::PromoteWaitlist
                | Self::CancelEvent
        )
    }

    /// Whether this action records something that happened
    #[must_use]
    pub const fn is_event(&self) -> bool {
        !self.is_command()
    }

    /// Human-readable summary carried by published domain events
    #[must_use]
    pub fn summary(&self) -> Option<&str> {
        match self {
            Self::EventCreated { summary, .. }
            | Self::EnrollmentCreated { summary, .. }
            | Self::EnrollmentWithdrawn { summary, .. }
            | Self::EnrollmentPromoted { summary, .. }
            | Self::EnrollmentAccepted { summary, .. }
            | Self::EnrollmentRejected { summary, .. }
            | Self::AttendanceChecked { summary, .. }
            | Self::AttendanceCancelled { summary, .. }
            | Self::EventCapacityChanged { summary, .. }
            | Self::AdmissionPolicyChanged { summary, .. }
            | Self::EventDetailsUpdated { summary, .. }
            | Self::EventCancelled { summary, .. } => Some(summary),
            _ => None,
        }
    }
}

impl studyhub_core::event::Event for AdmissionAction {
    fn event_type(&self) -> &'static str {
        match self {
            Self::CreateEvent { .. } => "CreateEvent.v1",
            Self::RequestEnrollment { .. } => "RequestEnrollment.v1",
            Self::WithdrawEnrollment { .. } => "WithdrawEnrollment.v1",
            Self::AcceptEnrollment { .. } => "AcceptEnrollment.v1",
            Self::RejectEnrollment { .. } => "RejectEnrollment.v1",
            Self::CheckIn { .. } => "CheckIn.v1",
            Self::CancelCheckIn { .. } => "CancelCheckIn.v1",
            Self::UpdateCapacity { .. } => "UpdateCapacity.v1",
            Self::UpdatePolicy { .. } => "UpdatePolicy.v1",
            Self::UpdateEventDetails { .. } => "UpdateEventDetails.v1",
            Self::PromoteWaitlist => "PromoteWaitlist.v1",
            Self::CancelEvent => "CancelEvent.v1",
            Self::EventCreated { .. } => "EventCreated.v1",
            Self::EnrollmentCreated { .. } => "EnrollmentCreated.v1",
            Self::EnrollmentWithdrawn { .. } => "EnrollmentWithdrawn.v1",
            Self::EnrollmentPromoted { .. } => "EnrollmentPromoted.v1",
            Self::EnrollmentAccepted { .. } => "EnrollmentAccepted.v1",
            Self::EnrollmentRejected { .. } => "EnrollmentRejected.v1",
            Self::AttendanceChecked { .. } => "AttendanceChecked.v1",
            Self::AttendanceCancelled { .. } => "AttendanceCancelled.v1",
            Self::EventCapacityChanged { .. } => "EventCapacityChanged.v1",
            Self::AdmissionPolicyChanged { .. } => "AdmissionPolicyChanged.v1",
            Self::EventDetailsUpdated { .. } => "EventDetailsUpdated.v1",
            Self::EventCancelled { .. } => "EventCancelled.v1",
            Self::PublicationFailed { .. } => "PublicationFailed.v1",
            Self::ValidationFailed { .. } => "ValidationFailed.v1",
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// State of one admission aggregate
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdmissionState {
    /// The event, once created and until cancelled
    pub event: Option<Event>,
    /// Error of the most recent command, if it was rejected
    pub last_error: Option<AdmissionError>,
    /// Enrollments promoted by the most recent command
    pub last_promoted: Vec<EnrollmentId>,
    /// Enrollments promoted over the lifetime of the aggregate
    pub promoted_total: u64,
    /// Domain events that could not be published
    pub publication_failures: u64,
}

impl AdmissionState {
    /// Number of waiting enrollments
    #[must_use]
    pub fn waitlist_len(&self) -> usize {
        self.event.as_ref().map_or(0, |e| e.waitlist().len())
    }

    /// Number of admitted enrollments
    #[must_use]
    pub fn admitted_count(&self) -> usize {
        self.event.as_ref().map_or(0, Event::admitted_count)
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the admission aggregate
#[derive(Clone)]
pub struct AdmissionEnvironment {
    /// Clock used to validate schedules and stamp creation
    pub clock: Arc<dyn Clock>,
    /// Bus that receives committed domain events
    pub event_bus: Arc<dyn EventBus>,
    /// Topic domain events are published on
    pub topic: String,
    /// Form bounds
    pub limits: AdmissionLimits,
}

impl AdmissionEnvironment {
    /// Creates a new `AdmissionEnvironment`
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        event_bus: Arc<dyn EventBus>,
        topic: impl Into<String>,
        limits: AdmissionLimits,
    ) -> Self {
        Self {
            clock,
            event_bus,
            topic: topic.into(),
            limits,
        }
    }
}

// ============================================================================
// Reducer
// ============================================================================

type Effects = SmallVec<[Effect<AdmissionAction>; 4]>;

/// Reducer for the admission aggregate
#[derive(Clone, Debug, Default)]
pub struct AdmissionReducer;

impl AdmissionReducer {
    /// Creates a new `AdmissionReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// One publish effect per domain event, in order
    fn create_effects(events: Vec<AdmissionAction>, env: &AdmissionEnvironment) -> Effects {
        events
            .into_iter()
            .filter_map(|event| {
                let metadata = Self::metadata(&event);
                match SerializedEvent::from_event(&event, metadata) {
                    Ok(serialized) => Some(serialized),
                    Err(error) => {
                        tracing::error!(error = %error, ?event, "Failed to serialize domain event");
                        None
                    },
                }
            })
            .map(|serialized| {
                let event_type = serialized.event_type.clone();
                publish_event! {
                    bus: env.event_bus,
                    topic: env.topic,
                    event: serialized,
                    on_success: || None,
                    on_error: |error| Some(AdmissionAction::PublicationFailed {
                        event_type,
                        error: error.to_string(),
                    })
                }
            })
            .collect()
    }

    fn metadata(event: &AdmissionAction) -> Option<serde_json::Value> {
        let (event_id, account_id) = match event {
            AdmissionAction::EnrollmentCreated { enrollment, .. } => {
                (enrollment.event_id, Some(enrollment.account_id))
            },
            AdmissionAction::EnrollmentWithdrawn { event_id, account_id, .. }
            | AdmissionAction::EnrollmentPromoted { event_id, account_id, .. }
            | AdmissionAction::EnrollmentAccepted { event_id, account_id, .. }
            | AdmissionAction::EnrollmentRejected { event_id, account_id, .. }
            | AdmissionAction::AttendanceChecked { event_id, account_id, .. }
            | AdmissionAction::AttendanceCancelled { event_id, account_id, .. } => {
                (*event_id, Some(*account_id))
            },
            AdmissionAction::EventCreated { event_id, .. }
            | AdmissionAction::EventCapacityChanged { event_id, .. }
            | AdmissionAction::AdmissionPolicyChanged { event_id, .. }
            | AdmissionAction::EventDetailsUpdated { event_id, .. }
            | AdmissionAction::EventCancelled { event_id, .. } => (*event_id, None),
            _ => return None,
        };

        Some(serde_json::json!({
            "event_id": event_id.to_string(),
            "account_id": account_id.map(|a| a.to_string()),
        }))
    }

    fn require_event(state: &AdmissionState) -> Result<&Event, AdmissionError> {
        state.event.as_ref().ok_or(AdmissionError::EventNotFound)
    }

    fn require_enrollment(event: &Event, id: EnrollmentId) -> Result<&Enrollment, AdmissionError> {
        event.enrollment(id).ok_or(AdmissionError::EnrollmentNotFound)
    }

    /// Validates `CreateEvent` command
    fn validate_create_event(
        state: &AdmissionState,
        details: &EventDetails,
        now: DateTime<Utc>,
        limits: &AdmissionLimits,
    ) -> Result<(), AdmissionError> {
        if state.event.is_some() {
            return Err(AdmissionError::EventAlreadyExists);
        }
        validate_new_event(details, now, limits)
    }

    /// Validates `RequestEnrollment` command
    fn validate_request(
        state: &AdmissionState,
        account_id: AccountId,
        requested_at: DateTime<Utc>,
    ) -> Result<&Event, AdmissionError> {
        let event = Self::require_event(state)?;

        if event.enrollment_for(account_id).is_some() {
            return Err(AdmissionError::NotEnrollable(NotEnrollableReason::AlreadyEnrolled));
        }
        if requested_at >= event.enrollment_closes_at {
            return Err(AdmissionError::NotEnrollable(NotEnrollableReason::EnrollmentClosed));
        }

        Ok(event)
    }

    /// Validates `WithdrawEnrollment` command
    fn validate_withdraw(
        state: &AdmissionState,
        account_id: AccountId,
    ) -> Result<(&Event, &Enrollment), AdmissionError> {
        let event = Self::require_event(state)?;
        let enrollment = event
            .enrollment_for(account_id)
            .ok_or(AdmissionError::NotWithdrawable(NotWithdrawableReason::NotEnrolled))?;

        if enrollment.attended {
            return Err(AdmissionError::NotWithdrawable(NotWithdrawableReason::AlreadyAttended));
        }

        Ok((event, enrollment))
    }

    /// Validates `AcceptEnrollment` command
    fn validate_accept(
        state: &AdmissionState,
        enrollment_id: EnrollmentId,
    ) -> Result<(&Event, &Enrollment), AdmissionError> {
        let event = Self::require_event(state)?;
        let enrollment = Self::require_enrollment(event, enrollment_id)?;

        let violation = if event.admission_policy != AdmissionPolicy::OrganizerConfirmed {
            Some(PolicyViolationReason::NotOrganizerConfirmed)
        } else if enrollment.attended {
            Some(PolicyViolationReason::AlreadyAttended)
        } else if enrollment.admitted {
            Some(PolicyViolationReason::AlreadyAdmitted)
        } else if !event.capacity.has_room_for_one_more(event.admitted_count()) {
            Some(PolicyViolationReason::CapacityFull)
        } else {
            None
        };

        match violation {
            Some(reason) => Err(AdmissionError::PolicyViolation(reason)),
            None => Ok((event, enrollment)),
        }
    }

    /// Validates `RejectEnrollment` command
    fn validate_reject(
        state: &AdmissionState,
        enrollment_id: EnrollmentId,
    ) -> Result<(&Event, &Enrollment), AdmissionError> {
        let event = Self::require_event(state)?;
        let enrollment = Self::require_enrollment(event, enrollment_id)?;

        let violation = if event.admission_policy != AdmissionPolicy::OrganizerConfirmed {
            Some(PolicyViolationReason::NotOrganizerConfirmed)
        } else if enrollment.attended {
            Some(PolicyViolationReason::AlreadyAttended)
        } else if !enrollment.admitted {
            Some(PolicyViolationReason::NotAdmitted)
        } else {
            None
        };

        match violation {
            Some(reason) => Err(AdmissionError::PolicyViolation(reason)),
            None => Ok((event, enrollment)),
        }
    }

    /// Validates `UpdatePolicy` command
    ///
    /// First come, first served only takes over when the admitted enrollments
    /// are the earliest arrivals.
    fn validate_policy_change(
        event: &Event,
        policy: AdmissionPolicy,
    ) -> Result<(), AdmissionError> {
        if policy == AdmissionPolicy::FirstComeFirstServed
            && event.admission_policy != policy
            && !event.admissions_follow_arrival_order()
        {
            return Err(AdmissionError::PolicyViolation(
                PolicyViolationReason::AdmissionsOutOfOrder,
            ));
        }
        Ok(())
    }

    /// Promotion events for the current state, earliest waiting first
    fn promotions(event: &Event) -> Vec<AdmissionAction> {
        event
            .promotion_candidates()
            .into_iter()
            .filter_map(|id| event.enrollment(id))
            .map(|enrollment| AdmissionAction::EnrollmentPromoted {
                event_id: event.id,
                enrollment_id: enrollment.id,
                account_id: enrollment.account_id,
                summary: format!(
                    "A seat opened up in '{}'; your enrollment is now confirmed",
                    event.title
                ),
            })
            .collect()
    }

    /// Applies an event to state
    fn apply_event(state: &mut AdmissionState, action: &AdmissionAction) {
        match action {
            AdmissionAction::EventCreated {
                event_id,
                study,
                organizer,
                details,
                created_at,
                ..
            } => {
                state.event = Some(Event::new(
                    *event_id,
                    study.clone(),
                    *organizer,
                    details.clone(),
                    *created_at,
                ));
            },
            AdmissionAction::EnrollmentCreated { enrollment, .. } => {
                if let Some(event) = state.event.as_mut() {
                    event.enrollments.push(enrollment.clone());
                }
            },
            AdmissionAction::EnrollmentWithdrawn { enrollment_id, .. } => {
                if let Some(event) = state.event.as_mut() {
                    event.enrollments.retain(|e| e.id != *enrollment_id);
                }
            },
            AdmissionAction::EnrollmentPromoted { enrollment_id, .. } => {
                if let Some(enrollment) = Self::enrollment_mut(state, *enrollment_id) {
                    enrollment.admit();
                    state.last_promoted.push(*enrollment_id);
                    state.promoted_total += 1;
                }
            },
            AdmissionAction::EnrollmentAccepted { enrollment_id, .. } => {
                if let Some(enrollment) = Self::enrollment_mut(state, *enrollment_id) {
                    enrollment.admit();
                }
            },
            AdmissionAction::EnrollmentRejected { enrollment_id, .. } => {
                if let Some(enrollment) = Self::enrollment_mut(state, *enrollment_id) {
                    enrollment.reject();
                }
            },
            AdmissionAction::AttendanceChecked { enrollment_id, .. } => {
                if let Some(enrollment) = Self::enrollment_mut(state, *enrollment_id) {
                    enrollment.mark_attended();
                }
            },
            AdmissionAction::AttendanceCancelled { enrollment_id, .. } => {
                if let Some(enrollment) = Self::enrollment_mut(state, *enrollment_id) {
                    enrollment.mark_absent();
                }
            },
            AdmissionAction::EventCapacityChanged { capacity, .. } => {
                if let Some(event) = state.event.as_mut() {
                    event.capacity = *capacity;
                }
            },
            AdmissionAction::AdmissionPolicyChanged { policy, .. } => {
                if let Some(event) = state.event.as_mut() {
                    event.admission_policy = *policy;
                }
            },
            AdmissionAction::EventDetailsUpdated { details, .. } => {
                if let Some(event) = state.event.as_mut() {
                    event.title.clone_from(&details.title);
                    event.description.clone_from(&details.description);
                    event.enrollment_closes_at = details.enrollment_closes_at;
                    event.starts_at = details.starts_at;
                    event.ends_at = details.ends_at;
                }
            },
            AdmissionAction::EventCancelled { .. } => {
                state.event = None;
            },
            AdmissionAction::PublicationFailed { .. } => {
                state.publication_failures += 1;
            },
            AdmissionAction::ValidationFailed { error } => {
                state.last_error = Some(error.clone());
            },
            // Commands don't modify state
            AdmissionAction::CreateEvent { .. }
            | AdmissionAction::RequestEnrollment { .. }
            | AdmissionAction::WithdrawEnrollment { .. }
            | AdmissionAction::AcceptEnrollment { .. }
            | AdmissionAction::RejectEnrollment { .. }
            | AdmissionAction::CheckIn { .. }
            | AdmissionAction::CancelCheckIn { .. }
            | AdmissionAction::UpdateCapacity { .. }
            | AdmissionAction::UpdatePolicy { .. }
            | AdmissionAction::UpdateEventDetails { .. }
            | AdmissionAction::PromoteWaitlist
            | AdmissionAction::CancelEvent => {},
        }
    }

    fn enrollment_mut(state: &mut AdmissionState, id: EnrollmentId) -> Option<&mut Enrollment> {
        state.event.as_mut().and_then(|event| event.enrollment_mut(id))
    }

    /// Apply events in order, then append and apply any promotions they enable
    fn commit(
        state: &mut AdmissionState,
        mut events: Vec<AdmissionAction>,
        env: &AdmissionEnvironment,
    ) -> Effects {
        for event in &events {
            Self::apply_event(state, event);
        }

        if let Some(event) = state.event.as_ref() {
            let promotions = Self::promotions(event);
            for promotion in &promotions {
                Self::apply_event(state, promotion);
            }
            events.extend(promotions);
        }

        Self::create_effects(events, env)
    }

    fn reject_command(state: &mut AdmissionState, error: AdmissionError) -> Effects {
        tracing::debug!(error = %error, "Command rejected");
        Self::apply_event(state, &AdmissionAction::ValidationFailed { error });
        SmallVec::new()
    }

    #[allow(clippy::too_many_lines)] // One arm per command
    fn handle_command(
        state: &AdmissionState,
        command: AdmissionAction,
        env: &AdmissionEnvironment,
    ) -> Result<Vec<AdmissionAction>, AdmissionError> {
        let events = match command {
            AdmissionAction::CreateEvent {
                event_id,
                study,
                organizer,
                details,
            } => {
                let now = env.clock.now();
                Self::validate_create_event(state, &details, now, &env.limits)?;
                vec![AdmissionAction::EventCreated {
                    event_id,
                    study,
                    organizer,
                    summary: format!("New event '{}' is open for enrollment", details.title),
                    details,
                    created_at: now,
                }]
            },

            AdmissionAction::RequestEnrollment {
                enrollment_id,
                account_id,
                requested_at,
            } => {
                let event = Self::validate_request(state, account_id, requested_at)?;

                // Never earlier than an existing request, so arrival order is waitlist order.
                let enrolled_at = event
                    .latest_enrolled_at()
                    .map_or(requested_at, |latest| latest.max(requested_at));
                let admitted = event.admission_policy == AdmissionPolicy::FirstComeFirstServed
                    && event.capacity.has_room_for_one_more(event.admitted_count());
                let summary = if admitted {
                    format!("You are enrolled in '{}'", event.title)
                } else {
                    format!("Your enrollment in '{}' is waiting for a seat", event.title)
                };

                vec![AdmissionAction::EnrollmentCreated {
                    enrollment: Enrollment::new(
                        enrollment_id,
                        event.id,
                        account_id,
                        enrolled_at,
                        admitted,
                    ),
                    summary,
                }]
            },

            AdmissionAction::WithdrawEnrollment { account_id } => {
                let (event, enrollment) = Self::validate_withdraw(state, account_id)?;
                vec![AdmissionAction::EnrollmentWithdrawn {
                    event_id: event.id,
                    enrollment_id: enrollment.id,
                    account_id,
                    was_admitted: enrollment.admitted,
                    summary: format!("Your enrollment in '{}' was withdrawn", event.title),
                }]
            },

            AdmissionAction::AcceptEnrollment { enrollment_id } => {
                let (event, enrollment) = Self::validate_accept(state, enrollment_id)?;
                vec![AdmissionAction::EnrollmentAccepted {
                    event_id: event.id,
                    enrollment_id,
                    account_id: enrollment.account_id,
                    summary: format!(
                        "Your enrollment in '{}' was accepted; see you there",
                        event.title
                    ),
                }]
            },

            AdmissionAction::RejectEnrollment { enrollment_id } => {
                let (event, enrollment) = Self::validate_reject(state, enrollment_id)?;
                vec![AdmissionAction::EnrollmentRejected {
                    event_id: event.id,
                    enrollment_id,
                    account_id: enrollment.account_id,
                    summary: format!("Your enrollment in '{}' was declined", event.title),
                }]
            },

            AdmissionAction::CheckIn { enrollment_id } => {
                let event = Self::require_event(state)?;
                let enrollment = Self::require_enrollment(event, enrollment_id)?;
                if enrollment.attended {
                    Vec::new()
                } else {
                    vec![AdmissionAction::AttendanceChecked {
                        event_id: event.id,
                        enrollment_id,
                        account_id: enrollment.account_id,
                        summary: format!("Attendance recorded for '{}'", event.title),
                    }]
                }
            },

            AdmissionAction::CancelCheckIn { enrollment_id } => {
                let event = Self::require_event(state)?;
                let enrollment = Self::require_enrollment(event, enrollment_id)?;
                if enrollment.attended {
                    vec![AdmissionAction::AttendanceCancelled {
                        event_id: event.id,
                        enrollment_id,
                        account_id: enrollment.account_id,
                        summary: format!("Attendance for '{}' was withdrawn", event.title),
                    }]
                } else {
                    Vec::new()
                }
            },

            AdmissionAction::UpdateCapacity { capacity } => {
                let event = Self::require_event(state)?;
                validate_capacity_change(event, capacity, &env.limits)?;
                Self::capacity_change(event, capacity).into_iter().collect()
            },

            AdmissionAction::UpdatePolicy { policy } => {
                let event = Self::require_event(state)?;
                Self::validate_policy_change(event, policy)?;
                if event.admission_policy == policy {
                    Vec::new()
                } else {
                    vec![AdmissionAction::AdmissionPolicyChanged {
                        event_id: event.id,
                        previous: event.admission_policy,
                        policy,
                        summary: format!("'{}' now admits {policy}", event.title),
                    }]
                }
            },

            AdmissionAction::UpdateEventDetails { mut details } => {
                let event = Self::require_event(state)?;
                validate_event_update(event, &details, env.clock.now(), &env.limits)?;
                details.admission_policy = event.admission_policy;

                let mut events = vec![AdmissionAction::EventDetailsUpdated {
                    event_id: event.id,
                    summary: format!("Event '{}' was updated", details.title),
                    details: details.clone(),
                }];
                events.extend(Self::capacity_change(event, details.capacity));
                events
            },

            AdmissionAction::PromoteWaitlist => {
                Self::require_event(state)?;
                Vec::new()
            },

            AdmissionAction::CancelEvent => {
                let event = Self::require_event(state)?;
                vec![AdmissionAction::EventCancelled {
                    event_id: event.id,
                    enrollments: event.enrollments.clone(),
                    summary: format!("Event '{}' was cancelled", event.title),
                }]
            },

            // Events never reach here; reduce applies them directly.
            _ => Vec::new(),
        };

        Ok(events)
    }

    fn capacity_change(event: &Event, capacity: Capacity) -> Option<AdmissionAction> {
        (event.capacity != capacity).then(|| AdmissionAction::EventCapacityChanged {
            event_id: event.id,
            previous: event.capacity,
            capacity,
            summary: format!("'{}' now has room for {capacity}", event.title),
        })
    }
}

impl Reducer for AdmissionReducer {
    type State = AdmissionState;
    type Action = AdmissionAction;
    type Environment = AdmissionEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        if !action.is_command() {
            // Events (replay and feedback) are applied as-is.
            Self::apply_event(state, &action);
            return SmallVec::new();
        }

        state.last_error = None;
        state.last_promoted.clear();

        match Self::handle_command(state, action, env) {
            Ok(events) => Self::commit(state, events, env),
            Err(error) => Self::reject_command(state, error),
        }
    }
}
