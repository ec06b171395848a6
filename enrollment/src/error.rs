//! Admission errors.
//!
//! Every variant is decided before any state is touched, so an operation that
//! returns one of these left the event exactly as it was.

use crate::types::Capacity;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why an enrollment request was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotEnrollableReason {
    /// The request arrived at or after the enrollment deadline
    EnrollmentClosed,
    /// The account already holds a live enrollment
    AlreadyEnrolled,
}

/// Why a withdrawal was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotWithdrawableReason {
    /// The account holds no live enrollment
    NotEnrolled,
    /// The enrollment has already been checked in
    AlreadyAttended,
}

/// Why a manual organizer decision was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyViolationReason {
    /// Manual decisions are only possible under organizer confirmation
    NotOrganizerConfirmed,
    /// No capacity left to accept another enrollment
    CapacityFull,
    /// The enrollment is already admitted
    AlreadyAdmitted,
    /// The enrollment is not admitted, so there is nothing to reject
    NotAdmitted,
    /// The enrollment has already been checked in
    AlreadyAttended,
    /// An earlier enrollment waits while a later one is admitted, so first
    /// come, first served cannot take over
    AdmissionsOutOfOrder,
}

/// A single invalid field of an event form
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Field name
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl FieldError {
    /// Create a field error
    #[must_use]
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors returned by admission operations
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionError {
    /// No event with this id exists (or it was cancelled)
    #[error("event not found")]
    EventNotFound,

    /// An event with this id already exists
    #[error("event already exists")]
    EventAlreadyExists,

    /// The enrollment does not belong to this event
    #[error("enrollment not found")]
    EnrollmentNotFound,

    /// The enrollment request was refused
    #[error("not enrollable: {0:?}")]
    NotEnrollable(NotEnrollableReason),

    /// The withdrawal was refused
    #[error("not withdrawable: {0:?}")]
    NotWithdrawable(NotWithdrawableReason),

    /// A manual organizer decision was refused
    #[error("policy violation: {0:?}")]
    PolicyViolation(PolicyViolationReason),

    /// The new capacity cannot hold the enrollments already admitted
    #[error("capacity {requested} cannot hold {admitted} admitted enrollments")]
    InvalidCapacityChange {
        /// Requested capacity
        requested: Capacity,
        /// Enrollments admitted at the time of the request
        admitted: usize,
    },

    /// The event form is invalid
    #[error("invalid event details: {}", join_fields(.0))]
    InvalidDetails(Vec<FieldError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_reason() {
        let error = AdmissionError::PolicyViolation(PolicyViolationReason::CapacityFull);
        assert_eq!(error.to_string(), "policy violation: CapacityFull");

        let error = AdmissionError::InvalidCapacityChange {
            requested: Capacity::limited(1),
            admitted: 3,
        };
        assert_eq!(error.to_string(), "capacity 1 cannot hold 3 admitted enrollments");
    }

    #[test]
    fn invalid_details_lists_every_field() {
        let error = AdmissionError::InvalidDetails(vec![
            FieldError::new("title", "must not be blank"),
            FieldError::new("ends_at", "must not be before starts_at"),
        ]);
        assert_eq!(
            error.to_string(),
            "invalid event details: title: must not be blank; ends_at: must not be before starts_at"
        );
    }
}
