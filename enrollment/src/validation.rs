//! Event form validation.
//!
//! All field problems are collected and reported together.

use crate::error::{AdmissionError, FieldError};
use crate::types::{Capacity, Event, EventDetails};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounds applied to event forms
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionLimits {
    /// Smallest finite capacity accepted
    pub min_capacity: u32,
    /// Longest title accepted, in characters
    pub max_title_length: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            min_capacity: 1,
            max_title_length: 50,
        }
    }
}

/// Validate the form of a new event
///
/// # Errors
///
/// Returns [`AdmissionError::InvalidDetails`] listing every invalid field.
pub fn validate_new_event(
    details: &EventDetails,
    now: DateTime<Utc>,
    limits: &AdmissionLimits,
) -> Result<(), AdmissionError> {
    let mut errors = Vec::new();
    check_title(&details.title, limits, &mut errors);
    check_capacity(details.capacity, limits, &mut errors);
    check_schedule(details, now, &mut errors);
    finish(errors)
}

/// Validate an edit of an existing event
///
/// The capacity must additionally hold everyone already admitted.
///
/// # Errors
///
/// Returns [`AdmissionError::InvalidDetails`] for form problems and
/// [`AdmissionError::InvalidCapacityChange`] when the capacity is below the
/// admitted count.
pub fn validate_event_update(
    event: &Event,
    details: &EventDetails,
    now: DateTime<Utc>,
    limits: &AdmissionLimits,
) -> Result<(), AdmissionError> {
    let mut errors = Vec::new();
    check_title(&details.title, limits, &mut errors);
    check_capacity(details.capacity, limits, &mut errors);
    check_schedule(details, now, &mut errors);
    finish(errors)?;
    validate_capacity_change(event, details.capacity, limits)
}

/// Validate a capacity change on its own
///
/// # Errors
///
/// Returns [`AdmissionError::InvalidDetails`] when the capacity is below the
/// configured minimum and [`AdmissionError::InvalidCapacityChange`] when it
/// cannot hold the admitted enrollments.
pub fn validate_capacity_change(
    event: &Event,
    capacity: Capacity,
    limits: &AdmissionLimits,
) -> Result<(), AdmissionError> {
    let mut errors = Vec::new();
    check_capacity(capacity, limits, &mut errors);
    finish(errors)?;

    let admitted = event.admitted_count();
    if !capacity.can_hold(admitted) {
        return Err(AdmissionError::InvalidCapacityChange {
            requested: capacity,
            admitted,
        });
    }
    Ok(())
}

fn check_title(title: &str, limits: &AdmissionLimits, errors: &mut Vec<FieldError>) {
    if title.trim().is_empty() {
        errors.push(FieldError::new("title", "must not be blank"));
    } else if title.chars().count() > limits.max_title_length {
        errors.push(FieldError::new(
            "title",
            format!("must be at most {} characters", limits.max_title_length),
        ));
    }
}

fn check_capacity(capacity: Capacity, limits: &AdmissionLimits, errors: &mut Vec<FieldError>) {
    if let Capacity::Limited(limit) = capacity {
        if limit < limits.min_capacity.max(1) {
            errors.push(FieldError::new(
                "capacity",
                format!("must be at least {}", limits.min_capacity.max(1)),
            ));
        }
    }
}

fn check_schedule(details: &EventDetails, now: DateTime<Utc>, errors: &mut Vec<FieldError>) {
    if details.enrollment_closes_at < now {
        errors.push(FieldError::new("enrollment_closes_at", "must not be in the past"));
    }
    if details.starts_at < now {
        errors.push(FieldError::new("starts_at", "must not be in the past"));
    }
    if details.ends_at < now {
        errors.push(FieldError::new("ends_at", "must not be in the past"));
    }
    if details.ends_at < details.starts_at {
        errors.push(FieldError::new("ends_at", "must not be before starts_at"));
    }
    if details.ends_at < details.enrollment_closes_at {
        errors.push(FieldError::new("ends_at", "must not be before enrollment_closes_at"));
    }
}

fn finish(errors: Vec<FieldError>) -> Result<(), AdmissionError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AdmissionError::InvalidDetails(errors))
    }
}
