//! Aggregate reducers for enrollment admission.
//!
//! - Admission: one event, its capacity, policy and enrollments

pub mod admission;

pub use admission::{AdmissionAction, AdmissionEnvironment, AdmissionReducer, AdmissionState};
