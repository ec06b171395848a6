//! Study Hub enrollment admission engine.
//!
//! Members request a seat at a study group's gathering; the engine decides who
//! is admitted and who waits, keeps the waitlist in arrival order, and promotes
//! waiting members when room frees up.
//!
//! # Architecture
//!
//! ```text
//!  AdmissionService ──► Store (one per event) ──► AdmissionReducer
//!                            │  (write lock: validate, decide, apply)
//!                            ▼
//!                     EventBus (commit order)
//!                            │
//!                            ▼
//!                   EnrollmentNotifier ──► NotificationSink
//! ```
//!
//! # Admission policies
//!
//! - **First come, first served**: requests are admitted while capacity
//!   remains. Later requests wait and are promoted, earliest first, whenever a
//!   withdrawal, a capacity increase or a policy switch frees a seat.
//! - **Organizer confirmed**: every request waits for an organizer to accept
//!   it. Rejecting an admitted enrollment never promotes anyone.
//!
//! A rejected command leaves the event untouched and publishes nothing.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregates;
pub mod config;
pub mod error;
pub mod notifier;
pub mod service;
pub mod types;
pub mod validation;

pub use aggregates::{AdmissionAction, AdmissionEnvironment, AdmissionReducer, AdmissionState};
pub use config::{Config, ConfigError};
pub use error::{
    AdmissionError, FieldError, NotEnrollableReason, NotWithdrawableReason, PolicyViolationReason,
};
pub use notifier::{
    Channel, DeliveryError, EnrollmentNotifier, InMemoryPreferences, Notification,
    NotificationKind, NotificationPreferences, NotificationSink, NotifierHandle, NotifierStats,
    TracingNotificationSink,
};
pub use service::{AdmissionService, AdmissionStore, ServiceError};
pub use types::{
    AccountId, AdmissionPolicy, Capacity, Enrollment, EnrollmentId, Event, EventDetails, EventId,
};
pub use validation::AdmissionLimits;
