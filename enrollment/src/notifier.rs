//! Enrollment notifications.
//!
//! The notifier subscribes to the enrollment topic, decodes each domain event
//! and turns it into [`Notification`]s for the affected accounts. Delivery
//! goes through a [`NotificationSink`] on every channel the recipient has
//! enabled. Failures are logged and counted; they never reach the admission
//! engine, which has already committed by the time an event is published.

use crate::aggregates::AdmissionAction;
use crate::types::{AccountId, EventId};
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use studyhub_core::event::SerializedEvent;
use studyhub_core::event_bus::{EventBus, EventBusError, EventStream};
use studyhub_runtime::RetryPolicy;
use studyhub_runtime::retry::retry_with_predicate;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ============================================================================
// Notifications
// ============================================================================

/// What a notification is about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// A new event opened for enrollment
    EventCreated,
    /// The request was admitted immediately
    Enrolled,
    /// The request is waiting for a seat
    Waitlisted,
    /// The enrollment was withdrawn
    Withdrawn,
    /// A waiting enrollment was admitted automatically
    Promoted,
    /// An organizer admitted the enrollment
    Accepted,
    /// An organizer revoked the admission
    Rejected,
    /// Attendance was recorded
    AttendanceChecked,
    /// Attendance was withdrawn
    AttendanceCancelled,
    /// The capacity changed
    CapacityChanged,
    /// The admission policy changed
    PolicyChanged,
    /// Title, description or schedule changed
    DetailsUpdated,
    /// The event was cancelled
    EventCancelled,
}

/// Where a notification is shown
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// In-app notification list
    Web,
    /// Email
    Email,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Web => write!(f, "web"),
            Self::Email => write!(f, "email"),
        }
    }
}

/// A message for one account, or for the whole study when `recipient` is `None`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    /// Account to notify
    pub recipient: Option<AccountId>,
    /// Event concerned
    pub event_id: EventId,
    /// What happened
    pub kind: NotificationKind,
    /// Human-readable text
    pub summary: String,
}

impl Notification {
    fn to(recipient: AccountId, event_id: EventId, kind: NotificationKind, summary: &str) -> Self {
        Self {
            recipient: Some(recipient),
            event_id,
            kind,
            summary: summary.to_string(),
        }
    }

    fn study_wide(event_id: EventId, kind: NotificationKind, summary: &str) -> Self {
        Self {
            recipient: None,
            event_id,
            kind,
            summary: summary.to_string(),
        }
    }

    /// Notifications caused by one domain event
    ///
    /// Commands and bookkeeping actions produce none.
    #[must_use]
    pub fn from_action(action: &AdmissionAction) -> Vec<Self> {
        use NotificationKind as Kind;

        match action {
            AdmissionAction::EventCreated { event_id, summary, .. } => {
                vec![Self::study_wide(*event_id, Kind::EventCreated, summary)]
            },
            AdmissionAction::EnrollmentCreated { enrollment, summary } => {
                let kind = if enrollment.admitted { Kind::Enrolled } else { Kind::Waitlisted };
                vec![Self::to(enrollment.account_id, enrollment.event_id, kind, summary)]
            },
            AdmissionAction::EnrollmentWithdrawn { event_id, account_id, summary, .. } => {
                vec![Self::to(*account_id, *event_id, Kind::Withdrawn, summary)]
            },
            AdmissionAction::EnrollmentPromoted { event_id, account_id, summary, .. } => {
                vec![Self::to(*account_id, *event_id, Kind::Promoted, summary)]
            },
            AdmissionAction::EnrollmentAccepted { event_id, account_id, summary, .. } => {
                vec![Self::to(*account_id, *event_id, Kind::Accepted, summary)]
            },
            AdmissionAction::EnrollmentRejected { event_id, account_id, summary, .. } => {
                vec![Self::to(*account_id, *event_id, Kind::Rejected, summary)]
            },
            AdmissionAction::AttendanceChecked { event_id, account_id, summary, .. } => {
                vec![Self::to(*account_id, *event_id, Kind::AttendanceChecked, summary)]
            },
            AdmissionAction::AttendanceCancelled { event_id, account_id, summary, .. } => {
                vec![Self::to(*account_id, *event_id, Kind::AttendanceCancelled, summary)]
            },
            AdmissionAction::EventCapacityChanged { event_id, summary, .. } => {
                vec![Self::study_wide(*event_id, Kind::CapacityChanged, summary)]
            },
            AdmissionAction::AdmissionPolicyChanged { event_id, summary, .. } => {
                vec![Self::study_wide(*event_id, Kind::PolicyChanged, summary)]
            },
            AdmissionAction::EventDetailsUpdated { event_id, summary, .. } => {
                vec![Self::study_wide(*event_id, Kind::DetailsUpdated, summary)]
            },
            AdmissionAction::EventCancelled { event_id, enrollments, summary } => enrollments
                .iter()
                .map(|e| Self::to(e.account_id, *event_id, Kind::EventCancelled, summary))
                .collect(),
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// Preferences
// ============================================================================

/// Per-account channel settings
pub trait NotificationPreferences: Send + Sync {
    /// Channels `account` receives enrollment notifications on
    fn channels_for(&self, account: AccountId) -> Vec<Channel>;

    /// Channels for notifications addressed to the whole study
    fn study_channels(&self) -> Vec<Channel> {
        vec![Channel::Web]
    }
}

/// Preferences held in memory; accounts without an entry get the default
pub struct InMemoryPreferences {
    default: Vec<Channel>,
    accounts: RwLock<HashMap<AccountId, Vec<Channel>>>,
}

impl Default for InMemoryPreferences {
    fn default() -> Self {
        Self::with_default(vec![Channel::Web])
    }
}

impl InMemoryPreferences {
    /// Preferences where unknown accounts get `default`
    #[must_use]
    pub fn with_default(default: Vec<Channel>) -> Self {
        Self {
            default,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Set the channels for one account; an empty list mutes it
    pub fn set(&self, account: AccountId, channels: Vec<Channel>) {
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account, channels);
    }
}

impl NotificationPreferences for InMemoryPreferences {
    fn channels_for(&self, account: AccountId) -> Vec<Channel> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&account)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Delivery failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth retrying (timeouts, unavailable backends)
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Retrying will not help (unknown address, rejected content)
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    /// Whether a retry may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Delivers notifications on one channel at a time
pub trait NotificationSink: Send + Sync {
    /// Deliver `notification` on `channel`
    fn deliver(
        &self,
        channel: Channel,
        notification: &Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>>;
}

/// Sink that writes notifications to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn deliver(
        &self,
        channel: Channel,
        notification: &Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>> {
        tracing::info!(
            %channel,
            recipient = ?notification.recipient,
            event_id = %notification.event_id,
            kind = ?notification.kind,
            summary = %notification.summary,
            "Notification"
        );
        Box::pin(async { Ok(()) })
    }
}

// ============================================================================
// Notifier task
// ============================================================================

/// Counters reported when the notifier stops
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotifierStats {
    /// Domain events received
    pub received: u64,
    /// Deliveries that succeeded (one per channel)
    pub delivered: u64,
    /// Deliveries that failed after retries
    pub failed: u64,
    /// Notifications with no enabled channel
    pub skipped: u64,
    /// Events that could not be decoded
    pub undecodable: u64,
    /// Events lost because the subscriber lagged
    pub lagged: u64,
}

/// Consumes enrollment events and delivers notifications
pub struct EnrollmentNotifier {
    event_bus: Arc<dyn EventBus>,
    topic: String,
    sink: Arc<dyn NotificationSink>,
    preferences: Arc<dyn NotificationPreferences>,
    retry_policy: RetryPolicy,
}

impl EnrollmentNotifier {
    /// Create a notifier with default preferences and retry policy
    #[must_use]
    pub fn new(
        event_bus: Arc<dyn EventBus>,
        topic: impl Into<String>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            event_bus,
            topic: topic.into(),
            sink,
            preferences: Arc::new(InMemoryPreferences::default()),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Use these preferences
    #[must_use]
    pub fn with_preferences(mut self, preferences: Arc<dyn NotificationPreferences>) -> Self {
        self.preferences = preferences;
        self
    }

    /// Retry transient delivery failures with this policy
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Subscribe and spawn the delivery task
    ///
    /// The subscription exists when this returns, so every event published
    /// afterwards is seen.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the subscription fails.
    pub async fn start(self) -> Result<NotifierHandle, EventBusError> {
        let stream = self.event_bus.subscribe(&[self.topic.as_str()]).await?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tracing::info!(topic = %self.topic, "Enrollment notifier started");
        let task = tokio::spawn(self.run(stream, shutdown_rx));

        Ok(NotifierHandle {
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn run(
        self,
        mut stream: EventStream,
        mut shutdown: broadcast::Receiver<()>,
    ) -> NotifierStats {
        let mut stats = NotifierStats::default();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    // Deliver what is already buffered, then stop.
                    while let Some(Some(item)) = stream.next().now_or_never() {
                        self.handle(item, &mut stats).await;
                    }
                    break;
                }
                item = stream.next() => match item {
                    Some(item) => self.handle(item, &mut stats).await,
                    None => {
                        tracing::warn!(topic = %self.topic, "Event stream ended");
                        break;
                    },
                },
            }
        }

        tracing::info!(?stats, "Enrollment notifier stopped");
        stats
    }

    async fn handle(
        &self,
        item: Result<SerializedEvent, EventBusError>,
        stats: &mut NotifierStats,
    ) {
        let serialized = match item {
            Ok(serialized) => serialized,
            Err(EventBusError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Notifier lagged behind the event bus");
                stats.lagged += skipped;
                return;
            },
            Err(error) => {
                tracing::error!(error = %error, "Event stream error");
                return;
            },
        };

        stats.received += 1;

        let action: AdmissionAction = match serialized.decode() {
            Ok(action) => action,
            Err(error) => {
                tracing::warn!(
                    event_type = %serialized.event_type,
                    error = %error,
                    "Undecodable event"
                );
                stats.undecodable += 1;
                return;
            },
        };

        for notification in Notification::from_action(&action) {
            let channels = notification.recipient.map_or_else(
                || self.preferences.study_channels(),
                |a| self.preferences.channels_for(a),
            );

            if channels.is_empty() {
                stats.skipped += 1;
                continue;
            }

            for channel in channels {
                let result = retry_with_predicate(
                    &self.retry_policy,
                    "notify",
                    || self.sink.deliver(channel, &notification),
                    DeliveryError::is_transient,
                )
                .await;

                match result {
                    Ok(()) => {
                        stats.delivered += 1;
                        metrics::counter!(
                            "notifier.notifications.sent",
                            "channel" => channel.to_string()
                        )
                        .increment(1);
                    },
                    Err(error) => {
                        stats.failed += 1;
                        metrics::counter!(
                            "notifier.notifications.failed",
                            "channel" => channel.to_string()
                        )
                        .increment(1);
                        tracing::warn!(
                            %channel,
                            kind = ?notification.kind,
                            error = %error,
                            "Notification dropped"
                        );
                    },
                }
            }
        }
    }
}

/// Handle to a running notifier
pub struct NotifierHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<NotifierStats>,
}

impl NotifierHandle {
    /// Signal shutdown and wait for the task to finish
    ///
    /// Events already buffered in the subscription are delivered first.
    pub async fn stop(self) -> NotifierStats {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(stats) => stats,
            Err(error) => {
                tracing::error!(error = %error, "Notifier task failed");
                NotifierStats::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Enrollment, EnrollmentId};
    use chrono::{DateTime, Utc};

    #[test]
    fn enrollment_created_notifies_by_outcome() {
        let event_id = EventId::new();
        let account = AccountId::new();
        let waiting = AdmissionAction::EnrollmentCreated {
            enrollment: Enrollment::new(
                EnrollmentId::new(),
                event_id,
                account,
                DateTime::<Utc>::UNIX_EPOCH,
                false,
            ),
            summary: "waiting".to_string(),
        };

        assert_eq!(
            Notification::from_action(&waiting),
            vec![Notification {
                recipient: Some(account),
                event_id,
                kind: NotificationKind::Waitlisted,
                summary: "waiting".to_string(),
            }]
        );
    }

    #[test]
    fn cancellation_notifies_every_enrolled_account() {
        let event_id = EventId::new();
        let enrollments: Vec<Enrollment> = (0..3)
            .map(|_| {
                Enrollment::new(
                    EnrollmentId::new(),
                    event_id,
                    AccountId::new(),
                    DateTime::<Utc>::UNIX_EPOCH,
                    true,
                )
            })
            .collect();
        let action = AdmissionAction::EventCancelled {
            event_id,
            enrollments: enrollments.clone(),
            summary: "cancelled".to_string(),
        };

        let recipients: Vec<_> = Notification::from_action(&action)
            .into_iter()
            .map(|n| n.recipient)
            .collect();
        assert_eq!(recipients, enrollments.iter().map(|e| Some(e.account_id)).collect::<Vec<_>>());
    }

    #[test]
    fn commands_produce_no_notifications() {
        assert!(Notification::from_action(&AdmissionAction::PromoteWaitlist).is_empty());
    }

    #[test]
    fn preferences_fall_back_to_default() {
        let preferences = InMemoryPreferences::default();
        let muted = AccountId::new();
        preferences.set(muted, Vec::new());

        assert_eq!(preferences.channels_for(AccountId::new()), vec![Channel::Web]);
        assert!(preferences.channels_for(muted).is_empty());
    }
}
