//! Domain types for enrollment admission.
//!
//! An [`Event`] is a gathering organized by a study group. It owns its
//! [`Enrollment`]s by value, ordered by `enrolled_at`; that order is the
//! waitlist priority. Enrollments refer back to their event by [`EventId`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an event (a gathering)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random `EventId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `EventId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a member account
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Creates a new random `AccountId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `AccountId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one admission request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnrollmentId(Uuid);

impl EnrollmentId {
    /// Creates a new random `EnrollmentId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `EnrollmentId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EnrollmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnrollmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Value Objects
// ============================================================================

/// How many enrollments an event may admit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capacity {
    /// At most this many admitted enrollments
    Limited(u32),
    /// No upper bound
    Unlimited,
}

impl Capacity {
    /// A finite capacity
    #[must_use]
    pub const fn limited(limit: u32) -> Self {
        Self::Limited(limit)
    }

    /// The finite limit, or `None` when unlimited
    #[must_use]
    pub const fn limit(&self) -> Option<u32> {
        match self {
            Self::Limited(limit) => Some(*limit),
            Self::Unlimited => None,
        }
    }

    /// Whether one more enrollment fits next to `admitted` admitted ones
    #[must_use]
    pub fn has_room_for_one_more(&self, admitted: usize) -> bool {
        self.free_slots(admitted) > 0
    }

    /// `max(0, limit - admitted)`; `usize::MAX` when unlimited
    #[must_use]
    pub fn free_slots(&self, admitted: usize) -> usize {
        match self {
            Self::Limited(limit) => usize::try_from(*limit)
                .unwrap_or(usize::MAX)
                .saturating_sub(admitted),
            Self::Unlimited => usize::MAX,
        }
    }

    /// Whether this capacity can hold `admitted` admitted enrollments
    #[must_use]
    pub fn can_hold(&self, admitted: usize) -> bool {
        match self {
            Self::Limited(limit) => usize::try_from(*limit).map_or(true, |limit| admitted <= limit),
            Self::Unlimited => true,
        }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(limit) => write!(f, "{limit}"),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// How requests become admitted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionPolicy {
    /// Admitted immediately while capacity remains; later requests wait and are
    /// promoted automatically as room frees up
    #[default]
    FirstComeFirstServed,
    /// Every request waits for an organizer decision
    OrganizerConfirmed,
}

impl fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstComeFirstServed => write!(f, "first come, first served"),
            Self::OrganizerConfirmed => write!(f, "organizer confirmed"),
        }
    }
}

/// Organizer-editable description of an event
///
/// Used to create an event and to edit one. On edit the admission policy of
/// the existing event is kept; use a policy change to switch it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetails {
    /// Short title
    pub title: String,
    /// Free-form description
    pub description: String,
    /// Admission policy
    pub admission_policy: AdmissionPolicy,
    /// Admission capacity
    pub capacity: Capacity,
    /// Requests at or after this instant are refused
    pub enrollment_closes_at: DateTime<Utc>,
    /// Start of the gathering
    pub starts_at: DateTime<Utc>,
    /// End of the gathering
    pub ends_at: DateTime<Utc>,
}

// ============================================================================
// Entities
// ============================================================================

/// One account's request to join one event
///
/// The flag flips carry no validation; whether a flip is legal is decided by
/// the admission reducer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// Enrollment identifier
    pub id: EnrollmentId,
    /// Event this enrollment belongs to
    pub event_id: EventId,
    /// Requesting account
    pub account_id: AccountId,
    /// When the request was made; never changes
    pub enrolled_at: DateTime<Utc>,
    /// Holds a seat
    pub admitted: bool,
    /// Checked in on the day
    pub attended: bool,
}

impl Enrollment {
    /// Create a new enrollment that has not attended yet
    #[must_use]
    pub const fn new(
        id: EnrollmentId,
        event_id: EventId,
        account_id: AccountId,
        enrolled_at: DateTime<Utc>,
        admitted: bool,
    ) -> Self {
        Self {
            id,
            event_id,
            account_id,
            enrolled_at,
            admitted,
            attended: false,
        }
    }

    /// Mark as admitted
    pub fn admit(&mut self) {
        self.admitted = true;
    }

    /// Mark as not admitted
    pub fn reject(&mut self) {
        self.admitted = false;
    }

    /// Mark as attended
    pub fn mark_attended(&mut self) {
        self.attended = true;
    }

    /// Mark as not attended
    pub fn mark_absent(&mut self) {
        self.attended = false;
    }
}

/// A gathering with capacity, admission policy and ordered enrollments
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier
    pub id: EventId,
    /// Owning study group (opaque path)
    pub study: String,
    /// Organizer who created the event
    pub created_by: AccountId,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Admission policy
    pub admission_policy: AdmissionPolicy,
    /// Admission capacity
    pub capacity: Capacity,
    /// Requests at or after this instant are refused
    pub enrollment_closes_at: DateTime<Utc>,
    /// Start of the gathering
    pub starts_at: DateTime<Utc>,
    /// End of the gathering
    pub ends_at: DateTime<Utc>,
    /// Enrollments in `enrolled_at` order
    pub enrollments: Vec<Enrollment>,
}

impl Event {
    /// Create an event without enrollments
    #[must_use]
    pub fn new(
        id: EventId,
        study: String,
        created_by: AccountId,
        details: EventDetails,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            study,
            created_by,
            created_at,
            title: details.title,
            description: details.description,
            admission_policy: details.admission_policy,
            capacity: details.capacity,
            enrollment_closes_at: details.enrollment_closes_at,
            starts_at: details.starts_at,
            ends_at: details.ends_at,
            enrollments: Vec::new(),
        }
    }

    /// The organizer-editable part of this event
    #[must_use]
    pub fn details(&self) -> EventDetails {
        EventDetails {
            title: self.title.clone(),
            description: self.description.clone(),
            admission_policy: self.admission_policy,
            capacity: self.capacity,
            enrollment_closes_at: self.enrollment_closes_at,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
        }
    }

    /// Number of admitted enrollments
    #[must_use]
    pub fn admitted_count(&self) -> usize {
        self.enrollments.iter().filter(|e| e.admitted).count()
    }

    /// Signed `capacity - admitted`; `None` when unlimited
    #[must_use]
    pub fn remaining_slots(&self) -> Option<i64> {
        let admitted = i64::try_from(self.admitted_count()).unwrap_or(i64::MAX);
        self.capacity.limit().map(|limit| i64::from(limit) - admitted)
    }

    /// Waiting enrollments in priority order
    #[must_use]
    pub fn waitlist(&self) -> Vec<&Enrollment> {
        self.enrollments.iter().filter(|e| !e.admitted).collect()
    }

    /// Live enrollment of `account`
    #[must_use]
    pub fn enrollment_for(&self, account: AccountId) -> Option<&Enrollment> {
        self.enrollments.iter().find(|e| e.account_id == account)
    }

    /// Enrollment by id
    #[must_use]
    pub fn enrollment(&self, id: EnrollmentId) -> Option<&Enrollment> {
        self.enrollments.iter().find(|e| e.id == id)
    }

    pub(crate) fn enrollment_mut(&mut self, id: EnrollmentId) -> Option<&mut Enrollment> {
        self.enrollments.iter_mut().find(|e| e.id == id)
    }

    /// Latest `enrolled_at` among live enrollments
    #[must_use]
    pub fn latest_enrolled_at(&self) -> Option<DateTime<Utc>> {
        self.enrollments.iter().map(|e| e.enrolled_at).max()
    }

    /// Whether `account` may request enrollment at `now`
    #[must_use]
    pub fn is_enrollable(&self, account: AccountId, now: DateTime<Utc>) -> bool {
        now < self.enrollment_closes_at && self.enrollment_for(account).is_none()
    }

    /// Whether `account` has an enrollment it can withdraw
    #[must_use]
    pub fn is_withdrawable(&self, account: AccountId) -> bool {
        self.enrollment_for(account).is_some_and(|e| !e.attended)
    }

    /// Whether `account` has checked in
    #[must_use]
    pub fn is_attended(&self, account: AccountId) -> bool {
        self.enrollment_for(account).is_some_and(|e| e.attended)
    }

    /// Whether an organizer may accept this enrollment now
    #[must_use]
    pub fn is_acceptable(&self, id: EnrollmentId) -> bool {
        self.admission_policy == AdmissionPolicy::OrganizerConfirmed
            && self.capacity.has_room_for_one_more(self.admitted_count())
            && self.enrollment(id).is_some_and(|e| !e.admitted && !e.attended)
    }

    /// Whether an organizer may reject this enrollment now
    #[must_use]
    pub fn is_rejectable(&self, id: EnrollmentId) -> bool {
        self.admission_policy == AdmissionPolicy::OrganizerConfirmed
            && self.enrollment(id).is_some_and(|e| e.admitted && !e.attended)
    }

    /// Whether the admitted enrollments are the earliest arrivals
    ///
    /// Enrollments are kept in arrival order, so this holds when no waiting
    /// enrollment precedes an admitted one.
    #[must_use]
    pub fn admissions_follow_arrival_order(&self) -> bool {
        self.enrollments
            .iter()
            .skip_while(|e| e.admitted)
            .all(|e| !e.admitted)
    }

    /// Waiting enrollments that fit into the free capacity, earliest first
    ///
    /// Empty unless the policy is first come, first served.
    #[must_use]
    pub fn promotion_candidates(&self) -> Vec<EnrollmentId> {
        if self.admission_policy != AdmissionPolicy::FirstComeFirstServed {
            return Vec::new();
        }

        let free = self.capacity.free_slots(self.admitted_count());
        self.enrollments
            .iter()
            .filter(|e| !e.admitted)
            .take(free)
            .map(|e| e.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(minutes)
    }

    fn event(policy: AdmissionPolicy, capacity: Capacity) -> Event {
        Event::new(
            EventId::new(),
            "rust-study".to_string(),
            AccountId::new(),
            EventDetails {
                title: "Ownership deep dive".to_string(),
                description: String::new(),
                admission_policy: policy,
                capacity,
                enrollment_closes_at: at(100),
                starts_at: at(200),
                ends_at: at(300),
            },
            at(0),
        )
    }

    fn enroll(event: &mut Event, minute: i64, admitted: bool) -> EnrollmentId {
        let enrollment = Enrollment::new(
            EnrollmentId::new(),
            event.id,
            AccountId::new(),
            at(minute),
            admitted,
        );
        let id = enrollment.id;
        event.enrollments.push(enrollment);
        id
    }

    #[test]
    fn capacity_free_slots() {
        assert_eq!(Capacity::limited(3).free_slots(1), 2);
        assert_eq!(Capacity::limited(3).free_slots(5), 0);
        assert_eq!(Capacity::Unlimited.free_slots(1_000), usize::MAX);
        assert!(Capacity::limited(2).can_hold(2));
        assert!(!Capacity::limited(2).can_hold(3));
    }

    #[test]
    fn remaining_slots_is_signed_and_none_when_unlimited() {
        let mut limited = event(AdmissionPolicy::FirstComeFirstServed, Capacity::limited(2));
        enroll(&mut limited, 1, true);
        assert_eq!(limited.remaining_slots(), Some(1));

        let unlimited = event(AdmissionPolicy::FirstComeFirstServed, Capacity::Unlimited);
        assert_eq!(unlimited.remaining_slots(), None);
    }

    #[test]
    fn promotion_candidates_are_the_earliest_waiting() {
        let mut ev = event(AdmissionPolicy::FirstComeFirstServed, Capacity::limited(3));
        enroll(&mut ev, 1, true);
        let first_waiting = enroll(&mut ev, 2, false);
        let second_waiting = enroll(&mut ev, 3, false);
        enroll(&mut ev, 4, false);

        assert_eq!(ev.promotion_candidates(), vec![first_waiting, second_waiting]);
    }

    #[test]
    fn organizer_confirmed_never_has_promotion_candidates() {
        let mut ev = event(AdmissionPolicy::OrganizerConfirmed, Capacity::limited(3));
        enroll(&mut ev, 1, false);
        assert!(ev.promotion_candidates().is_empty());
    }

    #[test]
    fn admissions_out_of_arrival_order_are_detected() {
        let mut ev = event(AdmissionPolicy::OrganizerConfirmed, Capacity::limited(2));
        assert!(ev.admissions_follow_arrival_order());

        enroll(&mut ev, 1, true);
        enroll(&mut ev, 2, false);
        assert!(ev.admissions_follow_arrival_order());

        enroll(&mut ev, 3, true);
        assert!(!ev.admissions_follow_arrival_order());
    }

    #[test]
    fn tied_arrivals_are_ordered_by_request() {
        let mut ev = event(AdmissionPolicy::OrganizerConfirmed, Capacity::limited(2));
        enroll(&mut ev, 1, false);
        enroll(&mut ev, 1, true);
        assert!(!ev.admissions_follow_arrival_order());
    }

    #[test]
    fn eligibility_queries() {
        let mut ev = event(AdmissionPolicy::OrganizerConfirmed, Capacity::limited(1));
        let waiting = enroll(&mut ev, 1, false);
        let account = ev.enrollments[0].account_id;

        assert!(!ev.is_enrollable(account, at(50)));
        assert!(ev.is_enrollable(AccountId::new(), at(50)));
        assert!(!ev.is_enrollable(AccountId::new(), at(100)));
        assert!(ev.is_withdrawable(account));
        assert!(ev.is_acceptable(waiting));
        assert!(!ev.is_rejectable(waiting));

        ev.enrollments[0].mark_attended();
        assert!(ev.is_attended(account));
        assert!(!ev.is_withdrawable(account));
        assert!(!ev.is_acceptable(waiting));
    }
}
