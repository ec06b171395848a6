//! End-to-end admission scenarios through `AdmissionService`.
//!
//! Every test runs against a `RecordingEventBus`, so it can check both the
//! resulting event state and exactly which domain events were published.

// Test code can use unwrap/expect
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use studyhub_core::environment::Clock;
use studyhub_core::event_bus::EventBus;
use studyhub_enrollment::{
    AccountId, AdmissionAction, AdmissionError, AdmissionPolicy, AdmissionService, Capacity, Config,
    EventDetails, EventId, NotEnrollableReason, NotWithdrawableReason, PolicyViolationReason,
    ServiceError,
};
use studyhub_testing::{RecordingEventBus, test_clock};

fn now() -> DateTime<Utc> {
    test_clock().now()
}

fn details(policy: AdmissionPolicy, capacity: Capacity) -> EventDetails {
    EventDetails {
        title: "Rust study night".to_string(),
        description: "Traits and generics".to_string(),
        admission_policy: policy,
        capacity,
        enrollment_closes_at: now() + Duration::days(1),
        starts_at: now() + Duration::days(2),
        ends_at: now() + Duration::days(2) + Duration::hours(3),
    }
}

fn setup() -> (AdmissionService, Arc<RecordingEventBus>) {
    let bus = Arc::new(RecordingEventBus::new());
    let service = AdmissionService::new(
        Arc::new(test_clock()),
        Arc::clone(&bus) as Arc<dyn EventBus>,
    );
    (service, bus)
}

async fn open_event(
    service: &AdmissionService,
    policy: AdmissionPolicy,
    capacity: Capacity,
) -> EventId {
    service
        .create_event("rust-study", AccountId::new(), details(policy, capacity))
        .await
        .expect("event is valid")
}

async fn admitted(service: &AdmissionService, event_id: EventId) -> Vec<AccountId> {
    service
        .event(event_id)
        .await
        .unwrap()
        .enrollments
        .iter()
        .filter(|e| e.admitted)
        .map(|e| e.account_id)
        .collect()
}

async fn waiting(service: &AdmissionService, event_id: EventId) -> Vec<AccountId> {
    service
        .waitlist(event_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.account_id)
        .collect()
}

fn admission_error(result: Result<impl std::fmt::Debug, ServiceError>) -> AdmissionError {
    match result {
        Err(ServiceError::Admission(error)) => error,
        other => panic!("expected an admission error, got {other:?}"),
    }
}

/// Capacity 2, first come first served: A and B are admitted, C waits.
/// When A withdraws, C is promoted.
#[tokio::test]
async fn test_withdrawal_promotes_earliest_waiting() {
    let (service, bus) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::FirstComeFirstServed,
        Capacity::limited(2),
    )
    .await;
    let (a, b, c) = (AccountId::new(), AccountId::new(), AccountId::new());

    for account in [a, b, c] {
        service.request_enrollment(event, account).await.unwrap();
    }
    assert_eq!(admitted(&service, event).await, vec![a, b]);
    assert_eq!(waiting(&service, event).await, vec![c]);

    let promoted = service.withdraw_enrollment(event, a).await.unwrap();

    assert_eq!(promoted.len(), 1);
    assert_eq!(admitted(&service, event).await, vec![b, c]);
    assert!(waiting(&service, event).await.is_empty());
    assert_eq!(service.remaining_slots(event).await.unwrap(), Some(0));
    assert_eq!(
        bus.event_types(),
        vec![
            "EventCreated.v1",
            "EnrollmentCreated.v1",
            "EnrollmentCreated.v1",
            "EnrollmentCreated.v1",
            "EnrollmentWithdrawn.v1",
            "EnrollmentPromoted.v1",
        ]
    );
}

/// Withdrawing from a full event promotes exactly one waiting enrollment,
/// even when several are waiting.
#[tokio::test]
async fn test_withdrawal_promotes_exactly_one() {
    let (service, _) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::FirstComeFirstServed,
        Capacity::limited(1),
    )
    .await;
    let accounts: Vec<AccountId> = (0..4).map(|_| AccountId::new()).collect();
    for account in &accounts {
        service.request_enrollment(event, *account).await.unwrap();
    }

    service.withdraw_enrollment(event, accounts[0]).await.unwrap();

    assert_eq!(admitted(&service, event).await, vec![accounts[1]]);
    assert_eq!(waiting(&service, event).await, vec![accounts[2], accounts[3]]);
}

/// Capacity 1, organizer confirmed: both requests wait, the first accept
/// succeeds and the second is refused because the event is full.
#[tokio::test]
async fn test_organizer_accept_until_full() {
    let (service, _) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::OrganizerConfirmed,
        Capacity::limited(1),
    )
    .await;
    let (a, b) = (AccountId::new(), AccountId::new());

    let first = service.request_enrollment(event, a).await.unwrap();
    let second = service.request_enrollment(event, b).await.unwrap();
    assert!(admitted(&service, event).await.is_empty());

    service.organizer_accept(event, first).await.unwrap();
    let error = admission_error(service.organizer_accept(event, second).await);

    assert_eq!(error, AdmissionError::PolicyViolation(PolicyViolationReason::CapacityFull));
    assert_eq!(admitted(&service, event).await, vec![a]);
}

/// Rejecting an admitted enrollment keeps it on record and promotes nobody.
#[tokio::test]
async fn test_reject_keeps_enrollment_without_promotion() {
    let (service, bus) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::OrganizerConfirmed,
        Capacity::limited(1),
    )
    .await;
    let first = service.request_enrollment(event, AccountId::new()).await.unwrap();
    service.request_enrollment(event, AccountId::new()).await.unwrap();
    service.organizer_accept(event, first).await.unwrap();
    bus.clear();

    service.organizer_reject(event, first).await.unwrap();

    assert!(admitted(&service, event).await.is_empty());
    assert_eq!(waiting(&service, event).await.len(), 2);
    assert_eq!(bus.event_types(), vec!["EnrollmentRejected.v1"]);

    let error = admission_error(service.organizer_reject(event, first).await);
    assert_eq!(error, AdmissionError::PolicyViolation(PolicyViolationReason::NotAdmitted));
}

/// Capacity 2 → 4 with D < E < F waiting: D and E are promoted, F waits.
#[tokio::test]
async fn test_capacity_increase_promotes_in_order() {
    let (service, _) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::FirstComeFirstServed,
        Capacity::limited(2),
    )
    .await;
    let accounts: Vec<AccountId> = (0..5).map(|_| AccountId::new()).collect();
    for account in &accounts {
        service.request_enrollment(event, *account).await.unwrap();
    }
    let (d, e, f) = (accounts[2], accounts[3], accounts[4]);

    let promoted = service.update_capacity(event, Capacity::limited(4)).await.unwrap();

    assert_eq!(promoted.len(), 2);
    let now_admitted = admitted(&service, event).await;
    assert!(now_admitted.contains(&d) && now_admitted.contains(&e));
    assert_eq!(waiting(&service, event).await, vec![f]);
}

/// Switching to unlimited capacity admits the whole waitlist.
#[tokio::test]
async fn test_unlimited_capacity_admits_everyone() {
    let (service, _) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::FirstComeFirstServed,
        Capacity::limited(1),
    )
    .await;
    for _ in 0..3 {
        service.request_enrollment(event, AccountId::new()).await.unwrap();
    }

    service.update_capacity(event, Capacity::Unlimited).await.unwrap();

    assert_eq!(admitted(&service, event).await.len(), 3);
    assert_eq!(service.remaining_slots(event).await.unwrap(), None);
}

/// Lowering capacity below the admitted count is refused; nothing changes
/// and nothing is published.
#[tokio::test]
async fn test_capacity_below_admitted_is_refused() {
    let (service, bus) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::FirstComeFirstServed,
        Capacity::limited(3),
    )
    .await;
    for _ in 0..3 {
        service.request_enrollment(event, AccountId::new()).await.unwrap();
    }
    let before = service.event(event).await.unwrap();
    let published = bus.event_types().len();

    let error = admission_error(service.update_capacity(event, Capacity::limited(2)).await);

    assert_eq!(
        error,
        AdmissionError::InvalidCapacityChange {
            requested: Capacity::limited(2),
            admitted: 3,
        }
    );
    assert_eq!(service.event(event).await.unwrap(), before);
    assert_eq!(bus.event_types().len(), published);
}

/// A second request from the same account fails and creates nothing.
#[tokio::test]
async fn test_duplicate_request_is_refused() {
    let (service, bus) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::FirstComeFirstServed,
        Capacity::limited(5),
    )
    .await;
    let account = AccountId::new();
    service.request_enrollment(event, account).await.unwrap();
    bus.clear();

    let error = admission_error(service.request_enrollment(event, account).await);

    assert_eq!(error, AdmissionError::NotEnrollable(NotEnrollableReason::AlreadyEnrolled));
    assert_eq!(service.event(event).await.unwrap().enrollments.len(), 1);
    assert!(bus.published().is_empty());
    assert!(!service.is_enrollable(event, account).await.unwrap());
}

/// Requests are accepted strictly before the deadline.
#[tokio::test]
async fn test_enrollment_deadline_is_exclusive() {
    let (service, _) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::FirstComeFirstServed,
        Capacity::limited(5),
    )
    .await;
    let closes_at = service.event(event).await.unwrap().enrollment_closes_at;

    service
        .request_enrollment_at(event, AccountId::new(), closes_at - Duration::seconds(1))
        .await
        .unwrap();
    let error = admission_error(
        service
            .request_enrollment_at(event, AccountId::new(), closes_at)
            .await,
    );

    assert_eq!(error, AdmissionError::NotEnrollable(NotEnrollableReason::EnrollmentClosed));
}

/// Checked-in enrollments cannot be withdrawn until the check-in is undone.
#[tokio::test]
async fn test_attended_enrollment_cannot_withdraw() {
    let (service, _) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::FirstComeFirstServed,
        Capacity::limited(2),
    )
    .await;
    let account = AccountId::new();
    let enrollment = service.request_enrollment(event, account).await.unwrap();

    service.check_in(event, enrollment).await.unwrap();
    assert!(!service.is_withdrawable(event, account).await.unwrap());
    let error = admission_error(service.withdraw_enrollment(event, account).await);
    assert_eq!(error, AdmissionError::NotWithdrawable(NotWithdrawableReason::AlreadyAttended));

    service.cancel_check_in(event, enrollment).await.unwrap();
    service.withdraw_enrollment(event, account).await.unwrap();

    let error = admission_error(service.withdraw_enrollment(event, account).await);
    assert_eq!(error, AdmissionError::NotWithdrawable(NotWithdrawableReason::NotEnrolled));
}

/// Switching an organizer-confirmed event to first come first served admits
/// waiting enrollments up to capacity.
#[tokio::test]
async fn test_policy_switch_promotes() {
    let (service, _) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::OrganizerConfirmed,
        Capacity::limited(2),
    )
    .await;
    let accounts: Vec<AccountId> = (0..3).map(|_| AccountId::new()).collect();
    for account in &accounts {
        service.request_enrollment(event, *account).await.unwrap();
    }

    let promoted = service
        .update_policy(event, AdmissionPolicy::FirstComeFirstServed)
        .await
        .unwrap();

    assert_eq!(promoted.len(), 2);
    assert_eq!(admitted(&service, event).await, accounts[..2].to_vec());
    assert!(service.promote_waitlist(event).await.unwrap().is_empty());
}

/// A manual admission of a later arrival blocks the switch to first come
/// first served, since the earlier arrivals are still waiting.
#[tokio::test]
async fn test_policy_switch_refused_after_out_of_order_admission() {
    let (service, bus) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::OrganizerConfirmed,
        Capacity::limited(2),
    )
    .await;
    let (a, b, c) = (AccountId::new(), AccountId::new(), AccountId::new());
    service.request_enrollment(event, a).await.unwrap();
    service.request_enrollment(event, b).await.unwrap();
    let latest = service.request_enrollment(event, c).await.unwrap();
    service.organizer_accept(event, latest).await.unwrap();
    bus.clear();

    let error = admission_error(
        service
            .update_policy(event, AdmissionPolicy::FirstComeFirstServed)
            .await,
    );

    assert_eq!(
        error,
        AdmissionError::PolicyViolation(PolicyViolationReason::AdmissionsOutOfOrder)
    );
    let current = service.event(event).await.unwrap();
    assert_eq!(current.admission_policy, AdmissionPolicy::OrganizerConfirmed);
    assert_eq!(admitted(&service, event).await, vec![c]);
    assert_eq!(waiting(&service, event).await, vec![a, b]);
    assert!(bus.event_types().is_empty());
}

/// Editing the form keeps the admission policy and validates the schedule.
#[tokio::test]
async fn test_detail_update_keeps_policy() {
    let (service, _) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::OrganizerConfirmed,
        Capacity::limited(2),
    )
    .await;

    let mut form = details(AdmissionPolicy::FirstComeFirstServed, Capacity::limited(3));
    form.title = "Rust study night: async".to_string();
    service.update_event_details(event, form.clone()).await.unwrap();

    let updated = service.event(event).await.unwrap();
    assert_eq!(updated.title, "Rust study night: async");
    assert_eq!(updated.admission_policy, AdmissionPolicy::OrganizerConfirmed);
    assert_eq!(updated.capacity, Capacity::limited(3));

    form.ends_at = form.starts_at - Duration::hours(1);
    let error = admission_error(service.update_event_details(event, form).await);
    assert!(matches!(
        error,
        AdmissionError::InvalidDetails(fields) if fields.iter().any(|f| f.field == "ends_at")
    ));
}

/// An account's enrollments across events are listed newest first.
#[tokio::test]
async fn test_enrollments_of_lists_newest_first() {
    let (service, _) = setup();
    let account = AccountId::new();
    let early = open_event(
        &service,
        AdmissionPolicy::FirstComeFirstServed,
        Capacity::limited(5),
    )
    .await;
    let late = open_event(
        &service,
        AdmissionPolicy::FirstComeFirstServed,
        Capacity::limited(5),
    )
    .await;
    let pending = open_event(
        &service,
        AdmissionPolicy::OrganizerConfirmed,
        Capacity::limited(5),
    )
    .await;

    service.request_enrollment_at(early, account, now() + Duration::hours(1)).await.unwrap();
    service.request_enrollment_at(late, account, now() + Duration::hours(2)).await.unwrap();
    service.request_enrollment_at(pending, account, now() + Duration::hours(3)).await.unwrap();

    let admitted: Vec<EventId> = service
        .enrollments_of(account, true)
        .await
        .iter()
        .map(|e| e.event_id)
        .collect();
    assert_eq!(admitted, vec![late, early]);

    let waiting = service.enrollments_of(account, false).await;
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].event_id, pending);
}

/// A publication that keeps failing is fed back and counted; the command
/// itself still succeeds because its state change was committed.
#[tokio::test]
async fn test_publication_failure_is_counted() {
    let bus = Arc::new(RecordingEventBus::new());
    let mut config = Config::default();
    config.bus.publish_max_retries = 0;
    let service = AdmissionService::from_config(
        &config,
        Arc::new(test_clock()),
        Arc::clone(&bus) as Arc<dyn EventBus>,
    );
    let event = open_event(
        &service,
        AdmissionPolicy::FirstComeFirstServed,
        Capacity::limited(2),
    )
    .await;

    bus.fail_always();
    service.request_enrollment(event, AccountId::new()).await.unwrap();
    bus.recover();

    assert_eq!(service.publication_failures(event).await.unwrap(), 1);
    assert_eq!(admitted(&service, event).await.len(), 1);
    assert_eq!(bus.event_types(), vec!["EventCreated.v1"]);
}

/// Published payloads decode back into the domain event that was committed.
#[tokio::test]
async fn test_published_events_decode() {
    let (service, bus) = setup();
    let event = open_event(
        &service,
        AdmissionPolicy::FirstComeFirstServed,
        Capacity::limited(1),
    )
    .await;
    let account = AccountId::new();
    service.request_enrollment(event, account).await.unwrap();

    let last = bus.published().pop().unwrap();
    let decoded: AdmissionAction = last.decode().unwrap();

    match decoded {
        AdmissionAction::EnrollmentCreated { enrollment, summary } => {
            assert_eq!(enrollment.account_id, account);
            assert_eq!(enrollment.event_id, event);
            assert!(enrollment.admitted);
            assert!(summary.contains("Rust study night"));
        },
        other => panic!("unexpected event {other:?}"),
    }
}
