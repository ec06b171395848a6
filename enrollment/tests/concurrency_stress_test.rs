//! Concurrency stress tests for last-seat admission.
//!
//! Many tasks enroll into the same event at once. The store's write lock
//! must make the outcome identical to some sequential order: exactly
//! `capacity` admitted, everyone else waiting, and one published event per
//! successful request.
//!
//! Run with: `cargo test --test concurrency_stress_test -- --nocapture`

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

use chrono::Duration;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use studyhub_core::environment::Clock;
use studyhub_core::event_bus::EventBus;
use studyhub_enrollment::{
    AccountId, AdmissionAction, AdmissionPolicy, AdmissionService, Capacity, EventDetails, EventId,
};
use studyhub_testing::{RecordingEventBus, test_clock};

fn details(capacity: u32) -> EventDetails {
    let now = test_clock().now();
    EventDetails {
        title: "Last seat".to_string(),
        description: String::new(),
        admission_policy: AdmissionPolicy::FirstComeFirstServed,
        capacity: Capacity::limited(capacity),
        enrollment_closes_at: now + Duration::days(1),
        starts_at: now + Duration::days(2),
        ends_at: now + Duration::days(3),
    }
}

fn setup() -> (Arc<AdmissionService>, Arc<RecordingEventBus>) {
    let bus = Arc::new(RecordingEventBus::new());
    let service = AdmissionService::new(
        Arc::new(test_clock()),
        Arc::clone(&bus) as Arc<dyn EventBus>,
    );
    (Arc::new(service), bus)
}

/// 100 concurrent requests for 5 seats admit exactly 5.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_admit_exactly_capacity() {
    let (service, bus) = setup();
    let event = service
        .create_event("rust", AccountId::new(), details(5))
        .await
        .unwrap();

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.request_enrollment(event, AccountId::new()).await })
        })
        .collect();

    let results = join_all(handles).await;
    assert!(results.into_iter().all(|r| r.unwrap().is_ok()));

    let snapshot = service.event(event).await.unwrap();
    assert_eq!(snapshot.admitted_count(), 5);
    assert_eq!(snapshot.waitlist().len(), 95);
    assert_eq!(service.remaining_slots(event).await.unwrap(), Some(0));

    let created = bus
        .event_types()
        .into_iter()
        .filter(|t| t == "EnrollmentCreated.v1")
        .count();
    assert_eq!(created, 100);
}

/// The same account racing with itself gets exactly one enrollment.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_requests_enroll_once() {
    let (service, bus) = setup();
    let event = service
        .create_event("rust", AccountId::new(), details(3))
        .await
        .unwrap();
    let account = AccountId::new();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.request_enrollment(event, account).await })
        })
        .collect();

    let succeeded = join_all(handles)
        .await
        .into_iter()
        .filter(|r| r.as_ref().unwrap().is_ok())
        .count();

    assert_eq!(succeeded, 1);
    assert_eq!(service.event(event).await.unwrap().enrollments.len(), 1);
    assert_eq!(bus.event_types().len(), 2);
}

/// Withdrawals racing with requests never overfill the event, and every
/// promotion goes to an enrollment that was waiting.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_withdrawals_and_requests_interleave_safely() {
    let (service, bus) = setup();
    let event = service
        .create_event("rust", AccountId::new(), details(4))
        .await
        .unwrap();

    let early: Vec<AccountId> = (0..8).map(|_| AccountId::new()).collect();
    for account in &early {
        service.request_enrollment(event, *account).await.unwrap();
    }

    let mut handles = Vec::new();
    for account in early.iter().take(4).copied() {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            service.withdraw_enrollment(event, account).await.map(|_| ())
        }));
    }
    for _ in 0..8 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            service.request_enrollment(event, AccountId::new()).await.map(|_| ())
        }));
    }
    assert!(join_all(handles).await.into_iter().all(|r| r.unwrap().is_ok()));

    let snapshot = service.event(event).await.unwrap();
    assert_eq!(snapshot.admitted_count(), 4);
    assert_eq!(snapshot.enrollments.len(), 12);

    // Everyone who was waiting before the race got the freed seats.
    let admitted: HashSet<AccountId> = snapshot
        .enrollments
        .iter()
        .filter(|e| e.admitted)
        .map(|e| e.account_id)
        .collect();
    assert_eq!(admitted, early[4..].iter().copied().collect());

    let promoted = bus
        .published()
        .iter()
        .filter(|e| e.event_type == "EnrollmentPromoted.v1")
        .count();
    assert_eq!(promoted, 4);
}

/// Published events for one event appear in commit order: the decoded
/// enrollment stream matches the order of the event's enrollment list.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_publication_follows_commit_order() {
    let (service, bus) = setup();
    let event = service
        .create_event("rust", AccountId::new(), details(50))
        .await
        .unwrap();

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.request_enrollment(event, AccountId::new()).await })
        })
        .collect();
    join_all(handles).await;

    let published: Vec<AccountId> = bus
        .published()
        .iter()
        .filter_map(|e| match e.decode::<AdmissionAction>().unwrap() {
            AdmissionAction::EnrollmentCreated { enrollment, .. } => Some(enrollment.account_id),
            _ => None,
        })
        .collect();
    let committed: Vec<AccountId> = service
        .event(event)
        .await
        .unwrap()
        .enrollments
        .iter()
        .map(|e| e.account_id)
        .collect();

    assert_eq!(published, committed);
}

/// Independent events make progress in parallel and never share seats.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_events_do_not_interfere() {
    let (service, _) = setup();
    let mut events: Vec<EventId> = Vec::new();
    for capacity in [1, 2, 3, 4] {
        events.push(
            service
                .create_event("rust", AccountId::new(), details(capacity))
                .await
                .unwrap(),
        );
    }

    let handles: Vec<_> = events
        .iter()
        .flat_map(|event| {
            let event = *event;
            let service = Arc::clone(&service);
            (0..10).map(move |_| {
                let service = Arc::clone(&service);
                tokio::spawn(
                    async move { service.request_enrollment(event, AccountId::new()).await },
                )
            })
        })
        .collect();
    assert!(join_all(handles).await.into_iter().all(|r| r.unwrap().is_ok()));

    for (event, capacity) in events.iter().zip([1usize, 2, 3, 4]) {
        let snapshot = service.event(*event).await.unwrap();
        assert_eq!(snapshot.admitted_count(), capacity);
        assert_eq!(snapshot.waitlist().len(), 10 - capacity);
    }
}
