//! Enrollment admission demo
//!
//! Walks through the admission rules against an in-memory event bus:
//! - First come, first served with a waitlist and promotion on withdrawal
//! - Organizer-confirmed admission with a full event
//! - Bulk promotion after a capacity increase
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=info,studyhub_enrollment=debug cargo run --bin enrollment-demo
//! ```

use anyhow::Context;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use studyhub_core::environment::{Clock, SystemClock};
use studyhub_core::event_bus::EventBus;
use studyhub_enrollment::{
    AccountId, AdmissionPolicy, AdmissionService, Capacity, Config, EnrollmentNotifier,
    EventDetails, EventId, TracingNotificationSink,
};
use studyhub_runtime::InMemoryEventBus;
use studyhub_runtime::metrics::MetricsServer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env().context("invalid configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let metrics = match config.server.metrics_addr {
        Some(addr) => {
            let mut server = MetricsServer::new(addr);
            server.start().context("failed to start metrics")?;
            Some(server)
        },
        None => None,
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::with_capacity(config.bus.capacity));
    let service = AdmissionService::from_config(&config, Arc::clone(&clock), Arc::clone(&bus));

    let notifier = EnrollmentNotifier::new(
        Arc::clone(&bus),
        config.bus.topic.clone(),
        Arc::new(TracingNotificationSink),
    )
    .with_retry_policy(config.retry_policy())
    .start()
    .await
    .context("failed to start notifier")?;

    let organizer = AccountId::new();
    let (alice, bob, carol, dave) = (
        AccountId::new(),
        AccountId::new(),
        AccountId::new(),
        AccountId::new(),
    );

    // ========== First come, first served ==========
    println!("\n1. First come, first served, capacity 2");

    let night = service
        .create_event(
            "rust-study",
            organizer,
            details(
                &*clock,
                "Rust study night",
                AdmissionPolicy::FirstComeFirstServed,
                Capacity::limited(2),
            ),
        )
        .await?;

    for account in [alice, bob, carol] {
        service.request_enrollment(night, account).await?;
    }
    print_event(&service, night).await?;

    println!("   Alice withdraws");
    let promoted = service.withdraw_enrollment(night, alice).await?;
    println!("   Promoted {} waiting enrollment(s)", promoted.len());
    print_event(&service, night).await?;

    // ========== Organizer confirmed ==========
    println!("\n2. Organizer confirmed, capacity 1");

    let review = service
        .create_event(
            "rust-study",
            organizer,
            details(
                &*clock,
                "Code review circle",
                AdmissionPolicy::OrganizerConfirmed,
                Capacity::limited(1),
            ),
        )
        .await?;

    let first = service.request_enrollment(review, alice).await?;
    let second = service.request_enrollment(review, bob).await?;
    service.organizer_accept(review, first).await?;
    match service.organizer_accept(review, second).await {
        Ok(()) => println!("   Unexpected: second accept succeeded"),
        Err(error) => println!("   Second accept refused: {error}"),
    }
    print_event(&service, review).await?;

    // ========== Capacity increase ==========
    println!("\n3. Raising capacity promotes in bulk");

    service.request_enrollment(night, dave).await?;
    service.request_enrollment(night, alice).await?;
    let promoted = service.update_capacity(night, Capacity::limited(4)).await?;
    println!("   Promoted {} waiting enrollment(s)", promoted.len());
    print_event(&service, night).await?;

    // ========== Shutdown ==========
    service
        .shutdown(config.shutdown_timeout())
        .await
        .context("admission service did not drain in time")?;
    let stats = notifier.stop().await;
    println!("\nNotifier: {} events, {} deliveries", stats.received, stats.delivered);

    if let Some(rendered) = metrics.as_ref().and_then(MetricsServer::render) {
        tracing::debug!(metrics = %rendered, "Final metrics");
    }

    Ok(())
}

fn details(
    clock: &dyn Clock,
    title: &str,
    policy: AdmissionPolicy,
    capacity: Capacity,
) -> EventDetails {
    let now = clock.now();
    EventDetails {
        title: title.to_string(),
        description: String::new(),
        admission_policy: policy,
        capacity,
        enrollment_closes_at: now + ChronoDuration::days(7),
        starts_at: now + ChronoDuration::days(8),
        ends_at: now + ChronoDuration::days(8) + ChronoDuration::hours(2),
    }
}

async fn print_event(service: &AdmissionService, event_id: EventId) -> anyhow::Result<()> {
    let event = service.event(event_id).await?;
    let remaining = event
        .remaining_slots()
        .map_or_else(|| "unlimited".to_string(), |n| n.to_string());

    println!(
        "   '{}': {} admitted, {} waiting, {remaining} seat(s) left",
        event.title,
        event.admitted_count(),
        event.waitlist().len()
    );
    Ok(())
}
