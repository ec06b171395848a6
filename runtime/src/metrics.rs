//! Prometheus metrics for the admission engine.
//!
//! The store, the event bus and the notifier record through the `metrics`
//! facade. Nothing is exported unless a recorder is installed, which
//! [`MetricsServer::start`] does.
//!
//! # Example
//!
//! ```rust,no_run
//! use studyhub_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("127.0.0.1:9090".parse()?);
//! server.start()?;
//! println!("{}", server.render().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder plus the address it is advertised on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server for `addr`. Nothing is installed until [`Self::start`].
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// A recorder that is already installed (common in tests) is tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Address the metrics are advertised on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!("store.commands.total", "Commands processed by stores");
    describe_counter!(
        "store.shutdown.rejected_actions",
        "Commands rejected because the store was shutting down"
    );
    describe_histogram!(
        "store.reducer.duration_seconds",
        "Time spent inside the reducer while holding the state lock"
    );
    describe_gauge!("store.effects.pending", "Publications not yet completed");

    describe_counter!("event_bus_messages_published_total", "Domain events published");
    describe_counter!("event_bus_publish_errors_total", "Failed publish attempts");
    describe_histogram!("event_bus_publish_duration_seconds", "Time taken to publish one event");
    describe_counter!("event_bus_messages_consumed_total", "Domain events received by subscribers");
    describe_counter!("event_bus_subscriber_lag_total", "Events skipped by lagging subscribers");

    describe_counter!("retry.attempt", "Retries scheduled after a failed attempt");
    describe_counter!("retry.success", "Operations that succeeded after at least one retry");
    describe_counter!("retry.exhausted", "Operations that failed after all retries");

    describe_counter!("admission.commands.rejected", "Commands rejected by validation");
    describe_counter!("admission.commands.total", "Admission commands handled, by command");
    describe_counter!(
        "admission.enrollments.created",
        "Enrollment requests recorded, by outcome (admitted or waitlisted)"
    );
    describe_counter!(
        "admission.enrollments.promoted",
        "Waiting enrollments admitted by promotion"
    );
    describe_gauge!("admission.event.admitted", "Admitted enrollments per event");
    describe_counter!("notifier.notifications.sent", "Notifications delivered to sinks");
    describe_counter!("notifier.notifications.failed", "Notifications that could not be delivered");
}

/// Event bus metrics recorder.
pub struct EventBusMetrics;

impl EventBusMetrics {
    /// Record a successful publish.
    pub fn record_publish(duration: Duration) {
        counter!("event_bus_messages_published_total").increment(1);
        histogram!("event_bus_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed publish attempt.
    pub fn record_publish_error() {
        counter!("event_bus_publish_errors_total").increment(1);
    }

    /// Record an event handed to a subscriber.
    pub fn record_consume() {
        counter!("event_bus_messages_consumed_total").increment(1);
    }

    /// Record events skipped by a lagging subscriber.
    pub fn record_lag(skipped: u64) {
        counter!("event_bus_subscriber_lag_total").increment(skipped);
    }
}

/// Store metrics recorder.
pub struct StoreMetrics;

impl StoreMetrics {
    /// Record one reducer invocation.
    pub fn record_reduce(duration: Duration) {
        counter!("store.commands.total").increment(1);
        histogram!("store.reducer.duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a command refused during shutdown.
    pub fn record_rejected_during_shutdown() {
        counter!("store.shutdown.rejected_actions").increment(1);
    }

    /// Record the number of in-flight publications.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_pending(pending: usize) {
        gauge!("store.effects.pending").set(pending as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_is_empty_before_start() {
        let server = MetricsServer::new(SocketAddr::from(([127, 0, 0, 1], 9090)));
        assert!(server.render().is_none());
        assert_eq!(server.addr().port(), 9090);
    }

    #[test]
    fn recorders_work_without_installed_exporter() {
        EventBusMetrics::record_publish(Duration::from_millis(1));
        EventBusMetrics::record_publish_error();
        StoreMetrics::record_reduce(Duration::from_micros(5));
        StoreMetrics::record_pending(0);
    }
}
