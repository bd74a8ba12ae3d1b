//! Prometheus metrics
//!
//! Recording goes through the `metrics` facade, so the client can record
//! unconditionally; without an installed recorder the calls are no-ops.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

use crate::error::PubSubError;

/// Installed Prometheus recorder
#[derive(Clone)]
pub struct PubSubMetrics {
    handle: Arc<PrometheusHandle>,
}

impl PubSubMetrics {
    /// Install the process-wide recorder and describe every metric
    pub fn install() -> Result<Self, PubSubError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| PubSubError::Config(format!("failed to install Prometheus recorder: {e}")))?;

        Self::register_metrics();

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "pubsub_messages_published_total",
            Unit::Count,
            "Messages acknowledged by the service"
        );
        describe_counter!(
            "pubsub_publish_failures_total",
            Unit::Count,
            "Publish calls that returned an error"
        );
        describe_counter!(
            "pubsub_messages_received_total",
            Unit::Count,
            "Messages forwarded to a receive sink"
        );
        describe_counter!(
            "pubsub_resources_created_total",
            Unit::Count,
            "Topics and subscriptions created"
        );
        describe_counter!(
            "pubsub_errors_total",
            Unit::Count,
            "Errors returned by client operations"
        );

        describe_histogram!(
            "pubsub_publish_duration_seconds",
            Unit::Seconds,
            "Time from publish call to service acknowledgment"
        );

        describe_gauge!(
            "pubsub_transport_connected",
            Unit::Count,
            "Transport connection status (1=connected, 0=disconnected)"
        );
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

pub(crate) fn record_published(topic: &str, duration: Duration) {
    counter!("pubsub_messages_published_total", "topic" => topic.to_string()).increment(1);
    histogram!("pubsub_publish_duration_seconds", "topic" => topic.to_string())
        .record(duration.as_secs_f64());
}

pub(crate) fn record_publish_failure(topic: &str) {
    counter!("pubsub_publish_failures_total", "topic" => topic.to_string()).increment(1);
}

pub(crate) fn record_received(subscription: &str) {
    counter!(
        "pubsub_messages_received_total",
        "subscription" => subscription.to_string()
    )
    .increment(1);
}

/// `kind` is `topic` or `subscription`
pub(crate) fn record_created(kind: &'static str) {
    counter!("pubsub_resources_created_total", "kind" => kind).increment(1);
}

pub(crate) fn record_error(operation: &'static str, error: &PubSubError) {
    counter!(
        "pubsub_errors_total",
        "operation" => operation,
        "error_type" => error.error_type_label()
    )
    .increment(1);
}

pub fn set_transport_connected(connected: bool) {
    gauge!("pubsub_transport_connected").set(if connected { 1.0 } else { 0.0 });
}
