//! Domain error types for the Arrakis Pub/Sub layer
//!
//! Structured thiserror types so callers can pattern-match on the failure
//! mode instead of parsing message strings.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, PubSubError>.

use crate::transport::TransportError;
use thiserror::Error;

/// Convenience alias used across the crate
pub type Result<T, E = PubSubError> = std::result::Result<T, E>;

/// Pub/Sub domain errors
///
/// Transport failures are wrapped, never reclassified: the inner
/// [`TransportError`] keeps the kind and message the transport reported.
///
/// Example log output:
/// ```text
/// PubSubError::Precondition { topic: "orders" }
/// → "topic 'orders' does not exist"
/// ```
#[derive(Error, Debug)]
pub enum PubSubError {
    /// Payload could not be encoded; nothing was sent
    #[error("failed to encode payload for topic '{topic}'")]
    Serialization {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    /// Required topic is absent before subscription creation
    #[error("topic '{topic}' does not exist")]
    Precondition { topic: String },

    /// Any failure reported by the transport
    #[error("{operation} failed for '{resource}': {source}")]
    Transport {
        operation: &'static str,
        resource: String,
        #[source]
        source: TransportError,
    },

    /// The receiving half of a dispatch sink was dropped
    #[error("sink for subscription '{subscription}' was closed")]
    SinkClosed { subscription: String },

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Establishing the transport connection failed
    #[error("transport connection failed: {0}")]
    Connection(#[source] TransportError),
}

impl PubSubError {
    pub(crate) fn transport(
        operation: &'static str,
        resource: impl Into<String>,
        source: TransportError,
    ) -> Self {
        Self::Transport {
            operation,
            resource: resource.into(),
            source,
        }
    }

    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `pubsub_errors_total`.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Serialization { .. } => "serialization",
            Self::Precondition { .. } => "precondition",
            Self::Transport { .. } => "transport",
            Self::SinkClosed { .. } => "sink_closed",
            Self::Config(_) => "config",
            Self::Connection(_) => "connection",
        }
    }

    /// The wrapped transport error, if this failure came from the transport
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::Transport { source, .. } | Self::Connection(source) => Some(source),
            _ => None,
        }
    }
}
