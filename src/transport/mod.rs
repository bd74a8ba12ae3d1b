//! Transport capability
//!
//! Everything the client needs from the managed service: resource existence
//! checks, resource creation, publish-with-ack and streaming receive.
//! Implementations own wire protocol, authentication and retries.

pub mod filter;
pub mod jetstream;
pub mod memory;

pub use filter::Filter;
pub use jetstream::JetStreamTransport;
pub use memory::MemoryTransport;

use crate::message::{OutboundMessage, PublishAck, ReceivedMessage};
use crate::options::{PublishSettings, ReceiveSettings};
use crate::resources::{SubscriptionSpec, TopicSpec};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use thiserror::Error;

/// Stream of deliveries for one subscription
///
/// Ends when the service closes the subscription stream; a fatal error is
/// yielded as the final item.
pub type DeliveryStream = BoxStream<'static, Result<ReceivedMessage, TransportError>>;

/// Managed pub/sub service operations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether a topic with this id exists
    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError>;

    /// Create a topic; retention has already been clamped by the caller
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), TransportError>;

    /// Whether a subscription with this id exists
    async fn subscription_exists(&self, subscription: &str) -> Result<bool, TransportError>;

    /// Create a subscription on an existing topic
    async fn create_subscription(&self, spec: &SubscriptionSpec) -> Result<(), TransportError>;

    /// Publish one message and wait until the service has accepted it
    async fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
        settings: &PublishSettings,
    ) -> Result<PublishAck, TransportError>;

    /// Open a streaming receive on a subscription
    async fn stream_receive(
        &self,
        subscription: &str,
        settings: &ReceiveSettings,
    ) -> Result<DeliveryStream, TransportError>;

    /// Whether the underlying connection is usable
    fn is_connected(&self) -> bool {
        true
    }

    /// Release the connection
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Settles a single delivered message
#[async_trait]
pub trait Acker: Send + Sync {
    /// Acknowledge; settling an already settled message is a no-op
    async fn ack(&self) -> Result<(), TransportError>;

    /// Negatively acknowledge, requesting redelivery
    async fn nack(&self) -> Result<(), TransportError>;
}

/// Failure class reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    InvalidArgument,
    ResourceExhausted,
    Unavailable,
    DeadlineExceeded,
    Unknown,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidArgument => "invalid_argument",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by a transport
///
/// Displays the underlying message untouched.
#[derive(Debug, Error)]
#[error("{inner}")]
pub struct TransportError {
    kind: TransportErrorKind,
    inner: Box<dyn std::error::Error + Send + Sync>,
}

impl TransportError {
    pub fn new(
        kind: TransportErrorKind,
        error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            inner: error.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotFound, message.into())
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::AlreadyExists, message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidArgument, message.into())
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ResourceExhausted, message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unavailable, message.into())
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::DeadlineExceeded, message.into())
    }
}
