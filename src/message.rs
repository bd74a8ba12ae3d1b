//! Message types for publishing and receiving

use crate::attributes::{self, Attributes};
use crate::transport::{Acker, TransportError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::SystemTime;

/// Message payload: raw bytes, or a value encoded as JSON on publish
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<T = serde_json::Value> {
    /// Pre-encoded bytes, sent unchanged
    Raw(Bytes),
    /// Structured value, JSON encoded by the publish pipeline
    Structured(T),
}

impl<T: Serialize> Payload<T> {
    /// Bytes that go on the wire
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        match self {
            Payload::Raw(bytes) => Ok(bytes.clone()),
            Payload::Structured(value) => serde_json::to_vec(value).map(Bytes::from),
        }
    }
}

/// A message to publish
///
/// Attribute maps are kept in the order they were added and merged by the
/// publish pipeline; later maps win on key collisions.
#[derive(Debug, Clone)]
pub struct Message<T = serde_json::Value> {
    pub topic: String,
    pub payload: Payload<T>,
    pub attributes: Vec<Attributes>,
}

impl<T> Message<T> {
    /// Message carrying a structured value
    pub fn new(topic: impl Into<String>, value: T) -> Self {
        Self {
            topic: topic.into(),
            payload: Payload::Structured(value),
            attributes: Vec::new(),
        }
    }

    /// Append an attribute map
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.push(attributes);
        self
    }

    /// Append a single attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .push(Attributes::from([(key.into(), value.into())]));
        self
    }
}

impl Message<serde_json::Value> {
    /// Message carrying pre-encoded bytes
    pub fn raw(topic: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: Payload::Raw(data.into()),
            attributes: Vec::new(),
        }
    }
}

/// Encoded message as handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub data: Bytes,
    pub attributes: Attributes,
}

/// Service acknowledgment of a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Identifier the service assigned to the message
    pub message_id: String,
}

/// A delivered message awaiting acknowledgment
///
/// Exactly one of [`ack`](Self::ack) or [`nack`](Self::nack) should be
/// called. Dropping an unsettled message leaves redelivery to the transport.
pub struct ReceivedMessage {
    pub id: String,
    pub data: Bytes,
    pub attributes: Attributes,
    pub publish_time: Option<SystemTime>,
    /// 1 on first delivery; `None` when the transport does not track attempts
    pub delivery_attempt: Option<u32>,
    acker: Box<dyn Acker>,
}

impl ReceivedMessage {
    pub fn new(
        id: impl Into<String>,
        data: Bytes,
        attributes: Attributes,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            id: id.into(),
            data,
            attributes,
            publish_time: None,
            delivery_attempt: None,
            acker,
        }
    }

    pub fn with_publish_time(mut self, publish_time: SystemTime) -> Self {
        self.publish_time = Some(publish_time);
        self
    }

    pub fn with_delivery_attempt(mut self, attempt: u32) -> Self {
        self.delivery_attempt = Some(attempt);
        self
    }

    /// Decode the payload as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Epoch seconds from the `OriginatedAt` attribute, if present
    pub fn originated_at(&self) -> Option<u64> {
        attributes::originated_at(&self.attributes)
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    /// Request redelivery
    pub async fn nack(self) -> Result<(), TransportError> {
        self.acker.nack().await
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("id", &self.id)
            .field("data_len", &self.data.len())
            .field("attributes", &self.attributes)
            .field("publish_time", &self.publish_time)
            .field("delivery_attempt", &self.delivery_attempt)
            .finish_non_exhaustive()
    }
}
