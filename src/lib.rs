//! Arrakis Pub/Sub
//!
//! A thin client layer over a managed publish/subscribe service:
//! - idempotent topic and subscription provisioning
//! - a publish pipeline that encodes payloads, merges attribute maps and
//!   optionally stamps `OriginatedAt`
//! - receive dispatch that forwards deliveries to a channel for the caller
//!   to acknowledge
//!
//! The service itself sits behind the [`transport::Transport`] trait, with a
//! NATS JetStream implementation for deployments and an in-process one for
//! local runs and tests.

pub mod attributes;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod message;
pub mod metrics;
pub mod options;
pub mod resources;
pub mod transport;

pub use attributes::{merge, Attributes, ORIGINATED_AT};
pub use client::PubSub;
pub use crate::config::{Config, RelayConfig};
pub use error::{PubSubError, Result};
pub use message::{Message, Payload, PublishAck, ReceivedMessage};
pub use options::{Options, PublishOptions, ReceiveOptions};
pub use resources::{SubscriptionSettings, TopicSpec};
pub use transport::{Transport, TransportError, TransportErrorKind};
