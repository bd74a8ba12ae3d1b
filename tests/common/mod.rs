//! Shared fixtures for the integration tests

#![allow(dead_code)]

use arrakis_pubsub::message::{OutboundMessage, PublishAck};
use arrakis_pubsub::options::{PublishSettings, ReceiveSettings};
use arrakis_pubsub::resources::{SubscriptionSpec, TopicSpec};
use arrakis_pubsub::transport::{DeliveryStream, MemoryTransport};
use arrakis_pubsub::{Options, PubSub, Transport, TransportError, TransportErrorKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-process transport that counts calls, can refuse one subscription and
/// can hold every publish for a while
pub struct ScriptedTransport {
    pub memory: MemoryTransport,
    pub publish_calls: AtomicUsize,
    pub created_subscriptions: AtomicUsize,
    pub refuse_subscription: Option<String>,
    pub publish_delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(memory: MemoryTransport) -> Self {
        Self {
            memory,
            publish_calls: AtomicUsize::new(0),
            created_subscriptions: AtomicUsize::new(0),
            refuse_subscription: None,
            publish_delay: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn slow_publishes(mut self, delay: Duration) -> Self {
        self.publish_delay = Some(delay);
        self
    }

    /// Most publish calls observed running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn refusing(mut self, subscription: &str) -> Self {
        self.refuse_subscription = Some(subscription.to_string());
        self
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn created_subscriptions(&self) -> usize {
        self.created_subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError> {
        self.memory.topic_exists(topic).await
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), TransportError> {
        self.memory.create_topic(spec).await
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, TransportError> {
        self.memory.subscription_exists(subscription).await
    }

    async fn create_subscription(&self, spec: &SubscriptionSpec) -> Result<(), TransportError> {
        if self.refuse_subscription.as_deref() == Some(spec.id.as_str()) {
            return Err(TransportError::new(
                TransportErrorKind::PermissionDenied,
                format!("caller may not create subscription {}", spec.id),
            ));
        }
        self.memory.create_subscription(spec).await?;
        self.created_subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
        settings: &PublishSettings,
    ) -> Result<PublishAck, TransportError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.publish_delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.memory.publish(topic, message, settings).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn stream_receive(
        &self,
        subscription: &str,
        settings: &ReceiveSettings,
    ) -> Result<DeliveryStream, TransportError> {
        self.memory.stream_receive(subscription, settings).await
    }

    fn is_connected(&self) -> bool {
        self.memory.is_connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.memory.close().await
    }
}

/// Client over a fresh in-process transport, plus a handle for inspection
pub fn memory_client(options: Options) -> (PubSub, MemoryTransport) {
    let memory = MemoryTransport::new();
    let client = PubSub::with_transport(Arc::new(memory.clone()), options);
    (client, memory)
}

/// Client over a scripted transport, plus a handle for inspection
pub fn scripted_client(transport: ScriptedTransport) -> (PubSub, Arc<ScriptedTransport>) {
    scripted_client_with(transport, Options::new())
}

/// Like [`scripted_client`] with explicit client options
pub fn scripted_client_with(
    transport: ScriptedTransport,
    options: Options,
) -> (PubSub, Arc<ScriptedTransport>) {
    let transport = Arc::new(transport);
    let client = PubSub::with_transport(transport.clone(), options);
    (client, transport)
}
