//! Pub/Sub client
//!
//! `PubSub` is a cheap, cloneable handle over one transport connection. Every
//! clone shares the same connection, options and counters and may be used
//! from any number of tasks at once.

use crate::attributes;
use crate::config::Config;
use crate::error::{PubSubError, Result};
use crate::message::{Message, OutboundMessage, Payload, PublishAck, ReceivedMessage};
use crate::metrics;
use crate::options::{Options, PublishOptions, ReceiveOptions, ReceiveSettings};
use crate::resources::{SubscriptionSettings, SubscriptionSpec, TopicSpec};
use crate::transport::{JetStreamTransport, MemoryTransport, Transport, TransportError};
use bytes::Bytes;
use futures::TryStreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

#[derive(Default)]
struct PublishStats {
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

/// Slots for publish requests in flight across every clone of a client.
///
/// Sized from the client's publish concurrency. A call resolved with a lower
/// concurrency `c` takes `capacity / c` slots (rounded up), so no more than
/// `c` such calls run together.
struct PublishGate {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl PublishGate {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    fn slots_for(&self, concurrency: usize) -> u32 {
        let slots = self.capacity.div_ceil(concurrency.max(1)).max(1);
        u32::try_from(slots).unwrap_or(u32::MAX)
    }
}

/// Client handle
#[derive(Clone)]
pub struct PubSub {
    transport: Arc<dyn Transport>,
    options: Arc<Options>,
    stats: Arc<PublishStats>,
    gate: Arc<PublishGate>,
}

impl PubSub {
    /// Connect using `config`: the in-process transport when `is_local` is
    /// set, otherwise NATS JetStream at `config.servers`.
    pub async fn connect(config: &Config) -> Result<Self> {
        config.validate()?;

        let transport: Arc<dyn Transport> = if config.is_local {
            info!(project_id = %config.project_id, "Using in-process transport");
            Arc::new(MemoryTransport::new())
        } else {
            let transport = JetStreamTransport::connect(config).await.map_err(|e| {
                metrics::set_transport_connected(false);
                PubSubError::Connection(e)
            })?;
            Arc::new(transport)
        };

        metrics::set_transport_connected(true);
        Ok(Self::with_transport(transport, config.options.clone()))
    }

    /// Wrap an already constructed transport
    pub fn with_transport(transport: Arc<dyn Transport>, options: Options) -> Self {
        let gate = PublishGate::new(options.publish.resolve().concurrency);
        Self {
            transport,
            options: Arc::new(options),
            stats: Arc::new(PublishStats::default()),
            gate: Arc::new(gate),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Messages acknowledged by the service through this client
    pub fn messages_published(&self) -> u64 {
        self.stats.messages_published.load(Ordering::Relaxed)
    }

    /// Publish calls that failed
    pub fn publish_failures(&self) -> u64 {
        self.stats.publish_failures.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Close the connection; open receive streams end
    pub async fn close(&self) -> Result<()> {
        info!("Closing pub/sub client");
        let result = self
            .transport
            .close()
            .await
            .map_err(|e| PubSubError::transport("close", "connection", e));
        metrics::set_transport_connected(false);
        observed("close", result)
    }

    /// Create a topic unless it already exists.
    ///
    /// Retention above seven days is truncated. An existing topic is left as
    /// is, whatever its configuration.
    pub async fn create_topic(&self, spec: &TopicSpec) -> Result<()> {
        observed("create_topic", self.ensure_topic(spec).await)
    }

    async fn ensure_topic(&self, spec: &TopicSpec) -> Result<()> {
        let exists = self
            .transport
            .topic_exists(&spec.id)
            .await
            .map_err(|e| PubSubError::transport("topic_exists", &spec.id, e))?;
        if exists {
            debug!(topic = %spec.id, "Topic already exists");
            return Ok(());
        }

        let clamped = spec.clamped();
        if clamped.retention != spec.retention {
            debug!(
                topic = %spec.id,
                requested = ?spec.retention,
                retention = ?clamped.retention,
                "Truncating topic retention"
            );
        }

        self.transport
            .create_topic(&clamped)
            .await
            .map_err(|e| PubSubError::transport("create_topic", &spec.id, e))?;

        metrics::record_created("topic");
        info!(topic = %clamped.id, retention = ?clamped.retention, "Topic created");
        Ok(())
    }

    /// Create one subscription on an existing topic
    pub async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        filter: &str,
        settings: &SubscriptionSettings,
    ) -> Result<()> {
        let result = async {
            self.require_topic(topic).await?;
            self.ensure_subscription(topic, subscription, filter, settings)
                .await
        }
        .await;
        observed("create_subscription", result)
    }

    /// Create every `(subscription, filter)` pair on an existing topic.
    ///
    /// Fails with [`PubSubError::Precondition`] before creating anything when
    /// the topic is absent. Existing subscriptions are skipped. The first
    /// failure aborts the batch; subscriptions created before it remain.
    pub async fn create_subscriptions<I, K, F>(
        &self,
        topic: &str,
        subscriptions: I,
        settings: &SubscriptionSettings,
    ) -> Result<()>
    where
        I: IntoIterator<Item = (K, F)>,
        K: AsRef<str>,
        F: AsRef<str>,
    {
        let result = async {
            self.require_topic(topic).await?;
            for (subscription, filter) in subscriptions {
                self.ensure_subscription(topic, subscription.as_ref(), filter.as_ref(), settings)
                    .await?;
            }
            Ok::<(), PubSubError>(())
        }
        .await;
        observed("create_subscriptions", result)
    }

    async fn require_topic(&self, topic: &str) -> Result<()> {
        let exists = self
            .transport
            .topic_exists(topic)
            .await
            .map_err(|e| PubSubError::transport("topic_exists", topic, e))?;
        if !exists {
            return Err(PubSubError::Precondition {
                topic: topic.to_string(),
            });
        }
        Ok(())
    }

    async fn ensure_subscription(
        &self,
        topic: &str,
        subscription: &str,
        filter: &str,
        settings: &SubscriptionSettings,
    ) -> Result<()> {
        let exists = self
            .transport
            .subscription_exists(subscription)
            .await
            .map_err(|e| PubSubError::transport("subscription_exists", subscription, e))?;
        if exists {
            debug!(subscription, "Subscription already exists");
            return Ok(());
        }

        let spec = SubscriptionSpec::new(topic, subscription, filter, settings);
        self.transport
            .create_subscription(&spec)
            .await
            .map_err(|e| PubSubError::transport("create_subscription", subscription, e))?;

        metrics::record_created("subscription");
        info!(
            subscription,
            topic,
            filter = spec.filter.as_deref().unwrap_or(""),
            ordered = spec.enable_ordering,
            "Subscription created"
        );
        Ok(())
    }

    /// Publish with the client's options and wait for the service ack
    pub async fn publish<T: Serialize>(&self, message: Message<T>) -> Result<PublishAck> {
        let options = Arc::clone(&self.options);
        self.publish_with(message, &options.publish).await
    }

    /// Publish with `options` for this call only and wait for the service ack
    pub async fn publish_with<T: Serialize>(
        &self,
        message: Message<T>,
        options: &PublishOptions,
    ) -> Result<PublishAck> {
        let started = Instant::now();
        let topic = message.topic.clone();

        match self.send(message, options).await {
            Ok(ack) => {
                self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
                metrics::record_published(&topic, started.elapsed());
                debug!(topic = %topic, message_id = %ack.message_id, "Message published");
                Ok(ack)
            }
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_publish_failure(&topic);
                warn!(topic = %topic, error = %e, "Failed to publish message");
                observed("publish", Err(e))
            }
        }
    }

    async fn send<T: Serialize>(
        &self,
        message: Message<T>,
        options: &PublishOptions,
    ) -> Result<PublishAck> {
        let Message {
            topic,
            payload,
            attributes: maps,
        } = message;

        let data = encode(&topic, payload)?;

        let mut merged = attributes::merge(maps);
        if options.auto_originated_at {
            attributes::stamp_originated_at(&mut merged, SystemTime::now());
        }

        let settings = options.resolve();
        let _slots = Arc::clone(&self.gate.slots)
            .acquire_many_owned(self.gate.slots_for(settings.concurrency))
            .await
            .map_err(|e| {
                PubSubError::transport(
                    "publish",
                    topic.as_str(),
                    TransportError::unavailable(e.to_string()),
                )
            })?;

        self.transport
            .publish(
                &topic,
                OutboundMessage {
                    data,
                    attributes: merged,
                },
                &settings,
            )
            .await
            .map_err(|e| PubSubError::transport("publish", topic.as_str(), e))
    }

    /// Forward every delivery on `subscription` to `sink` using the client's
    /// receive options.
    ///
    /// Runs until the delivery stream ends. Messages are never settled here;
    /// whoever drains `sink` must ack or nack them.
    pub async fn receive(
        &self,
        subscription: &str,
        sink: mpsc::Sender<ReceivedMessage>,
    ) -> Result<()> {
        let options = Arc::clone(&self.options);
        self.receive_with(subscription, &options.receive, sink).await
    }

    /// Like [`receive`](Self::receive) with explicit receive options
    pub async fn receive_with(
        &self,
        subscription: &str,
        options: &ReceiveOptions,
        sink: mpsc::Sender<ReceivedMessage>,
    ) -> Result<()> {
        let settings = options.resolve();
        observed("receive", self.dispatch(subscription, &settings, sink).await)
    }

    async fn dispatch(
        &self,
        subscription: &str,
        settings: &ReceiveSettings,
        sink: mpsc::Sender<ReceivedMessage>,
    ) -> Result<()> {
        let deliveries = self
            .transport
            .stream_receive(subscription, settings)
            .await
            .map_err(|e| PubSubError::transport("stream_receive", subscription, e))?;

        info!(
            subscription,
            concurrency = settings.concurrency,
            max_outstanding_messages = ?settings.max_outstanding_messages,
            max_outstanding_bytes = ?settings.max_outstanding_bytes,
            "Receiving"
        );

        let sink_closed = || PubSubError::SinkClosed {
            subscription: subscription.to_string(),
        };

        let forward = {
            let sink = &sink;
            deliveries
                .map_err(|e| PubSubError::transport("receive", subscription, e))
                .try_for_each_concurrent(settings.concurrency, move |message| async move {
                    sink.send(message).await.map_err(|_| sink_closed())?;
                    metrics::record_received(subscription);
                    Ok::<(), PubSubError>(())
                })
        };

        tokio::select! {
            result = forward => result?,
            _ = sink.closed() => return Err(sink_closed()),
        }

        info!(subscription, "Delivery stream ended");
        Ok(())
    }
}

impl fmt::Debug for PubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSub")
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

fn encode<T: Serialize>(topic: &str, payload: Payload<T>) -> Result<Bytes> {
    payload
        .encode()
        .map_err(|source| PubSubError::Serialization {
            topic: topic.to_string(),
            source,
        })
}

fn observed<T>(operation: &'static str, result: Result<T>) -> Result<T> {
    if let Err(ref e) = result {
        metrics::record_error(operation, e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::ORIGINATED_AT;

    async fn local() -> PubSub {
        PubSub::connect(&Config::local("arrakis")).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_validates_config() {
        let err = PubSub::connect(&Config::local("")).await.unwrap_err();
        assert!(matches!(err, PubSubError::Config(_)));
    }

    #[tokio::test]
    async fn test_local_client_is_connected() {
        let client = local().await;
        assert!(client.is_connected());
        client.close().await.unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_counters_track_outcomes() {
        let client = local().await;
        client.create_topic(&TopicSpec::new("orders")).await.unwrap();

        client.publish(Message::new("orders", 1)).await.unwrap();
        client.publish(Message::new("missing", 2)).await.unwrap_err();

        assert_eq!(client.messages_published(), 1);
        assert_eq!(client.publish_failures(), 1);
    }

    #[tokio::test]
    async fn test_clones_share_options() {
        let memory = Arc::new(MemoryTransport::new());
        let client = PubSub::with_transport(
            memory.clone(),
            Options::new().with_auto_originated_at(true),
        );
        let clone = client.clone();
        clone.create_topic(&TopicSpec::new("orders")).await.unwrap();
        clone.publish(Message::new("orders", "x")).await.unwrap();

        assert!(client.options().publish.auto_originated_at);
        assert!(memory.published("orders")[0]
            .attributes
            .contains_key(ORIGINATED_AT));
    }

    #[test]
    fn test_publish_gate_divides_slots_by_concurrency() {
        let gate = PublishGate::new(25);
        assert_eq!(gate.slots_for(25), 1);
        assert_eq!(gate.slots_for(100), 1);
        assert_eq!(gate.slots_for(5), 5);
        assert_eq!(gate.slots_for(2), 13);
        assert_eq!(gate.slots_for(1), 25);
        assert_eq!(gate.slots_for(0), 25);

        let gate = PublishGate::new(0);
        assert_eq!(gate.slots_for(1), 1);
    }
}
