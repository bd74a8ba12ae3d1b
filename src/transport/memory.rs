//! In-process transport
//!
//! Emulates the managed service for local mode and tests: topics fan out to
//! their subscriptions, filters drop non-matching messages at publish time,
//! topic retention expires undelivered messages, and unsettled deliveries are
//! redelivered with an incremented attempt count.

use crate::attributes::Attributes;
use crate::message::{OutboundMessage, PublishAck, ReceivedMessage};
use crate::options::{PublishSettings, ReceiveSettings};
use crate::resources::{SubscriptionSpec, TopicSpec};
use crate::transport::{Acker, DeliveryStream, Filter, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Connection state observed by open delivery streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Open,
    Closed,
    Severed,
}

/// Published messages kept per topic for inspection
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// In-memory transport
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryTransportInner>,
}

struct MemoryTransportInner {
    topics: DashMap<String, TopicState>,
    subscriptions: DashMap<String, Arc<SubscriptionQueue>>,
    next_message_id: AtomicU64,
    link: watch::Sender<Link>,
    history_limit: usize,
}

struct TopicState {
    spec: TopicSpec,
    published: VecDeque<(SystemTime, OutboundMessage)>,
}

impl TopicState {
    /// Record `message`, dropping entries past retention or beyond `limit`
    fn record(&mut self, message: OutboundMessage, now: SystemTime, limit: usize) {
        if let Some(retention) = self.spec.retention {
            while self.published.front().is_some_and(|(at, _)| {
                now.duration_since(*at).map_or(false, |age| age > retention)
            }) {
                self.published.pop_front();
            }
        }

        if limit == 0 {
            return;
        }
        while self.published.len() >= limit {
            self.published.pop_front();
        }
        self.published.push_back((now, message));
    }
}

struct SubscriptionQueue {
    spec: SubscriptionSpec,
    filter: Option<Filter>,
    retention: Option<Duration>,
    sender: mpsc::UnboundedSender<StoredMessage>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<StoredMessage>>,
    acked: AtomicU64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    data: Bytes,
    attributes: Attributes,
    publish_time: SystemTime,
    delivery_attempt: u32,
}

impl SubscriptionQueue {
    fn enqueue(&self, message: StoredMessage) {
        // The receiver lives as long as the queue, so this cannot fail.
        let _ = self.sender.send(message);
    }

    fn redeliver(&self, mut message: StoredMessage) {
        message.delivery_attempt += 1;
        debug!(
            subscription = %self.spec.id,
            message_id = %message.id,
            attempt = message.delivery_attempt,
            "Redelivering message"
        );
        self.enqueue(message);
    }

    fn is_expired(&self, message: &StoredMessage) -> bool {
        let Some(retention) = self.retention else {
            return false;
        };
        message
            .publish_time
            .elapsed()
            .map_or(false, |age| age > retention)
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Keep at most `limit` published messages per topic (`0` keeps none)
    pub fn with_history_limit(limit: usize) -> Self {
        info!(history_limit = limit, "Initializing in-memory transport");
        let (link, _) = watch::channel(Link::Open);

        Self {
            inner: Arc::new(MemoryTransportInner {
                topics: DashMap::new(),
                subscriptions: DashMap::new(),
                next_message_id: AtomicU64::new(1),
                link,
                history_limit: limit,
            }),
        }
    }

    /// Declared configuration of a topic
    pub fn topic(&self, topic: &str) -> Option<TopicSpec> {
        self.inner.topics.get(topic).map(|t| t.spec.clone())
    }

    /// Declared configuration of a subscription
    pub fn subscription(&self, subscription: &str) -> Option<SubscriptionSpec> {
        self.inner
            .subscriptions
            .get(subscription)
            .map(|s| s.spec.clone())
    }

    /// Number of subscriptions across all topics
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Retained messages accepted for a topic, in publish order
    pub fn published(&self, topic: &str) -> Vec<OutboundMessage> {
        self.inner
            .topics
            .get(topic)
            .map(|t| t.published.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages acknowledged on a subscription
    pub fn acked_count(&self, subscription: &str) -> u64 {
        self.inner
            .subscriptions
            .get(subscription)
            .map_or(0, |s| s.acked.load(Ordering::Relaxed))
    }

    /// Fail every open delivery stream and reject further calls
    pub fn disconnect(&self) {
        self.inner.link.send_replace(Link::Severed);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        match *self.inner.link.borrow() {
            Link::Open => Ok(()),
            Link::Closed => Err(TransportError::unavailable("transport is closed")),
            Link::Severed => Err(TransportError::unavailable("transport disconnected")),
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Resource ids: 3-255 chars, start with a letter, `[A-Za-z0-9-_.~+%]`
fn validate_resource_id(kind: &str, id: &str) -> Result<(), TransportError> {
    if id.len() < 3 || id.len() > 255 {
        return Err(TransportError::invalid_argument(format!(
            "{kind} id must be 3-255 characters, got {}",
            id.len()
        )));
    }

    if !id.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(TransportError::invalid_argument(format!(
            "{kind} id must start with a letter"
        )));
    }

    if let Some(ch) = id
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !"-_.~+%".contains(*c))
    {
        return Err(TransportError::invalid_argument(format!(
            "{kind} id contains invalid character: '{ch}'"
        )));
    }

    Ok(())
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError> {
        self.ensure_open()?;
        Ok(self.inner.topics.contains_key(topic))
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        validate_resource_id("topic", &spec.id)?;

        match self.inner.topics.entry(spec.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TransportError::already_exists(
                format!("Topic already exists: {}", spec.id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(TopicState {
                    spec: spec.clone(),
                    published: VecDeque::new(),
                });
                info!(topic = %spec.id, retention = ?spec.retention, "Created topic");
                Ok(())
            }
        }
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, TransportError> {
        self.ensure_open()?;
        Ok(self.inner.subscriptions.contains_key(subscription))
    }

    async fn create_subscription(&self, spec: &SubscriptionSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        validate_resource_id("subscription", &spec.id)?;

        let retention = self
            .inner
            .topics
            .get(&spec.topic)
            .map(|t| t.spec.retention)
            .ok_or_else(|| TransportError::not_found(format!("Topic not found: {}", spec.topic)))?;

        let filter = spec
            .filter
            .as_deref()
            .map(Filter::parse)
            .transpose()
            .map_err(|e| TransportError::invalid_argument(e.to_string()))?;

        match self.inner.subscriptions.entry(spec.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TransportError::already_exists(
                format!("Subscription already exists: {}", spec.id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (sender, receiver) = mpsc::unbounded_channel();
                slot.insert(Arc::new(SubscriptionQueue {
                    spec: spec.clone(),
                    filter,
                    retention,
                    sender,
                    receiver: tokio::sync::Mutex::new(receiver),
                    acked: AtomicU64::new(0),
                }));
                info!(subscription = %spec.id, topic = %spec.topic, "Created subscription");
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
        settings: &PublishSettings,
    ) -> Result<PublishAck, TransportError> {
        self.ensure_open()?;

        if message.data.len() > settings.buffered_byte_limit {
            return Err(TransportError::resource_exhausted(format!(
                "message of {} bytes exceeds buffered byte limit of {}",
                message.data.len(),
                settings.buffered_byte_limit
            )));
        }

        let message_id = self
            .inner
            .next_message_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let publish_time = SystemTime::now();

        match self.inner.topics.get_mut(topic) {
            Some(mut state) => {
                state.record(message.clone(), publish_time, self.inner.history_limit)
            }
            None => {
                return Err(TransportError::not_found(format!(
                    "Topic not found: {topic}"
                )))
            }
        }

        let mut fanned_out = 0usize;
        for entry in self.inner.subscriptions.iter() {
            let queue = entry.value();
            if queue.spec.topic != topic {
                continue;
            }
            if queue
                .filter
                .as_ref()
                .is_some_and(|f| !f.matches(&message.attributes))
            {
                continue;
            }

            queue.enqueue(StoredMessage {
                id: message_id.clone(),
                data: message.data.clone(),
                attributes: message.attributes.clone(),
                publish_time,
                delivery_attempt: 1,
            });
            fanned_out += 1;
        }

        debug!(topic, message_id = %message_id, subscriptions = fanned_out, "Message accepted");
        Ok(PublishAck { message_id })
    }

    async fn stream_receive(
        &self,
        subscription: &str,
        settings: &ReceiveSettings,
    ) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;

        let queue = self
            .inner
            .subscriptions
            .get(subscription)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| {
                TransportError::not_found(format!("Subscription not found: {subscription}"))
            })?;

        let state = DeliveryState {
            queue,
            message_slots: settings
                .max_outstanding_messages
                .map(|max| Arc::new(Semaphore::new(max.min(Semaphore::MAX_PERMITS)))),
            byte_budget: settings.max_outstanding_bytes.map(|max| {
                let max = max.min(u32::MAX as usize);
                (Arc::new(Semaphore::new(max)), max)
            }),
            link: self.inner.link.subscribe(),
        };

        let deliveries = futures::stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            match state.next_delivery().await {
                Ok(Some(message)) => Some((Ok(message), Some(state))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        });

        Ok(deliveries.boxed())
    }

    fn is_connected(&self) -> bool {
        *self.inner.link.borrow() == Link::Open
    }

    async fn close(&self) -> Result<(), TransportError> {
        info!("Closing in-memory transport");
        self.inner.link.send_if_modified(|link| {
            if *link == Link::Open {
                *link = Link::Closed;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

struct DeliveryState {
    queue: Arc<SubscriptionQueue>,
    message_slots: Option<Arc<Semaphore>>,
    byte_budget: Option<(Arc<Semaphore>, usize)>,
    link: watch::Receiver<Link>,
}

impl DeliveryState {
    /// Next live message; `Ok(None)` once the transport is closed
    async fn next_delivery(&mut self) -> Result<Option<ReceivedMessage>, TransportError> {
        loop {
            let slot = match &self.message_slots {
                Some(slots) => match Arc::clone(slots).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return Ok(None),
                },
                None => None,
            };

            let queue = &self.queue;
            let link = &mut self.link;
            let stored = tokio::select! {
                stored = async { queue.receiver.lock().await.recv().await } => stored,
                link = link.wait_for(|link| *link != Link::Open) => {
                    return match link.map(|l| *l) {
                        Ok(Link::Severed) => Err(TransportError::unavailable("transport disconnected")),
                        _ => Ok(None),
                    };
                }
            };
            let Some(stored) = stored else {
                return Ok(None);
            };

            if self.queue.is_expired(&stored) {
                debug!(
                    subscription = %self.queue.spec.id,
                    message_id = %stored.id,
                    "Dropping message past topic retention"
                );
                continue;
            }

            let bytes = match &self.byte_budget {
                Some((budget, max)) => {
                    let wanted = stored.data.len().min(*max) as u32;
                    match Arc::clone(budget).acquire_many_owned(wanted).await {
                        Ok(permit) => Some(permit),
                        Err(_) => return Ok(None),
                    }
                }
                None => None,
            };

            let message = ReceivedMessage::new(
                stored.id.clone(),
                stored.data.clone(),
                stored.attributes.clone(),
                Box::new(MemoryAcker {
                    queue: Arc::clone(&self.queue),
                    lease: Mutex::new(Some(Lease {
                        message: stored.clone(),
                        _slot: slot,
                        _bytes: bytes,
                    })),
                }),
            )
            .with_publish_time(stored.publish_time)
            .with_delivery_attempt(stored.delivery_attempt);

            return Ok(Some(message));
        }
    }
}

struct Lease {
    message: StoredMessage,
    _slot: Option<OwnedSemaphorePermit>,
    _bytes: Option<OwnedSemaphorePermit>,
}

struct MemoryAcker {
    queue: Arc<SubscriptionQueue>,
    lease: Mutex<Option<Lease>>,
}

impl MemoryAcker {
    fn settle(&self) -> Option<Lease> {
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        if self.settle().is_some() {
            self.queue.acked.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn nack(&self) -> Result<(), TransportError> {
        if let Some(lease) = self.settle() {
            self.queue.redeliver(lease.message);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        // Unsettled lease: behave like an expired ack deadline.
        if let Some(lease) = self.settle() {
            self.queue.redeliver(lease.message);
        }
    }
}
