//! NATS JetStream transport
//!
//! Resource mapping:
//! - topic → stream `<project>_<topic>` capturing subject `<project>.<topic>`
//! - subscription → durable pull consumer on the topic's stream
//! - attributes → message headers
//!
//! Ids are escaped into names with [`token`]: every byte outside
//! `[A-Za-z0-9-]` becomes `_XX`, so distinct ids never share a stream,
//! consumer or registry key.
//!
//! Subscription-only calls need to find the owning stream, so every created
//! subscription is recorded in the key-value bucket `PUBSUB_<project>`.
//! Filters are evaluated here; non-matching deliveries are acknowledged and
//! skipped.

use crate::attributes::Attributes;
use crate::config::Config;
use crate::message::{OutboundMessage, PublishAck, ReceivedMessage};
use crate::options::{PublishSettings, ReceiveSettings};
use crate::resources::{SubscriptionSpec, TopicSpec, MIN_ACK_DEADLINE};
use crate::transport::{
    Acker, DeliveryStream, Filter, Transport, TransportError, TransportErrorKind,
};
use async_nats::jetstream::consumer::pull::MessagesError;
use async_nats::jetstream::consumer::{pull, AckPolicy, Consumer, DeliverPolicy};
use async_nats::jetstream::context::{
    ConsumerInfoError, ConsumerInfoErrorKind, CreateStreamError, CreateStreamErrorKind,
    GetStreamError, GetStreamErrorKind, PublishError, PublishErrorKind,
};
use async_nats::jetstream::stream::{ConsumerError, ConsumerErrorKind, RetentionPolicy, StorageType};
use async_nats::jetstream::{self, kv, AckKind, Context as JsContext, ErrorCode};
use async_nats::{Client, ConnectOptions, HeaderMap, HeaderName, HeaderValue};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry entry for a created subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SubscriptionRecord {
    topic: String,
    stream: String,
    consumer: String,
    filter: Option<String>,
    enable_ordering: bool,
    retain_acked: bool,
    /// Consumer ack deadline; records written before it existed use the
    /// consumer default
    #[serde(default = "default_ack_wait_ms")]
    ack_wait_ms: u64,
}

impl SubscriptionRecord {
    fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }
}

fn default_ack_wait_ms() -> u64 {
    MIN_ACK_DEADLINE.as_millis() as u64
}

/// JetStream-backed transport
pub struct JetStreamTransport {
    client: Client,
    jetstream: JsContext,
    registry: kv::Store,
    project: String,
    closed: watch::Sender<bool>,
}

impl JetStreamTransport {
    /// Connect to NATS and open the project's subscription registry
    pub async fn connect(config: &Config) -> Result<Self, TransportError> {
        info!(
            servers = %config.servers,
            project = %config.project_id,
            "Connecting to NATS"
        );

        let options = match &config.credentials_file {
            Some(path) => ConnectOptions::with_credentials_file(path)
                .await
                .map_err(|e| TransportError::new(TransportErrorKind::PermissionDenied, e))?,
            None => ConnectOptions::new(),
        };

        let client = options
            .name(&format!("arrakis-pubsub/{}", config.project_id))
            .connect(config.servers.as_str())
            .await
            .map_err(classify)?;

        let jetstream = jetstream::new(client.clone());
        let bucket = registry_bucket(&config.project_id);

        let registry = match jetstream.get_key_value(bucket.clone()).await {
            Ok(store) => store,
            Err(_) => jetstream
                .create_key_value(kv::Config {
                    bucket: bucket.clone(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(classify)?,
        };

        info!(bucket, "Connected to NATS JetStream");

        let (closed, _) = watch::channel(false);
        Ok(Self {
            client,
            jetstream,
            registry,
            project: config.project_id.clone(),
            closed,
        })
    }

    fn stream_name(&self, topic: &str) -> String {
        format!("{}_{}", token(&self.project), token(topic))
    }

    fn subject(&self, topic: &str) -> String {
        format!("{}.{}", token(&self.project), token(topic))
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        check_open(&self.closed)
    }

    async fn lookup(&self, subscription: &str) -> Result<Option<SubscriptionRecord>, TransportError> {
        let Some(raw) = self
            .registry
            .get(token(subscription))
            .await
            .map_err(classify)?
        else {
            return Ok(None);
        };

        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| TransportError::new(TransportErrorKind::Unknown, e))
    }
}

/// Escape an id into a stream name, subject token or key.
///
/// `[A-Za-z0-9-]` is kept; every other byte becomes `_` plus two uppercase
/// hex digits, so the mapping is reversible.
fn token(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            escaped.push(char::from(byte));
        } else {
            let _ = write!(escaped, "_{byte:02X}");
        }
    }
    escaped
}

fn check_open(closed: &watch::Sender<bool>) -> Result<(), TransportError> {
    if *closed.borrow() {
        return Err(TransportError::unavailable("transport is closed"));
    }
    Ok(())
}

fn registry_bucket(project: &str) -> String {
    format!("PUBSUB_{}", token(project))
}

/// Assign a kind from the error text reported by the server or client.
///
/// Fallback for errors without a typed kind; the typed helpers below take
/// precedence.
fn classify(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> TransportError {
    let error = error.into();
    let text = error.to_string().to_lowercase();

    let kind = if text.contains("not found") || text.contains("no stream found") {
        TransportErrorKind::NotFound
    } else if text.contains("already in use") || text.contains("already exists") {
        TransportErrorKind::AlreadyExists
    } else if text.contains("timed out") || text.contains("timeout") {
        TransportErrorKind::DeadlineExceeded
    } else if text.contains("authorization") || text.contains("permission") {
        TransportErrorKind::PermissionDenied
    } else if text.contains("no responders")
        || text.contains("connection")
        || text.contains("disconnected")
    {
        TransportErrorKind::Unavailable
    } else {
        TransportErrorKind::Unknown
    };

    TransportError::new(kind, error)
}

/// Kind for a JetStream API error code, when it has a direct counterpart
fn code_kind(code: ErrorCode) -> Option<TransportErrorKind> {
    match code {
        ErrorCode::STREAM_NOT_FOUND | ErrorCode::CONSUMER_NOT_FOUND => {
            Some(TransportErrorKind::NotFound)
        }
        ErrorCode::STREAM_NAME_EXIST
        | ErrorCode::CONSUMER_NAME_EXIST
        | ErrorCode::CONSUMER_ALREADY_EXISTS => Some(TransportErrorKind::AlreadyExists),
        _ => None,
    }
}

fn typed(
    kind: Option<TransportErrorKind>,
    error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> TransportError {
    match kind {
        Some(kind) => TransportError::new(kind, error),
        None => classify(error),
    }
}

fn publish_error(error: PublishError) -> TransportError {
    let kind = match error.kind() {
        PublishErrorKind::StreamNotFound => Some(TransportErrorKind::NotFound),
        PublishErrorKind::TimedOut => Some(TransportErrorKind::DeadlineExceeded),
        PublishErrorKind::MaxAckPending => Some(TransportErrorKind::ResourceExhausted),
        PublishErrorKind::BrokenPipe => Some(TransportErrorKind::Unavailable),
        _ => None,
    };
    typed(kind, error)
}

fn get_stream_error(error: GetStreamError) -> TransportError {
    let kind = match error.kind() {
        GetStreamErrorKind::JetStream(e) => code_kind(e.error_code()),
        GetStreamErrorKind::EmptyName | GetStreamErrorKind::InvalidStreamName => {
            Some(TransportErrorKind::InvalidArgument)
        }
        _ => None,
    };
    typed(kind, error)
}

fn create_stream_error(error: CreateStreamError) -> TransportError {
    let kind = match error.kind() {
        CreateStreamErrorKind::JetStream(e) => code_kind(e.error_code()),
        CreateStreamErrorKind::NotFound => Some(TransportErrorKind::NotFound),
        CreateStreamErrorKind::TimedOut => Some(TransportErrorKind::DeadlineExceeded),
        CreateStreamErrorKind::JetStreamUnavailable => Some(TransportErrorKind::Unavailable),
        CreateStreamErrorKind::EmptyStreamName | CreateStreamErrorKind::InvalidStreamName => {
            Some(TransportErrorKind::InvalidArgument)
        }
        _ => None,
    };
    typed(kind, error)
}

fn consumer_error(error: ConsumerError) -> TransportError {
    let kind = match error.kind() {
        ConsumerErrorKind::JetStream(e) => code_kind(e.error_code()),
        ConsumerErrorKind::TimedOut => Some(TransportErrorKind::DeadlineExceeded),
        ConsumerErrorKind::InvalidName => Some(TransportErrorKind::InvalidArgument),
        _ => None,
    };
    typed(kind, error)
}

fn consumer_info_error(error: ConsumerInfoError) -> TransportError {
    let kind = match error.kind() {
        ConsumerInfoErrorKind::NotFound | ConsumerInfoErrorKind::StreamNotFound => {
            Some(TransportErrorKind::NotFound)
        }
        ConsumerInfoErrorKind::TimedOut => Some(TransportErrorKind::DeadlineExceeded),
        ConsumerInfoErrorKind::NoResponders | ConsumerInfoErrorKind::Offline => {
            Some(TransportErrorKind::Unavailable)
        }
        ConsumerInfoErrorKind::InvalidName => Some(TransportErrorKind::InvalidArgument),
        ConsumerInfoErrorKind::JetStream(e) => code_kind(e.error_code()),
        _ => None,
    };
    typed(kind, error)
}

/// `get_consumer` boxes its error; recover the typed one when possible
fn get_consumer_error(error: async_nats::Error) -> TransportError {
    match error.downcast::<ConsumerInfoError>() {
        Ok(info) => consumer_info_error(*info),
        Err(other) => classify(other),
    }
}

/// Attribute keys in this namespace are interpreted by the server
const RESERVED_HEADER_PREFIX: &str = "nats-";

/// Attributes as headers; keys and values that cannot be carried verbatim
/// are rejected
fn to_headers(attributes: &Attributes) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (key, value) in attributes {
        if key.is_empty()
            || key
                .get(..RESERVED_HEADER_PREFIX.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(RESERVED_HEADER_PREFIX))
        {
            return Err(TransportError::invalid_argument(format!(
                "attribute key {key:?} is not allowed"
            )));
        }

        let name = HeaderName::from_str(key).map_err(|_| {
            TransportError::invalid_argument(format!(
                "attribute key {key:?} is not a valid header name"
            ))
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            TransportError::invalid_argument(format!(
                "attribute {key:?} has a value with line breaks"
            ))
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn to_attributes(headers: Option<&HeaderMap>) -> Attributes {
    let mut attributes = Attributes::new();
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            if let Some(value) = values.last() {
                attributes.insert(name.to_string(), value.to_string());
            }
        }
    }
    attributes
}

#[async_trait]
impl Transport for JetStreamTransport {
    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError> {
        self.ensure_open()?;
        match self.jetstream.get_stream(self.stream_name(topic)).await {
            Ok(_) => Ok(true),
            Err(e) => match get_stream_error(e) {
                e if e.kind() == TransportErrorKind::NotFound => Ok(false),
                e => Err(e),
            },
        }
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        let config = jetstream::stream::Config {
            name: self.stream_name(&spec.id),
            subjects: vec![self.subject(&spec.id)],
            retention: RetentionPolicy::Limits,
            max_age: spec.retention.unwrap_or_default(),
            storage: StorageType::File,
            ..Default::default()
        };

        self.jetstream
            .create_stream(config)
            .await
            .map_err(create_stream_error)?;

        info!(topic = %spec.id, stream = %self.stream_name(&spec.id), "Created stream");
        Ok(())
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, TransportError> {
        self.ensure_open()?;
        Ok(self.lookup(subscription).await?.is_some())
    }

    async fn create_subscription(&self, spec: &SubscriptionSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        if let Some(filter) = spec.filter.as_deref() {
            Filter::parse(filter).map_err(|e| TransportError::invalid_argument(e.to_string()))?;
        }

        let stream_name = self.stream_name(&spec.topic);
        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(get_stream_error)?;

        let consumer = token(&spec.id);
        let ack_wait = spec.ack_deadline.unwrap_or(MIN_ACK_DEADLINE);
        let mut config = pull::Config {
            durable_name: Some(consumer.clone()),
            filter_subject: self.subject(&spec.topic),
            ack_policy: AckPolicy::Explicit,
            ack_wait,
            deliver_policy: DeliverPolicy::New,
            ..Default::default()
        };
        if spec.enable_ordering {
            config.max_ack_pending = 1;
        }

        stream.create_consumer(config).await.map_err(consumer_error)?;

        let record = SubscriptionRecord {
            topic: spec.topic.clone(),
            stream: stream_name,
            consumer,
            filter: spec.filter.clone(),
            enable_ordering: spec.enable_ordering,
            retain_acked: spec.retain_acked,
            ack_wait_ms: ack_wait.as_millis() as u64,
        };
        let encoded = serde_json::to_vec(&record)
            .map_err(|e| TransportError::new(TransportErrorKind::Unknown, e))?;
        self.registry
            .put(token(&spec.id), encoded.into())
            .await
            .map_err(classify)?;

        info!(subscription = %spec.id, topic = %spec.topic, ?ack_wait, "Created consumer");
        Ok(())
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

        let subject = self.subject(topic);
        let headers = to_headers(&message.attributes)?;

        let pending = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, message.data)
            .await
            .map_err(publish_error)?;

        let ack = tokio::time::timeout(settings.timeout, pending)
            .await
            .map_err(|_| {
                TransportError::deadline_exceeded(format!(
                    "publish to '{subject}' not acknowledged within {:?}",
                    settings.timeout
                ))
            })?
            .map_err(publish_error)?;

        debug!(subject, stream = %ack.stream, seq = ack.sequence, "Publish acknowledged");
        Ok(PublishAck {
            message_id: ack.sequence.to_string(),
        })
    }

    async fn stream_receive(
        &self,
        subscription: &str,
        settings: &ReceiveSettings,
    ) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;

        let record = self.lookup(subscription).await?.ok_or_else(|| {
            TransportError::not_found(format!("Subscription not found: {subscription}"))
        })?;

        let filter = record
            .filter
            .as_deref()
            .map(Filter::parse)
            .transpose()
            .map_err(|e| TransportError::invalid_argument(e.to_string()))?;

        let stream = self
            .jetstream
            .get_stream(&record.stream)
            .await
            .map_err(get_stream_error)?;
        let consumer: Consumer<pull::Config> = stream
            .get_consumer(&record.consumer)
            .await
            .map_err(get_consumer_error)?;

        // Never prefetch more than the caller may hold unsettled.
        let mut builder = consumer.stream();
        if let Some(max) = settings.max_outstanding_messages {
            builder = builder.max_messages_per_batch(max);
        }
        if let Some(max) = settings.max_outstanding_bytes {
            builder = builder.max_bytes_per_batch(max);
        }
        let messages = builder.messages().await.map_err(classify)?;

        info!(
            subscription,
            stream = %record.stream,
            ack_wait = ?record.ack_wait(),
            "Opened JetStream pull stream"
        );

        let state = PullState {
            messages: messages.boxed(),
            filter,
            limits: Limits::new(settings),
            extension: settings
                .extension_interval(record.ack_wait())
                .map(|interval| (interval, settings.max_extension)),
            closed: self.closed.subscribe(),
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
        !*self.closed.borrow()
            && matches!(
                self.client.connection_state(),
                async_nats::connection::State::Connected
            )
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        info!("Draining NATS connection");
        self.client.drain().await.map_err(classify)
    }
}

/// Caps on unsettled deliveries for one pull stream
struct Limits {
    message_slots: Option<Arc<Semaphore>>,
    byte_budget: Option<(Arc<Semaphore>, usize)>,
}

impl Limits {
    fn new(settings: &ReceiveSettings) -> Self {
        Self {
            message_slots: settings
                .max_outstanding_messages
                .map(|max| Arc::new(Semaphore::new(max.min(Semaphore::MAX_PERMITS)))),
            byte_budget: settings.max_outstanding_bytes.map(|max| {
                let max = max.min(u32::MAX as usize);
                (Arc::new(Semaphore::new(max)), max)
            }),
        }
    }

    async fn slot(&self) -> Option<Option<OwnedSemaphorePermit>> {
        match &self.message_slots {
            Some(slots) => Arc::clone(slots).acquire_owned().await.ok().map(Some),
            None => Some(None),
        }
    }

    async fn bytes(&self, len: usize) -> Option<Option<OwnedSemaphorePermit>> {
        match &self.byte_budget {
            Some((budget, max)) => Arc::clone(budget)
                .acquire_many_owned(len.min(*max) as u32)
                .await
                .ok()
                .map(Some),
            None => Some(None),
        }
    }
}

struct PullState {
    messages: BoxStream<'static, Result<jetstream::Message, MessagesError>>,
    filter: Option<Filter>,
    limits: Limits,
    /// Interval between progress acks and the total extension allowed
    extension: Option<(Duration, Duration)>,
    closed: watch::Receiver<bool>,
}

impl PullState {
    /// Next matching message; `Ok(None)` once the transport is closed
    async fn next_delivery(&mut self) -> Result<Option<ReceivedMessage>, TransportError> {
        loop {
            let Some(slot) = self.limits.slot().await else {
                return Ok(None);
            };

            let messages = &mut self.messages;
            let closed = &mut self.closed;
            let item = tokio::select! {
                item = messages.next() => item,
                _ = closed.wait_for(|closed| *closed) => return Ok(None),
            };
            let Some(item) = item else {
                return Ok(None);
            };
            let message = item.map_err(classify)?;

            let attributes = to_attributes(message.message.headers.as_ref());
            if self
                .filter
                .as_ref()
                .is_some_and(|f| !f.matches(&attributes))
            {
                if let Err(e) = message.ack().await {
                    warn!(error = %e, "Failed to acknowledge filtered message");
                }
                continue;
            }

            let Some(bytes) = self.limits.bytes(message.message.payload.len()).await else {
                return Ok(None);
            };

            let lease = Lease {
                _slot: slot,
                _bytes: bytes,
            };
            return Ok(Some(self.delivery(message, attributes, lease)));
        }
    }

    fn delivery(
        &self,
        message: jetstream::Message,
        attributes: Attributes,
        lease: Lease,
    ) -> ReceivedMessage {
        let (id, attempt, publish_time) = match message.info() {
            Ok(info) => (
                info.stream_sequence.to_string(),
                u32::try_from(info.delivered).ok(),
                Some(SystemTime::from(info.published)),
            ),
            Err(_) => (Uuid::new_v4().to_string(), None, None),
        };
        let data = message.message.payload.clone();

        let message = Arc::new(message);
        let extender = self.extension.map(|(interval, max_extension)| {
            spawn_extender(Arc::clone(&message), interval, max_extension)
        });

        let mut received = ReceivedMessage::new(
            id,
            data,
            attributes,
            Box::new(JetStreamAcker {
                message,
                extender,
                settled: AtomicBool::new(false),
                lease: Mutex::new(Some(lease)),
            }),
        );
        if let Some(attempt) = attempt {
            received = received.with_delivery_attempt(attempt);
        }
        if let Some(publish_time) = publish_time {
            received = received.with_publish_time(publish_time);
        }
        received
    }
}

/// Keep the lease alive with progress acks until `max_extension` elapses
fn spawn_extender(
    message: Arc<jetstream::Message>,
    interval: Duration,
    max_extension: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval_at(start + interval, interval);

        loop {
            let tick = ticker.tick().await;
            if tick.duration_since(start) >= max_extension {
                break;
            }
            if let Err(e) = message.ack_with(AckKind::Progress).await {
                debug!(error = %e, "Lease extension failed");
                break;
            }
        }
    })
}

/// Flow-control permits held until the message is settled
struct Lease {
    _slot: Option<OwnedSemaphorePermit>,
    _bytes: Option<OwnedSemaphorePermit>,
}

struct JetStreamAcker {
    message: Arc<jetstream::Message>,
    extender: Option<JoinHandle<()>>,
    settled: AtomicBool,
    lease: Mutex<Option<Lease>>,
}

impl JetStreamAcker {
    /// True only for the first settle call
    fn settle(&self) -> bool {
        if let Some(extender) = &self.extender {
            extender.abort();
        }
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        !self.settled.swap(true, Ordering::SeqCst)
    }
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        if !self.settle() {
            return Ok(());
        }
        self.message.ack().await.map_err(classify)
    }

    async fn nack(&self) -> Result<(), TransportError> {
        if !self.settle() {
            return Ok(());
        }
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(classify)
    }
}

impl Drop for JetStreamAcker {
    fn drop(&mut self) {
        // Unsettled messages are redelivered by the server once ack_wait passes.
        if let Some(extender) = &self.extender {
            extender.abort();
        }
    }
}
