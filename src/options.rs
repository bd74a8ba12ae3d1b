//! Client options and tuning settings
//!
//! Callers describe tuning with `*Options` records whose fields are all
//! optional: an absent field means "use the default", a present field is
//! honored as given (including zero). Before every publish or receive the
//! options are resolved into concrete `*Settings` that transports consume.

use serde::Deserialize;
use std::time::Duration;

/// Publish defaults
pub mod publish_defaults {
    use std::time::Duration;

    /// Concurrent in-flight publish requests
    pub const CONCURRENCY: usize = 25;
    /// Time allowed for the service to acknowledge a publish
    pub const TIMEOUT: Duration = Duration::from_secs(60);
    /// Largest payload the publisher will buffer
    pub const BUFFERED_BYTE_LIMIT: usize = 100_000_000;
}

/// Receive defaults
pub mod receive_defaults {
    use std::time::Duration;

    /// Unsettled messages allowed at once
    pub const MAX_OUTSTANDING_MESSAGES: usize = 1000;
    /// Unsettled payload bytes allowed at once
    pub const MAX_OUTSTANDING_BYTES: usize = 1_000_000_000;
    /// Messages forwarded to the sink concurrently
    pub const CONCURRENCY: usize = 10;
    /// Total time a lease is extended before the message is left to redeliver
    pub const MAX_EXTENSION: Duration = Duration::from_secs(60 * 60);
    /// Upper bound between lease extensions
    pub const MAX_EXTENSION_PERIOD: Duration = Duration::from_secs(60);
    /// Lower bound between lease extensions
    pub const MIN_EXTENSION_PERIOD: Duration = Duration::from_secs(10);
}

/// Optional durations expressed as milliseconds in configuration sources
mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Publish-time options
///
/// Recognized options:
/// - `auto_originated_at`: stamp `OriginatedAt` on messages that lack it
/// - `concurrency`: in-flight publish requests (minimum 1)
/// - `timeout`: time allowed for the publish acknowledgment
/// - `buffered_byte_limit`: largest payload accepted for buffering
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    pub auto_originated_at: bool,
    pub concurrency: Option<usize>,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Option<Duration>,
    pub buffered_byte_limit: Option<usize>,
}

impl PublishOptions {
    /// Options with auto-stamping enabled and every tuning field defaulted
    pub fn stamped() -> Self {
        Self {
            auto_originated_at: true,
            ..Self::default()
        }
    }

    /// Enable or disable `OriginatedAt` auto-stamping
    pub fn with_auto_originated_at(mut self, auto: bool) -> Self {
        self.auto_originated_at = auto;
        self
    }

    /// Cap the publish requests in flight at once
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Set the publish acknowledgment timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve present fields over the publish defaults
    pub fn resolve(&self) -> PublishSettings {
        PublishSettings {
            concurrency: self
                .concurrency
                .unwrap_or(publish_defaults::CONCURRENCY)
                .max(1),
            timeout: self.timeout.unwrap_or(publish_defaults::TIMEOUT),
            buffered_byte_limit: self
                .buffered_byte_limit
                .unwrap_or(publish_defaults::BUFFERED_BYTE_LIMIT),
        }
    }
}

/// Concrete publish settings handed to the transport with every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishSettings {
    pub concurrency: usize,
    pub timeout: Duration,
    pub buffered_byte_limit: usize,
}

impl Default for PublishSettings {
    fn default() -> Self {
        PublishOptions::default().resolve()
    }
}

/// Receive-time options
///
/// Recognized options:
/// - `max_outstanding_messages`: caps unsettled messages (`0` = unbounded)
/// - `max_outstanding_bytes`: caps unsettled payload bytes (`0` = unbounded)
/// - `concurrency`: messages forwarded to the sink at once (minimum 1)
/// - `max_extension`: total lease extension per message (`0` = never extend)
/// - `max_extension_period` / `min_extension_period`: bounds on the interval
///   between lease extensions
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReceiveOptions {
    pub max_outstanding_messages: Option<usize>,
    pub max_outstanding_bytes: Option<usize>,
    pub concurrency: Option<usize>,
    #[serde(rename = "max_extension_ms", with = "duration_ms")]
    pub max_extension: Option<Duration>,
    #[serde(rename = "max_extension_period_ms", with = "duration_ms")]
    pub max_extension_period: Option<Duration>,
    #[serde(rename = "min_extension_period_ms", with = "duration_ms")]
    pub min_extension_period: Option<Duration>,
}

impl ReceiveOptions {
    /// Cap the number of unsettled messages
    pub fn with_max_outstanding_messages(mut self, max: usize) -> Self {
        self.max_outstanding_messages = Some(max);
        self
    }

    /// Cap the number of unsettled payload bytes
    pub fn with_max_outstanding_bytes(mut self, max: usize) -> Self {
        self.max_outstanding_bytes = Some(max);
        self
    }

    /// Set the dispatch fan-out
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Resolve present fields over the receive defaults.
    ///
    /// Streaming delivery is always selected, whatever the caller asked for.
    pub fn resolve(&self) -> ReceiveSettings {
        let min_extension_period = self
            .min_extension_period
            .unwrap_or(receive_defaults::MIN_EXTENSION_PERIOD);
        let max_extension_period = self
            .max_extension_period
            .unwrap_or(receive_defaults::MAX_EXTENSION_PERIOD)
            .max(min_extension_period);

        ReceiveSettings {
            max_outstanding_messages: cap(
                self.max_outstanding_messages,
                receive_defaults::MAX_OUTSTANDING_MESSAGES,
            ),
            max_outstanding_bytes: cap(
                self.max_outstanding_bytes,
                receive_defaults::MAX_OUTSTANDING_BYTES,
            ),
            concurrency: self
                .concurrency
                .unwrap_or(receive_defaults::CONCURRENCY)
                .max(1),
            max_extension: self
                .max_extension
                .unwrap_or(receive_defaults::MAX_EXTENSION),
            max_extension_period,
            min_extension_period,
            synchronous: false,
        }
    }
}

/// `None` falls back to the default, `Some(0)` lifts the cap
fn cap(requested: Option<usize>, default: usize) -> Option<usize> {
    match requested {
        None => Some(default),
        Some(0) => None,
        Some(max) => Some(max),
    }
}

/// Concrete receive settings handed to the transport when a stream opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSettings {
    /// `None` means unbounded
    pub max_outstanding_messages: Option<usize>,
    /// `None` means unbounded
    pub max_outstanding_bytes: Option<usize>,
    pub concurrency: usize,
    pub max_extension: Duration,
    pub max_extension_period: Duration,
    pub min_extension_period: Duration,
    /// Always false: delivery uses the streaming path
    pub synchronous: bool,
}

impl ReceiveSettings {
    /// Interval between lease extensions for a subscription whose ack
    /// deadline is `ack_wait`, or `None` when extension is disabled.
    ///
    /// Half the deadline, clamped into the extension period bounds, and
    /// always short of the deadline itself so the lease never lapses between
    /// two extensions.
    pub fn extension_interval(&self, ack_wait: Duration) -> Option<Duration> {
        if self.max_extension.is_zero() || ack_wait.is_zero() {
            return None;
        }

        let half = ack_wait / 2;
        let interval = half
            .max(self.min_extension_period)
            .min(self.max_extension_period)
            .min(half);
        (!interval.is_zero()).then_some(interval)
    }
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        ReceiveOptions::default().resolve()
    }
}

/// Client-wide options, fixed at construction and shared by reference
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    pub publish: PublishOptions,
    pub receive: ReceiveOptions,
}

impl Options {
    /// Default options: no auto-stamping, service defaults everywhere
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable `OriginatedAt` auto-stamping on publish
    pub fn with_auto_originated_at(mut self, auto: bool) -> Self {
        self.publish.auto_originated_at = auto;
        self
    }

    /// Replace the publish options
    pub fn with_publish(mut self, publish: PublishOptions) -> Self {
        self.publish = publish;
        self
    }

    /// Replace the receive options
    pub fn with_receive(mut self, receive: ReceiveOptions) -> Self {
        self.receive = receive;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_stamping_is_opt_in() {
        assert!(!Options::new().publish.auto_originated_at);
        assert!(Options::new().with_auto_originated_at(true).publish.auto_originated_at);
        assert!(PublishOptions::stamped().auto_originated_at);
    }

    #[test]
    fn empty_publish_options_resolve_to_defaults() {
        let settings = PublishOptions::default().resolve();
        assert_eq!(settings.concurrency, publish_defaults::CONCURRENCY);
        assert_eq!(settings.timeout, publish_defaults::TIMEOUT);
        assert_eq!(settings, PublishSettings::default());
    }

    #[test]
    fn present_publish_fields_override() {
        let settings = PublishOptions {
            concurrency: Some(0),
            timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        }
        .resolve();

        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.timeout, Duration::from_secs(5));
        assert_eq!(
            settings.buffered_byte_limit,
            publish_defaults::BUFFERED_BYTE_LIMIT
        );
    }

    #[test]
    fn receive_defaults_apply_to_absent_fields() {
        let settings = ReceiveOptions::default()
            .with_max_outstanding_messages(5)
            .resolve();

        assert_eq!(settings.max_outstanding_messages, Some(5));
        assert_eq!(
            settings.max_outstanding_bytes,
            Some(receive_defaults::MAX_OUTSTANDING_BYTES)
        );
        assert_eq!(settings.concurrency, receive_defaults::CONCURRENCY);
        assert_eq!(settings.max_extension, receive_defaults::MAX_EXTENSION);
    }

    #[test]
    fn explicit_zero_is_not_treated_as_unset() {
        let settings = ReceiveOptions {
            max_outstanding_messages: Some(0),
            max_outstanding_bytes: Some(0),
            max_extension: Some(Duration::ZERO),
            ..Default::default()
        }
        .resolve();

        assert_eq!(settings.max_outstanding_messages, None);
        assert_eq!(settings.max_outstanding_bytes, None);
        assert_eq!(settings.max_extension, Duration::ZERO);
        assert_eq!(settings.extension_interval(Duration::from_secs(10)), None);
    }

    #[test]
    fn concurrency_is_at_least_one() {
        let settings = ReceiveOptions::default().with_concurrency(0).resolve();
        assert_eq!(settings.concurrency, 1);
    }

    #[test]
    fn streaming_is_always_forced() {
        assert!(!ReceiveOptions::default().resolve().synchronous);
        assert!(!ReceiveSettings::default().synchronous);
    }

    #[test]
    fn extension_period_never_below_minimum() {
        let settings = ReceiveOptions {
            max_extension_period: Some(Duration::from_secs(1)),
            min_extension_period: Some(Duration::from_secs(5)),
            ..Default::default()
        }
        .resolve();

        assert_eq!(settings.max_extension_period, Duration::from_secs(5));
        assert_eq!(
            settings.extension_interval(Duration::from_secs(60)),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn extension_interval_stays_inside_the_ack_deadline() {
        let settings = ReceiveSettings::default();

        // Default bounds are 10s..60s; a 10s deadline still gets extended at 5s.
        assert_eq!(
            settings.extension_interval(Duration::from_secs(10)),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            settings.extension_interval(Duration::from_secs(30)),
            Some(Duration::from_secs(15))
        );
        assert_eq!(
            settings.extension_interval(Duration::from_secs(600)),
            Some(receive_defaults::MAX_EXTENSION_PERIOD)
        );
        assert_eq!(settings.extension_interval(Duration::ZERO), None);
    }

    #[test]
    fn options_deserialize_from_json() {
        let options: Options = serde_json::from_value(serde_json::json!({
            "publish": { "auto_originated_at": true, "timeout_ms": 1500 },
            "receive": { "max_outstanding_messages": 0, "concurrency": 4 }
        }))
        .unwrap();

        assert!(options.publish.auto_originated_at);
        assert_eq!(options.publish.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.receive.max_outstanding_messages, Some(0));
        assert_eq!(options.receive.concurrency, Some(4));
        assert_eq!(options.receive.max_extension, None);
    }
}
