//! Topic and subscription declarations
//!
//! Callers declare the resources they need; provisioning creates whatever is
//! absent and never touches what already exists.

use serde::Deserialize;
use std::time::Duration;

/// Longest retention a topic may be created with (7 days)
pub const MAX_TOPIC_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Shortest ack deadline a subscription accepts
pub const MIN_ACK_DEADLINE: Duration = Duration::from_secs(10);

/// Longest ack deadline a subscription accepts
pub const MAX_ACK_DEADLINE: Duration = Duration::from_secs(600);

/// Declared topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub id: String,
    /// Message retention; `None` keeps the service default
    pub retention: Option<Duration>,
}

impl TopicSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            retention: None,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Retention truncated to [`MAX_TOPIC_RETENTION`]
    pub fn effective_retention(&self) -> Option<Duration> {
        self.retention.map(|r| r.min(MAX_TOPIC_RETENTION))
    }

    /// Copy of this spec with its retention truncated
    pub fn clamped(&self) -> Self {
        Self {
            id: self.id.clone(),
            retention: self.effective_retention(),
        }
    }
}

/// Settings shared by every subscription created in one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    /// Deliver messages in publish order
    pub enable_ordering: bool,
    /// Keep acknowledged messages for the topic's retention window
    pub retain_acked: bool,
    /// Ack deadline; clamped into 10..=600 seconds
    #[serde(skip)]
    pub ack_deadline: Option<Duration>,
}

impl SubscriptionSettings {
    pub fn ordered() -> Self {
        Self {
            enable_ordering: true,
            ..Self::default()
        }
    }

    pub fn with_retain_acked(mut self, retain: bool) -> Self {
        self.retain_acked = retain;
        self
    }

    pub fn with_ack_deadline(mut self, deadline: Duration) -> Self {
        self.ack_deadline = Some(deadline);
        self
    }
}

/// Declared subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub id: String,
    pub topic: String,
    /// Filter expression; only set when a non-empty filter was supplied
    pub filter: Option<String>,
    pub enable_ordering: bool,
    pub retain_acked: bool,
    pub ack_deadline: Option<Duration>,
}

impl SubscriptionSpec {
    /// Build the configuration for one subscription of `topic`.
    ///
    /// An empty `filter` means "no filter". Anything else, whitespace
    /// included, is passed to the transport as given.
    pub fn new(
        topic: impl Into<String>,
        id: impl Into<String>,
        filter: &str,
        settings: &SubscriptionSettings,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            filter: (!filter.is_empty()).then(|| filter.to_string()),
            enable_ordering: settings.enable_ordering,
            retain_acked: settings.retain_acked,
            ack_deadline: settings
                .ack_deadline
                .map(|d| d.clamp(MIN_ACK_DEADLINE, MAX_ACK_DEADLINE)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn retention_above_seven_days_is_truncated() {
        let spec = TopicSpec::new("orders").with_retention(DAY * 30);
        assert_eq!(spec.effective_retention(), Some(DAY * 7));
        assert_eq!(spec.clamped().retention, Some(MAX_TOPIC_RETENTION));
    }

    #[test]
    fn retention_within_bound_is_kept() {
        let spec = TopicSpec::new("orders").with_retention(DAY * 3);
        assert_eq!(spec.effective_retention(), Some(DAY * 3));
    }

    #[test]
    fn absent_retention_stays_absent() {
        assert_eq!(TopicSpec::new("orders").clamped().retention, None);
    }

    #[test]
    fn empty_filter_is_not_set() {
        let spec = SubscriptionSpec::new("orders", "orders-all", "", &Default::default());
        assert_eq!(spec.filter, None);

    }

    #[test]
    fn blank_filter_is_kept_verbatim() {
        let spec = SubscriptionSpec::new("orders", "orders-all", "   ", &Default::default());
        assert_eq!(spec.filter.as_deref(), Some("   "));
    }

    #[test]
    fn subscription_spec_carries_settings() {
        let settings = SubscriptionSettings::ordered()
            .with_retain_acked(true)
            .with_ack_deadline(Duration::from_secs(2));
        let spec = SubscriptionSpec::new(
            "orders",
            "orders-eu",
            r#"attributes.region = "eu""#,
            &settings,
        );

        assert_eq!(spec.topic, "orders");
        assert_eq!(spec.filter.as_deref(), Some(r#"attributes.region = "eu""#));
        assert!(spec.enable_ordering);
        assert!(spec.retain_acked);
        assert_eq!(spec.ack_deadline, Some(MIN_ACK_DEADLINE));
    }
}
