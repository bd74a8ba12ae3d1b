//! Configuration
//!
//! `Config` describes how a client reaches the service. `RelayConfig` wraps it
//! with what the relay binary provisions and serves, loaded from `RELAY_*`
//! environment variables (nested keys joined with `__`), e.g.
//!
//! ```text
//! RELAY_TOPIC=guild-events
//! RELAY_SUBSCRIPTION=guild-events-audit
//! RELAY_PUBSUB__PROJECT_ID=arrakis
//! RELAY_PUBSUB__SERVERS=nats://nats:4222
//! RELAY_PUBSUB__OPTIONS__PUBLISH__AUTO_ORIGINATED_AT=true
//! RELAY_PUBSUB__OPTIONS__RECEIVE__MAX_OUTSTANDING_MESSAGES=100
//! ```

use crate::error::PubSubError;
use crate::options::Options;
use crate::resources::{SubscriptionSettings, TopicSpec};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default NATS endpoint for remote mode
pub const DEFAULT_SERVERS: &str = "nats://localhost:4222";

fn default_servers() -> String {
    DEFAULT_SERVERS.to_string()
}

fn default_http_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Client connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Project the topics and subscriptions belong to
    pub project_id: String,

    /// Run against the in-process transport instead of a server
    #[serde(default)]
    pub is_local: bool,

    /// NATS credentials file; ambient (anonymous) connection when absent
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,

    /// NATS server URL(s), comma-separated
    #[serde(default = "default_servers")]
    pub servers: String,

    /// Publish and receive options shared by every call
    #[serde(default)]
    pub options: Options,
}

impl Config {
    /// Remote configuration with default servers and options
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            is_local: false,
            credentials_file: None,
            servers: default_servers(),
            options: Options::default(),
        }
    }

    /// Configuration for the in-process transport
    pub fn local(project_id: impl Into<String>) -> Self {
        Self {
            is_local: true,
            ..Self::new(project_id)
        }
    }

    pub fn with_servers(mut self, servers: impl Into<String>) -> Self {
        self.servers = servers.into();
        self
    }

    pub fn with_credentials_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_file = Some(path.into());
        self
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> Result<(), PubSubError> {
        if self.project_id.trim().is_empty() {
            return Err(PubSubError::Config("project_id must be set".to_string()));
        }
        if !self.is_local && self.servers.trim().is_empty() {
            return Err(PubSubError::Config(
                "servers must be set unless is_local is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Relay binary configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Client connection
    pub pubsub: Config,

    /// Topic to provision
    pub topic: String,

    /// Topic retention in seconds (capped at 7 days)
    #[serde(default)]
    pub topic_retention_secs: Option<u64>,

    /// Subscription to provision and receive from
    pub subscription: String,

    /// Optional filter expression for the subscription
    #[serde(default)]
    pub subscription_filter: String,

    #[serde(default)]
    pub enable_ordering: bool,

    #[serde(default)]
    pub retain_acked: bool,

    /// Publish a startup announcement after provisioning
    #[serde(default)]
    pub announce: bool,

    /// Health/metrics HTTP port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl RelayConfig {
    /// Load configuration from `.env` and the process environment
    pub fn from_env() -> Result<Self, PubSubError> {
        dotenvy::dotenv().ok();
        Self::load(None)
    }

    /// Load configuration from an explicit set of `RELAY_*` variables
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, PubSubError> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<HashMap<String, String>>) -> Result<Self, PubSubError> {
        let environment = config::Environment::with_prefix("RELAY")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(vars.map(|vars| vars.into_iter().collect()));

        let relay: RelayConfig = config::Config::builder()
            .add_source(environment)
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| PubSubError::Config(e.to_string()))?;

        relay.validate()?;
        Ok(relay)
    }

    pub fn validate(&self) -> Result<(), PubSubError> {
        self.pubsub.validate()?;
        if self.topic.trim().is_empty() {
            return Err(PubSubError::Config("RELAY_TOPIC must be set".to_string()));
        }
        if self.subscription.trim().is_empty() {
            return Err(PubSubError::Config(
                "RELAY_SUBSCRIPTION must be set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn topic_spec(&self) -> TopicSpec {
        let spec = TopicSpec::new(&self.topic);
        match self.topic_retention_secs {
            Some(secs) => spec.with_retention(Duration::from_secs(secs)),
            None => spec,
        }
    }

    pub fn subscription_settings(&self) -> SubscriptionSettings {
        SubscriptionSettings {
            enable_ordering: self.enable_ordering,
            retain_acked: self.retain_acked,
            ack_deadline: None,
        }
    }
}
