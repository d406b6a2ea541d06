//! Relay configuration
//!
//! Read from the environment once per invocation. Nothing here is validated
//! beyond parsing; absent destination settings surface later as
//! `PubSubClientError` when the client is set up.

use crate::error::RelayError;
use std::env;
use std::time::Duration;

pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HOST_MARGIN: Duration = Duration::from_millis(500);

/// How the publish deadline relates to the host's remaining time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadlineMode {
    /// Fixed ceiling measured from the start of the publish stage
    #[default]
    Fixed,
    /// Ceiling, shortened to fit inside the host's remaining budget
    HostBounded,
}

impl std::str::FromStr for DeadlineMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(DeadlineMode::Fixed),
            "host-bounded" | "host_bounded" => Ok(DeadlineMode::HostBounded),
            other => Err(RelayError::Config(format!(
                "invalid PUBLISH_DEADLINE_MODE '{}': expected 'fixed' or 'host-bounded'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DeadlineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadlineMode::Fixed => write!(f, "fixed"),
            DeadlineMode::HostBounded => write!(f, "host-bounded"),
        }
    }
}

/// Per-invocation relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Destination topic, short id or `projects/*/topics/*`
    pub topic_id: Option<String>,
    /// Destination GCP project
    pub project_id: Option<String>,
    /// External-account credential file for Workload Identity Federation
    pub credentials_path: Option<String>,
    /// Source-cloud region override (SDK default chain otherwise)
    pub aws_region: Option<String>,
    pub pubsub_endpoint: String,
    pub publish_timeout: Duration,
    pub deadline_mode: DeadlineMode,
    /// Reserve kept before the host deadline in host-bounded mode
    pub host_margin: Duration,
    /// Stamp `timestamp` on outbound messages
    pub stamp_timestamp: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic_id: None,
            project_id: None,
            credentials_path: None,
            aws_region: None,
            pubsub_endpoint: DEFAULT_PUBSUB_ENDPOINT.to_string(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            deadline_mode: DeadlineMode::Fixed,
            host_margin: DEFAULT_HOST_MARGIN,
            stamp_timestamp: false,
        }
    }
}

impl RelayConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let publish_timeout = match get("PUBLISH_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_number(&raw, "PUBLISH_TIMEOUT_SECS")?),
            None => defaults.publish_timeout,
        };

        let host_margin = match get("HOST_DEADLINE_MARGIN_MS") {
            Some(raw) => Duration::from_millis(parse_number(&raw, "HOST_DEADLINE_MARGIN_MS")?),
            None => defaults.host_margin,
        };

        let deadline_mode: DeadlineMode = match get("PUBLISH_DEADLINE_MODE") {
            Some(raw) => raw.parse()?,
            None => defaults.deadline_mode,
        };

        let stamp_timestamp = match get("RELAY_STAMP_TIMESTAMP") {
            Some(raw) => parse_flag(&raw, "RELAY_STAMP_TIMESTAMP")?,
            None => defaults.stamp_timestamp,
        };

        Ok(Self {
            topic_id: get("PUBSUB_TOPIC_ID"),
            project_id: get("GCP_PROJECT_ID"),
            credentials_path: get("GOOGLE_APPLICATION_CREDENTIALS"),
            aws_region: get("AWS_REGION"),
            pubsub_endpoint: get("PUBSUB_ENDPOINT").unwrap_or(defaults.pubsub_endpoint),
            publish_timeout,
            deadline_mode,
            host_margin,
            stamp_timestamp,
        })
    }
}

fn parse_number(raw: &str, key: &str) -> Result<u64, RelayError> {
    raw.trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("invalid {} '{}': expected an integer", key, raw)))
}

fn parse_flag(raw: &str, key: &str) -> Result<bool, RelayError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RelayError::Config(format!(
            "invalid {} '{}': expected a boolean",
            key, raw
        ))),
    }
}
