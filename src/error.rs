//! Relay error taxonomy
//!
//! Every failure in the cycle is caught at its stage and classified into one
//! of these variants. None of them is retried inside an invocation.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during a relay invocation
#[derive(Debug, Error)]
pub enum RelayError {
    /// Source-cloud config or credential resolution failed
    #[error("Failed to load AWS config: {0}")]
    Config(String),

    /// Credentials resolved but the identity check was rejected
    #[error("Failed to get caller identity: {0}")]
    Identity(String),

    /// Outbound payload could not be encoded
    #[error("Failed to marshal message data: {0}")]
    Serialization(String),

    /// Destination client or connection setup failed
    #[error("Failed to create Pub/Sub client: {0}")]
    PubSubClient(String),

    /// Broker rejected or failed the publish call
    #[error("Failed to publish message: {0}")]
    Publish(String),

    /// No acknowledgment before the publish deadline; delivery is unknown
    #[error("Failed to publish message: no acknowledgment within {0:?}")]
    PublishTimeout(Duration),
}

impl RelayError {
    /// Classified kind reported to the orchestrator
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Config(_) => ErrorKind::ConfigError,
            RelayError::Identity(_) => ErrorKind::IdentityError,
            RelayError::Serialization(_) => ErrorKind::SerializationError,
            RelayError::PubSubClient(_) => ErrorKind::PubSubClientError,
            RelayError::Publish(_) | RelayError::PublishTimeout(_) => ErrorKind::PublishError,
        }
    }

    /// True when the deadline elapsed before the broker answered
    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::PublishTimeout(_))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

/// Wire-level error class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ConfigError,
    IdentityError,
    #[serde(rename = "JSONMarshalError")]
    SerializationError,
    PubSubClientError,
    PublishError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "ConfigError",
            ErrorKind::IdentityError => "IdentityError",
            ErrorKind::SerializationError => "JSONMarshalError",
            ErrorKind::PubSubClientError => "PubSubClientError",
            ErrorKind::PublishError => "PublishError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
