//! Outbound message construction
//!
//! Pure mapping from the inbound event to the Pub/Sub payload. The only
//! failure path is encoding.

use crate::error::RelayError;
use crate::event::InboundEvent;
use serde::{Deserialize, Serialize};

/// Provenance tag stamped on every outbound message
pub const SOURCE_TAG: &str = "aws_step_function";

/// Payload published to the destination topic
///
/// Field order here is the field order on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub custom_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub source: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_time: Option<String>,
}

impl OutboundMessage {
    /// Encode as UTF-8 JSON for the broker
    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    stamp_timestamp: bool,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp an RFC 3339 `timestamp` at build time
    pub fn stamp_timestamp(mut self, enabled: bool) -> Self {
        self.stamp_timestamp = enabled;
        self
    }

    pub fn build(&self, event: &InboundEvent, request_id: &str) -> OutboundMessage {
        OutboundMessage {
            custom_message: format!(
                "Hello from AWS Step Function! Workflow: {}",
                event.workflow_id
            ),
            timestamp: self
                .stamp_timestamp
                .then(|| chrono::Utc::now().to_rfc3339()),
            source: SOURCE_TAG.to_string(),
            workflow_id: event.workflow_id.clone(),
            execution_id: event.execution_id.clone(),
            request_id: request_id.to_string(),
            trigger_time: event.trigger_time.clone(),
        }
    }
}
