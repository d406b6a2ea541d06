//! Invocation input and output types

use crate::error::{ErrorKind, RelayError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const SUCCESS_MESSAGE_PREFIX: &str = "Successfully published message to Pub/Sub topic";
pub const FAILURE_MESSAGE: &str = "Error occurred while triggering DAG";

/// Event sent by the orchestrator
///
/// Missing identifiers default to empty strings so that a malformed event
/// still produces a well-formed response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default)]
    pub workflow_id: String,
    #[serde(default)]
    pub execution_id: String,
    /// Optional upstream trigger time, copied through unchanged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_time: Option<String>,
}

impl InboundEvent {
    pub fn new(workflow_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: execution_id.into(),
            trigger_time: None,
        }
    }
}

/// Host-supplied invocation metadata
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Unique per-invocation id, used for cross-system correlation
    pub request_id: String,
    /// Wall-clock deadline of the whole invocation, if the host has one
    pub deadline: Option<SystemTime>,
}

impl InvocationContext {
    /// Context for a run outside any host: fresh id, no deadline
    pub fn local() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            deadline: None,
        }
    }

    /// Time left before the host deadline
    pub fn remaining(&self, now: SystemTime) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.duration_since(now).unwrap_or(Duration::ZERO))
    }
}

impl From<&lambda_runtime::Context> for InvocationContext {
    fn from(ctx: &lambda_runtime::Context) -> Self {
        let request_id = if ctx.request_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            ctx.request_id.clone()
        };

        // Lambda reports the deadline in epoch milliseconds, 0 when unknown
        let deadline = (ctx.deadline > 0)
            .then(|| UNIX_EPOCH + Duration::from_millis(ctx.deadline));

        Self {
            request_id,
            deadline,
        }
    }
}

/// Outcome of one relay cycle
#[derive(Debug)]
pub enum InvocationResult {
    Success {
        message: String,
        destination_message_id: String,
        workflow_id: String,
        execution_id: String,
    },
    Failure {
        message: String,
        error: RelayError,
        workflow_id: String,
        execution_id: String,
    },
}

impl InvocationResult {
    pub fn success(topic: &str, message_id: String, event: &InboundEvent) -> Self {
        InvocationResult::Success {
            message: format!("{}: {}", SUCCESS_MESSAGE_PREFIX, topic),
            destination_message_id: message_id,
            workflow_id: event.workflow_id.clone(),
            execution_id: event.execution_id.clone(),
        }
    }

    pub fn failure(error: RelayError, event: &InboundEvent) -> Self {
        InvocationResult::Failure {
            message: FAILURE_MESSAGE.to_string(),
            error,
            workflow_id: event.workflow_id.clone(),
            execution_id: event.execution_id.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InvocationResult::Success { .. })
    }

    /// Classified kind of a failure
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            InvocationResult::Success { .. } => None,
            InvocationResult::Failure { error, .. } => Some(error.kind()),
        }
    }

    /// Convert into the wire response returned to the orchestrator
    pub fn into_response(self) -> RelayResponse {
        match self {
            InvocationResult::Success {
                message,
                destination_message_id,
                workflow_id,
                execution_id,
            } => RelayResponse {
                message,
                message_id: Some(destination_message_id),
                workflow_id,
                execution_id,
                success: true,
                error: None,
                error_class: None,
                publish_timed_out: false,
            },
            InvocationResult::Failure {
                message,
                error,
                workflow_id,
                execution_id,
            } => RelayResponse {
                message,
                message_id: None,
                workflow_id,
                execution_id,
                success: false,
                error: Some(error.to_string()),
                error_class: Some(error.kind()),
                publish_timed_out: error.is_timeout(),
            },
        }
    }
}

/// Response returned to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub workflow_id: String,
    pub execution_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorKind>,
    /// Set when the publish deadline elapsed; delivery may still have happened
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub publish_timed_out: bool,
}
