//! Trigger Relay Library
//!
//! Relays a workflow trigger from AWS Step Functions into a Google Cloud
//! Pub/Sub topic, where a DAG scheduler picks it up. One invocation makes at
//! most one publish attempt and always returns a classified response.

pub mod config;
pub mod error;
pub mod event;
pub mod federation;
pub mod identity;
pub mod message;
pub mod publisher;
pub mod relay;

pub use config::{DeadlineMode, RelayConfig};
pub use error::{ErrorKind, RelayError};
pub use event::{InboundEvent, InvocationContext, InvocationResult, RelayResponse};
pub use federation::{ExternalAccountConfig, WorkloadIdentityFederation};
pub use identity::{CallerIdentity, IdentityVerifier, StsIdentityVerifier};
pub use message::{MessageBuilder, OutboundMessage};
pub use publisher::{GcpPubSubConnector, PublisherConnector, TopicPublisher};
pub use relay::TriggerRelay;
