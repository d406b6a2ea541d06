//! Pub/Sub publishing
//!
//! One publish attempt per invocation, bounded by a deadline. The client is
//! created for the attempt and dropped on every exit path, so nothing leaks
//! into the next invocation of a warm environment.
//!
//! When `GOOGLE_APPLICATION_CREDENTIALS` points at an AWS-sourced
//! external-account config, the client authenticates through
//! `federation` (Workload Identity Federation). Any other credential file,
//! or none, goes through gcloud-sdk's default credential chain.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::federation::{federated_token_source, ExternalAccountConfig, CLOUD_PLATFORM_SCOPE};
use async_trait::async_trait;
use gcloud_sdk::google::pubsub::v1::publisher_client::PublisherClient;
use gcloud_sdk::google::pubsub::v1::{PublishRequest, PubsubMessage};
use gcloud_sdk::{GoogleApi, GoogleAuthMiddleware};
use std::path::Path;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// A connected client able to publish to a topic
#[async_trait]
pub trait TopicPublisher: Send + Sync {
    /// Publish one message and wait for the broker-assigned message id
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, RelayError>;
}

/// Factory for per-invocation publisher clients
#[async_trait]
pub trait PublisherConnector: Send + Sync {
    /// Establish a client; failures are `RelayError::PubSubClient`
    async fn connect(&self, config: &RelayConfig) -> Result<Box<dyn TopicPublisher>, RelayError>;
}

/// Resolve the fully-qualified topic name
///
/// Short ids are expanded under the configured project; names already of the
/// form `projects/*/topics/*` are used as given.
pub fn topic_path(config: &RelayConfig) -> Result<String, RelayError> {
    let topic = config
        .topic_id
        .as_deref()
        .ok_or_else(|| RelayError::PubSubClient("PUBSUB_TOPIC_ID is not set".to_string()))?;

    if topic.starts_with("projects/") {
        let mut parts = topic.split('/');
        let valid = parts.next() == Some("projects")
            && parts.next().is_some_and(|p| !p.is_empty())
            && parts.next() == Some("topics")
            && parts.next().is_some_and(|t| !t.is_empty())
            && parts.next().is_none();
        if !valid {
            return Err(RelayError::PubSubClient(format!(
                "invalid topic name: {}",
                topic
            )));
        }
        return Ok(topic.to_string());
    }

    let project = config
        .project_id
        .as_deref()
        .ok_or_else(|| RelayError::PubSubClient("GCP_PROJECT_ID is not set".to_string()))?;

    Ok(format!("projects/{}/topics/{}", project, topic))
}

/// Make exactly one publish attempt within `budget`
///
/// The budget starts now and covers both client setup and acknowledgment.
/// Setup that does not finish in time is a client error; an acknowledgment
/// that does not arrive in time is `RelayError::PublishTimeout`. A zero
/// budget fails as a client error without contacting the broker.
pub async fn publish_within(
    connector: &dyn PublisherConnector,
    config: &RelayConfig,
    topic: &str,
    payload: Vec<u8>,
    budget: Duration,
) -> Result<String, RelayError> {
    if budget.is_zero() {
        warn!(topic = %topic, "No time left for a publish attempt");
        return Err(RelayError::PubSubClient(
            "no time left before the host deadline to start a publish attempt".to_string(),
        ));
    }

    let started = Instant::now();

    let publisher = timeout(budget, connector.connect(config))
        .await
        .map_err(|_| {
            RelayError::PubSubClient(format!("client setup did not complete within {:?}", budget))
        })??;

    let remaining = budget.saturating_sub(started.elapsed());
    debug!(topic = %topic, remaining_ms = remaining.as_millis() as u64, "Publishing message");

    match timeout(remaining, publisher.publish(topic, payload)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(topic = %topic, budget_ms = budget.as_millis() as u64, "Publish deadline elapsed");
            Err(RelayError::PublishTimeout(budget))
        }
    }
}

/// Google Cloud Pub/Sub connector
#[derive(Debug, Clone, Default)]
pub struct GcpPubSubConnector;

impl GcpPubSubConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PublisherConnector for GcpPubSubConnector {
    async fn connect(&self, config: &RelayConfig) -> Result<Box<dyn TopicPublisher>, RelayError> {
        if config.project_id.is_none() {
            return Err(RelayError::PubSubClient("GCP_PROJECT_ID is not set".to_string()));
        }

        let federated = match &config.credentials_path {
            Some(path) if !Path::new(path).exists() => {
                return Err(RelayError::PubSubClient(format!(
                    "credentials file not found: {}",
                    path
                )));
            }
            Some(path) => ExternalAccountConfig::read_aws(path)?,
            None => None,
        };

        debug!("Initializing Pub/Sub client: {}", config.pubsub_endpoint);

        let client = match federated {
            Some(account) => {
                debug!(audience = %account.audience, "Using AWS workload identity federation");
                let token_source = federated_token_source(account, config).await?;
                GoogleApi::from_function_with_token_source(
                    PublisherClient::new,
                    &config.pubsub_endpoint,
                    None,
                    vec![CLOUD_PLATFORM_SCOPE.to_string()],
                    token_source,
                )
                .await
            }
            None => GoogleApi::from_function(PublisherClient::new, &config.pubsub_endpoint, None).await,
        }
        .map_err(|e| RelayError::PubSubClient(e.to_string()))?;

        Ok(Box::new(GcpTopicPublisher { client }))
    }
}

/// Pub/Sub publisher client wrapper
pub struct GcpTopicPublisher {
    client: GoogleApi<PublisherClient<GoogleAuthMiddleware>>,
}

#[async_trait]
impl TopicPublisher for GcpTopicPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, RelayError> {
        let request = PublishRequest {
            topic: topic.to_string(),
            messages: vec![PubsubMessage {
                data: payload.into(),
                ..Default::default()
            }],
        };

        let response = self
            .client
            .get()
            .publish(request)
            .await
            .map_err(|status| RelayError::Publish(status.to_string()))?;

        let message_id = response
            .into_inner()
            .message_ids
            .into_iter()
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RelayError::Publish("broker returned no message id".to_string()))?;

        info!(topic = %topic, message_id = %message_id, "Message acknowledged");

        Ok(message_id)
    }
}
