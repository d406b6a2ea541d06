//! Trigger relay cycle
//!
//! Strictly linear with early return:
//! `Init -> VerifyingIdentity -> BuildingMessage -> Publishing -> Succeeded`,
//! where any stage may end in `Failed(kind)`. No stage is revisited and
//! every path yields exactly one `InvocationResult`.

use crate::config::{DeadlineMode, RelayConfig};
use crate::error::{ErrorKind, RelayError};
use crate::event::{InboundEvent, InvocationContext, InvocationResult};
use crate::identity::IdentityVerifier;
use crate::message::MessageBuilder;
use crate::publisher::{publish_within, topic_path, PublisherConnector};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, info_span, Instrument};

/// Position of an invocation in the relay state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    VerifyingIdentity,
    BuildingMessage,
    Publishing,
    Succeeded,
    Failed(ErrorKind),
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Init => write!(f, "init"),
            Stage::VerifyingIdentity => write!(f, "verifying_identity"),
            Stage::BuildingMessage => write!(f, "building_message"),
            Stage::Publishing => write!(f, "publishing"),
            Stage::Succeeded => write!(f, "succeeded"),
            Stage::Failed(kind) => write!(f, "failed({})", kind),
        }
    }
}

/// Publish budget for this invocation
///
/// `Fixed` ignores the host; `HostBounded` never lets the publish stage run
/// past the host deadline minus the configured margin.
pub fn publish_budget(config: &RelayConfig, ctx: &InvocationContext, now: SystemTime) -> Duration {
    match (config.deadline_mode, ctx.remaining(now)) {
        (DeadlineMode::Fixed, _) | (DeadlineMode::HostBounded, None) => config.publish_timeout,
        (DeadlineMode::HostBounded, Some(remaining)) => config
            .publish_timeout
            .min(remaining.saturating_sub(config.host_margin)),
    }
}

/// Stateless relay: verifies identity, builds the message, publishes it
pub struct TriggerRelay<V, C> {
    verifier: V,
    connector: C,
}

impl<V, C> TriggerRelay<V, C>
where
    V: IdentityVerifier,
    C: PublisherConnector,
{
    pub fn new(verifier: V, connector: C) -> Self {
        Self {
            verifier,
            connector,
        }
    }

    /// Run one cycle, loading configuration from the environment first
    pub async fn invoke_from_env(
        &self,
        event: InboundEvent,
        ctx: InvocationContext,
    ) -> InvocationResult {
        self.invoke_with_lookup(|key| std::env::var(key).ok(), event, ctx).await
    }

    /// Run one cycle, loading configuration through `lookup` first
    ///
    /// A configuration that cannot be parsed fails the invocation with
    /// `ConfigError` before any cloud call.
    pub async fn invoke_with_lookup<F>(
        &self,
        lookup: F,
        event: InboundEvent,
        ctx: InvocationContext,
    ) -> InvocationResult
    where
        F: Fn(&str) -> Option<String>,
    {
        match RelayConfig::from_lookup(lookup) {
            Ok(config) => self.invoke(&config, event, ctx).await,
            Err(err) => {
                error!(error_class = %err.kind(), "{}", err);
                InvocationResult::failure(err, &event)
            }
        }
    }

    /// Run one cycle with the given configuration
    pub async fn invoke(
        &self,
        config: &RelayConfig,
        event: InboundEvent,
        ctx: InvocationContext,
    ) -> InvocationResult {
        let span = info_span!(
            "relay",
            workflow_id = %event.workflow_id,
            execution_id = %event.execution_id,
            request_id = %ctx.request_id,
        );

        async move {
            info!("Trigger relay started");
            debug!(?event, "Inbound event");
            info!(
                topic = config.topic_id.as_deref().unwrap_or(""),
                project = config.project_id.as_deref().unwrap_or(""),
                credentials = config.credentials_path.as_deref().unwrap_or(""),
                deadline_mode = %config.deadline_mode,
                "Relay configuration"
            );

            let result = match self.run(config, &event, &ctx).await {
                Ok((topic, message_id)) => {
                    debug!(stage = %Stage::Succeeded, "Stage transition");
                    InvocationResult::success(&topic, message_id, &event)
                }
                Err(err) => {
                    debug!(stage = %Stage::Failed(err.kind()), "Stage transition");
                    error!(error_class = %err.kind(), "{}", err);
                    InvocationResult::failure(err, &event)
                }
            };

            if let InvocationResult::Success {
                destination_message_id,
                ..
            } = &result
            {
                info!(message_id = %destination_message_id, "Trigger relayed");
            }

            result
        }
        .instrument(span)
        .await
    }

    /// Returns the resolved topic and broker message id
    async fn run(
        &self,
        config: &RelayConfig,
        event: &InboundEvent,
        ctx: &InvocationContext,
    ) -> Result<(String, String), RelayError> {
        debug!(stage = %Stage::Init, "Stage transition");

        debug!(stage = %Stage::VerifyingIdentity, "Stage transition");
        let identity = self.verifier.verify(config).await?;
        info!(identity = %identity, "Source identity confirmed");

        debug!(stage = %Stage::BuildingMessage, "Stage transition");
        let message = MessageBuilder::new()
            .stamp_timestamp(config.stamp_timestamp)
            .build(event, &ctx.request_id);
        let payload = message.encode()?;
        debug!(payload = %String::from_utf8_lossy(&payload), "Outbound message");

        debug!(stage = %Stage::Publishing, "Stage transition");
        let topic = topic_path(config)?;
        let budget = publish_budget(config, ctx, SystemTime::now());
        info!(topic = %topic, budget_ms = budget.as_millis() as u64, "Publishing to Pub/Sub");

        let message_id = publish_within(&self.connector, config, &topic, payload, budget).await?;

        Ok((topic, message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CallerIdentity;
    use crate::message::OutboundMessage;
    use crate::publisher::TopicPublisher;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Copy)]
    enum Verify {
        Ok,
        Config,
        Identity,
    }

    struct FakeVerifier(Verify);

    #[async_trait]
    impl IdentityVerifier for FakeVerifier {
        async fn verify(&self, _config: &RelayConfig) -> Result<CallerIdentity, RelayError> {
            match self.0 {
                Verify::Ok => Ok(CallerIdentity {
                    account: Some("123456789012".into()),
                    arn: Some("arn:aws:sts::123456789012:assumed-role/relay/fn".into()),
                    user_id: None,
                }),
                Verify::Config => Err(RelayError::Config("no credentials".into())),
                Verify::Identity => Err(RelayError::Identity("ExpiredToken".into())),
            }
        }
    }

    #[derive(Clone, Copy)]
    enum Broker {
        Ack,
        Unreachable,
        Reject,
        Withhold,
    }

    /// Records connects and published (topic, payload) pairs
    #[derive(Clone)]
    struct FakeBroker {
        mode: Broker,
        connects: Arc<Mutex<usize>>,
        published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    impl FakeBroker {
        fn new(mode: Broker) -> Self {
            Self {
                mode,
                connects: Arc::new(Mutex::new(0)),
                published: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn connects(&self) -> usize {
            *self.connects.lock().unwrap()
        }

        fn published(&self) -> Vec<(String, Vec<u8>)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PublisherConnector for FakeBroker {
        async fn connect(&self, _config: &RelayConfig) -> Result<Box<dyn TopicPublisher>, RelayError> {
            *self.connects.lock().unwrap() += 1;
            match self.mode {
                Broker::Unreachable => Err(RelayError::PubSubClient("connection refused".into())),
                _ => Ok(Box::new(self.clone())),
            }
        }
    }

    #[async_trait]
    impl TopicPublisher for FakeBroker {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, RelayError> {
            match self.mode {
                Broker::Ack => {
                    self.published
                        .lock()
                        .unwrap()
                        .push((topic.to_string(), payload));
                    Ok("4821937465".to_string())
                }
                Broker::Reject => Err(RelayError::Publish("status: Unavailable".into())),
                Broker::Withhold => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("late".to_string())
                }
                Broker::Unreachable => unreachable!(),
            }
        }
    }

    fn config() -> RelayConfig {
        RelayConfig {
            topic_id: Some("dag-trigger".into()),
            project_id: Some("composer-project".into()),
            ..Default::default()
        }
    }

    fn ctx() -> InvocationContext {
        InvocationContext {
            request_id: "c0ffee-req".into(),
            deadline: None,
        }
    }

    async fn run(verify: Verify, broker: &FakeBroker, event: InboundEvent) -> InvocationResult {
        TriggerRelay::new(FakeVerifier(verify), broker.clone())
            .invoke(&config(), event, ctx())
            .await
    }

    #[tokio::test]
    async fn test_success_publishes_exactly_one_message() {
        let broker = FakeBroker::new(Broker::Ack);
        let response = run(Verify::Ok, &broker, InboundEvent::new("wf-1", "ex-1"))
            .await
            .into_response();

        assert!(response.success);
        assert_eq!(response.message_id.as_deref(), Some("4821937465"));
        assert_eq!(response.workflow_id, "wf-1");
        assert_eq!(response.execution_id, "ex-1");
        assert_eq!(
            response.message,
            "Successfully published message to Pub/Sub topic: projects/composer-project/topics/dag-trigger"
        );

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "projects/composer-project/topics/dag-trigger");

        let body: OutboundMessage = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body.workflow_id, "wf-1");
        assert_eq!(body.execution_id, "ex-1");
        assert_eq!(body.source, "aws_step_function");
        assert!(body.custom_message.contains("wf-1"));
        assert_eq!(body.request_id, "c0ffee-req");
    }

    #[tokio::test]
    async fn test_identity_failures_never_publish() {
        for (verify, class) in [
            (Verify::Config, ErrorKind::ConfigError),
            (Verify::Identity, ErrorKind::IdentityError),
        ] {
            let broker = FakeBroker::new(Broker::Ack);
            let response = run(verify, &broker, InboundEvent::new("wf-1", "ex-1"))
                .await
                .into_response();

            assert!(!response.success);
            assert_eq!(response.error_class, Some(class));
            assert_eq!(response.workflow_id, "wf-1");
            assert_eq!(response.execution_id, "ex-1");
            assert_eq!(broker.connects(), 0);
            assert!(broker.published().is_empty());
        }
    }

    #[tokio::test]
    async fn test_destination_unavailable() {
        for mode in [Broker::Reject, Broker::Unreachable] {
            let broker = FakeBroker::new(mode);
            let result = run(Verify::Ok, &broker, InboundEvent::new("wf-9", "ex-9")).await;
            let expected = match mode {
                Broker::Unreachable => ErrorKind::PubSubClientError,
                _ => ErrorKind::PublishError,
            };
            assert_eq!(result.error_kind(), Some(expected));

            let response = result.into_response();
            assert!(!response.success);
            assert!(response.message_id.is_none());
            assert!(!response.publish_timed_out);
            assert_eq!(response.workflow_id, "wf-9");
            assert_eq!(response.execution_id, "ex-9");
            assert_eq!(broker.connects(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_withheld_ack_fails_within_deadline() {
        let broker = FakeBroker::new(Broker::Withhold);
        let started = tokio::time::Instant::now();

        let response = run(Verify::Ok, &broker, InboundEvent::new("wf-1", "ex-1"))
            .await
            .into_response();

        assert!(!response.success);
        assert_eq!(response.error_class, Some(ErrorKind::PublishError));
        assert!(response.publish_timed_out);
        assert_eq!(response.workflow_id, "wf-1");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));
    }

    #[tokio::test]
    async fn test_missing_topic_is_client_error_after_identity() {
        let broker = FakeBroker::new(Broker::Ack);
        let relay = TriggerRelay::new(FakeVerifier(Verify::Ok), broker.clone());
        let mut cfg = config();
        cfg.topic_id = None;

        let result = relay.invoke(&cfg, InboundEvent::new("wf", "ex"), ctx()).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::PubSubClientError));
        assert_eq!(broker.connects(), 0);
    }

    #[tokio::test]
    async fn test_exactly_one_outcome_echoes_ids() {
        let modes = [Broker::Ack, Broker::Reject, Broker::Unreachable];
        let verifies = [Verify::Ok, Verify::Config, Verify::Identity];
        for (i, verify) in verifies.into_iter().enumerate() {
            for (j, mode) in modes.into_iter().enumerate() {
                let event = InboundEvent::new(format!("wf-{}", i), format!("ex-{}", j));
                let broker = FakeBroker::new(mode);
                let result = run(verify, &broker, event.clone()).await;
                assert_eq!(result.is_success(), result.error_kind().is_none());
                let response = result.into_response();

                assert_eq!(response.workflow_id, event.workflow_id);
                assert_eq!(response.execution_id, event.execution_id);
                assert_eq!(response.success, response.message_id.is_some());
                assert_eq!(!response.success, response.error_class.is_some());
                assert!(broker.published().len() <= 1);
            }
        }
    }

    #[tokio::test]
    async fn test_unparseable_config_fails_before_any_cloud_call() {
        let broker = FakeBroker::new(Broker::Ack);
        let relay = TriggerRelay::new(FakeVerifier(Verify::Ok), broker.clone());
        let env: HashMap<&str, &str> = [
            ("PUBSUB_TOPIC_ID", "dag-trigger"),
            ("GCP_PROJECT_ID", "composer-project"),
            ("PUBLISH_TIMEOUT_SECS", "thirty"),
        ]
        .into_iter()
        .collect();

        let response = relay
            .invoke_with_lookup(
                |key| env.get(key).map(|v| v.to_string()),
                InboundEvent::new("wf-cfg", "ex-cfg"),
                ctx(),
            )
            .await
            .into_response();

        assert!(!response.success);
        assert_eq!(response.error_class, Some(ErrorKind::ConfigError));
        assert!(response.error.unwrap().contains("PUBLISH_TIMEOUT_SECS"));
        assert_eq!(response.workflow_id, "wf-cfg");
        assert_eq!(response.execution_id, "ex-cfg");
        assert!(response.message_id.is_none());
        assert_eq!(broker.connects(), 0);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_expired_host_deadline_skips_publish() {
        let broker = FakeBroker::new(Broker::Ack);
        let relay = TriggerRelay::new(FakeVerifier(Verify::Ok), broker.clone());
        let mut cfg = config();
        cfg.deadline_mode = DeadlineMode::HostBounded;
        let expired = InvocationContext {
            request_id: "c0ffee-req".into(),
            deadline: Some(SystemTime::now() - Duration::from_secs(1)),
        };

        let response = relay
            .invoke(&cfg, InboundEvent::new("wf-1", "ex-1"), expired)
            .await
            .into_response();

        assert!(!response.success);
        assert_eq!(response.error_class, Some(ErrorKind::PubSubClientError));
        assert!(!response.publish_timed_out);
        assert_eq!(response.workflow_id, "wf-1");
        assert_eq!(broker.connects(), 0);
        assert!(broker.published().is_empty());
    }

    #[test]
    fn test_publish_budget_modes() {
        let now = SystemTime::now();
        let host = InvocationContext {
            request_id: "r".into(),
            deadline: Some(now + Duration::from_secs(10)),
        };

        let mut cfg = config();
        assert_eq!(publish_budget(&cfg, &host, now), Duration::from_secs(30));

        cfg.deadline_mode = DeadlineMode::HostBounded;
        assert_eq!(publish_budget(&cfg, &host, now), Duration::from_millis(9_500));
        assert_eq!(publish_budget(&cfg, &ctx(), now), Duration::from_secs(30));

        let roomy = InvocationContext {
            request_id: "r".into(),
            deadline: Some(now + Duration::from_secs(900)),
        };
        assert_eq!(publish_budget(&cfg, &roomy, now), Duration::from_secs(30));

        let expired = InvocationContext {
            request_id: "r".into(),
            deadline: Some(now - Duration::from_secs(1)),
        };
        assert_eq!(publish_budget(&cfg, &expired, now), Duration::ZERO);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::VerifyingIdentity.to_string(), "verifying_identity");
        assert_eq!(
            Stage::Failed(ErrorKind::PublishError).to_string(),
            "failed(PublishError)"
        );
    }
}
