//! Source-cloud identity verification
//!
//! Confirms the function holds a valid AWS identity before any cross-cloud
//! work. The Pub/Sub client later federates this same identity into GCP
//! (see `federation`), so a broken AWS credential chain is caught here with
//! a clear error instead of as an opaque GCP auth failure.

use crate::config::RelayConfig;
use crate::error::RelayError;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::Credentials;
use aws_sdk_sts::config::Region;
use aws_sdk_sts::error::DisplayErrorContext;
use serde::Serialize;
use tracing::{debug, info};

/// Who the function is authenticated as. Diagnostic only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallerIdentity {
    pub account: Option<String>,
    pub arn: Option<String>,
    pub user_id: Option<String>,
}

impl std::fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (account {})",
            self.arn.as_deref().unwrap_or("unknown"),
            self.account.as_deref().unwrap_or("unknown")
        )
    }
}

/// Trait for proving the current source-cloud identity
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolve credentials and ask the identity service who we are.
    ///
    /// Returns `RelayError::Config` when credentials or region cannot be
    /// resolved and `RelayError::Identity` when the service rejects them.
    async fn verify(&self, config: &RelayConfig) -> Result<CallerIdentity, RelayError>;
}

/// AWS STS-backed verifier (`GetCallerIdentity`)
#[derive(Debug, Clone, Default)]
pub struct StsIdentityVerifier;

impl StsIdentityVerifier {
    pub fn new() -> Self {
        Self
    }
}

/// Load the AWS SDK config and resolve credentials from the default chain
///
/// An empty chain or unresolvable region is `RelayError::Config`.
pub(crate) async fn load_aws_credentials(
    region_override: Option<&str>,
) -> Result<(SdkConfig, Credentials), RelayError> {
    let loader = match region_override {
        Some(region) => aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string())),
        None => aws_config::defaults(BehaviorVersion::latest()),
    };
    let sdk_config = loader.load().await;

    let region = sdk_config
        .region()
        .ok_or_else(|| RelayError::Config("no AWS region could be resolved".to_string()))?;
    debug!("AWS region: {}", region);

    let provider = sdk_config.credentials_provider().ok_or_else(|| {
        RelayError::Config("no AWS credentials provider configured".to_string())
    })?;

    // Resolve once up front so an empty chain is a config error, not an STS error
    let credentials = provider
        .provide_credentials()
        .await
        .map_err(|e| RelayError::Config(DisplayErrorContext(&e).to_string()))?;

    Ok((sdk_config, credentials))
}

#[async_trait]
impl IdentityVerifier for StsIdentityVerifier {
    async fn verify(&self, config: &RelayConfig) -> Result<CallerIdentity, RelayError> {
        let (sdk_config, _) = load_aws_credentials(config.aws_region.as_deref()).await?;
        let client = aws_sdk_sts::Client::new(&sdk_config);

        let output = client
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| RelayError::Identity(DisplayErrorContext(&e).to_string()))?;

        let identity = CallerIdentity {
            account: output.account().map(str::to_string),
            arn: output.arn().map(str::to_string),
            user_id: output.user_id().map(str::to_string),
        };

        info!(
            account = identity.account.as_deref().unwrap_or("unknown"),
            arn = identity.arn.as_deref().unwrap_or("unknown"),
            "Caller identity verified"
        );

        Ok(identity)
    }
}
