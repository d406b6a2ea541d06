//! GCP Workload Identity Federation from an AWS identity
//!
//! gcloud-sdk's default credential chain does not understand
//! `external_account` configs with an AWS credential source, so the exchange
//! is done here:
//!
//! 1. Sign an STS `GetCallerIdentity` request with the function's AWS
//!    credentials (SigV4) and serialize it as the subject token
//! 2. Exchange the subject token at the config's `token_url` (GCP STS)
//! 3. Optionally impersonate a service account with the federated token
//!
//! The result is handed to gcloud-sdk as an external token source. Every
//! failure is a `RelayError::PubSubClient`: it happens while the Pub/Sub
//! client is being set up.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::identity::load_aws_credentials;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SigningParams, SigningSettings,
};
use aws_sigv4::sign::v4;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gcloud_sdk::error::ErrorKind as GcloudErrorKind;
use gcloud_sdk::{ExternalJwtFunctionSource, SecretValue, Token, TokenSourceType};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, info};

pub const AWS_SUBJECT_TOKEN_TYPE: &str = "urn:ietf:params:aws:token-type:aws4_request";
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";
const DEFAULT_VERIFICATION_URL: &str =
    "https://sts.{region}.amazonaws.com?Action=GetCallerIdentity&Version=2011-06-15";
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// `external_account` credential configuration (the JSON file produced by
/// `gcloud iam workload-identity-pools create-cred-config --aws`)
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalAccountConfig {
    /// Workload identity pool provider resource
    pub audience: String,
    pub subject_token_type: String,
    /// GCP STS token endpoint
    pub token_url: String,
    #[serde(default)]
    pub service_account_impersonation_url: Option<String>,
    #[serde(default)]
    pub credential_source: CredentialSource,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialSource {
    #[serde(default)]
    pub environment_id: Option<String>,
    /// Signed request template; `{region}` is replaced with the AWS region
    #[serde(default)]
    pub regional_cred_verification_url: Option<String>,
}

impl ExternalAccountConfig {
    /// Read a credential file and return its config when it is an
    /// AWS-sourced external account.
    ///
    /// Other credential types (service account keys, OIDC file sources)
    /// return `None` and are left to the default credential chain.
    pub fn read_aws(path: impl AsRef<Path>) -> Result<Option<Self>, RelayError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::PubSubClient(format!(
                "failed to read credentials file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse_aws(&raw)
    }

    pub fn parse_aws(raw: &str) -> Result<Option<Self>, RelayError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| {
            RelayError::PubSubClient(format!("invalid credentials file: {}", e))
        })?;

        let is_external = value["type"].as_str() == Some("external_account");
        let is_aws = value["credential_source"]["environment_id"]
            .as_str()
            .is_some_and(|id| id.starts_with("aws"));
        if !(is_external && is_aws) {
            return Ok(None);
        }

        let config: Self = serde_json::from_value(value).map_err(|e| {
            RelayError::PubSubClient(format!("invalid external account config: {}", e))
        })?;

        if config.subject_token_type != AWS_SUBJECT_TOKEN_TYPE {
            return Err(RelayError::PubSubClient(format!(
                "unsupported subject_token_type for AWS source: {}",
                config.subject_token_type
            )));
        }

        Ok(Some(config))
    }

    fn verification_url(&self, region: &str) -> String {
        self.credential_source
            .regional_cred_verification_url
            .as_deref()
            .unwrap_or(DEFAULT_VERIFICATION_URL)
            .replace("{region}", region)
    }

    /// Build the subject token: a SigV4-signed `GetCallerIdentity` request,
    /// serialized as JSON and URL-encoded
    ///
    /// GCP STS replays the request against AWS to learn the caller's
    /// identity. `x-goog-cloud-target-resource` binds the signature to this
    /// pool provider.
    pub fn aws_subject_token(
        &self,
        credentials: &Credentials,
        region: &str,
        time: SystemTime,
    ) -> Result<String, RelayError> {
        let url = self.verification_url(region);
        let host = reqwest::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| {
                RelayError::PubSubClient(format!("invalid regional verification url: {}", url))
            })?;

        let unsigned = [
            ("host", host.as_str()),
            ("x-goog-cloud-target-resource", self.audience.as_str()),
        ];

        let identity = credentials.clone().into();
        let params: SigningParams = v4::SigningParams::builder()
            .identity(&identity)
            .region(region)
            .name("sts")
            .time(time)
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| RelayError::PubSubClient(format!("failed to sign AWS request: {}", e)))?
            .into();

        let request = SignableRequest::new(
            "POST",
            url.as_str(),
            unsigned.iter().copied(),
            SignableBody::Bytes(&[]),
        )
        .map_err(|e| RelayError::PubSubClient(format!("failed to sign AWS request: {}", e)))?;

        let (instructions, _signature) = sign(request, &params)
            .map_err(|e| RelayError::PubSubClient(format!("failed to sign AWS request: {}", e)))?
            .into_parts();

        let mut headers: Vec<Value> = instructions
            .headers()
            .map(|(name, value)| {
                let key = if name.eq_ignore_ascii_case("authorization") {
                    "Authorization"
                } else {
                    name
                };
                json!({ "key": key, "value": value })
            })
            .collect();
        headers.extend(
            unsigned
                .iter()
                .map(|(name, value)| json!({ "key": name, "value": value })),
        );

        let request = json!({
            "url": url,
            "method": "POST",
            "headers": headers,
        });

        Ok(urlencoding::encode(&request.to_string()).into_owned())
    }
}

/// Exchanges AWS credentials for GCP access tokens
pub struct WorkloadIdentityFederation {
    http_client: reqwest::Client,
    account: ExternalAccountConfig,
    aws_region: Option<String>,
}

impl WorkloadIdentityFederation {
    pub fn new(account: ExternalAccountConfig, aws_region: Option<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            account,
            aws_region,
        }
    }

    /// Resolve the function's AWS credentials and exchange them
    pub async fn fetch_token(&self) -> Result<Token, RelayError> {
        let (sdk_config, credentials) = load_aws_credentials(self.aws_region.as_deref())
            .await
            .map_err(|e| RelayError::PubSubClient(e.to_string()))?;
        let region = sdk_config
            .region()
            .map(|r| r.as_ref().to_string())
            .ok_or_else(|| {
                RelayError::PubSubClient("no AWS region for the subject token".to_string())
            })?;

        self.token_for(&credentials, &region).await
    }

    /// Exchange the given AWS credentials for a GCP access token
    pub async fn token_for(
        &self,
        credentials: &Credentials,
        region: &str,
    ) -> Result<Token, RelayError> {
        let subject_token =
            self.account
                .aws_subject_token(credentials, region, SystemTime::now())?;

        let federated = self.exchange(&subject_token).await?;

        match &self.account.service_account_impersonation_url {
            Some(url) => self.impersonate(url, &federated).await,
            None => Ok(federated),
        }
    }

    async fn exchange(&self, subject_token: &str) -> Result<Token, RelayError> {
        let sts_request = json!({
            "grant_type": TOKEN_EXCHANGE_GRANT,
            "subject_token_type": self.account.subject_token_type,
            "requested_token_type": ACCESS_TOKEN_TYPE,
            "audience": self.account.audience,
            "subject_token": subject_token,
            "scope": CLOUD_PLATFORM_SCOPE,
        });

        debug!(token_url = %self.account.token_url, "Exchanging AWS subject token");

        let response = self
            .http_client
            .post(&self.account.token_url)
            .json(&sts_request)
            .send()
            .await
            .map_err(|e| RelayError::PubSubClient(format!("failed to call GCP STS: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::PubSubClient(format!(
                "GCP STS failed with {}: {}",
                status, body
            )));
        }

        let token_response: Value = response
            .json()
            .await
            .map_err(|e| RelayError::PubSubClient(format!("invalid GCP STS response: {}", e)))?;

        let access_token = token_response["access_token"]
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                RelayError::PubSubClient("missing access_token in GCP STS response".to_string())
            })?;
        let token_type = token_response["token_type"].as_str().unwrap_or("Bearer");
        let expires_in = token_response["expires_in"]
            .as_i64()
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);

        info!("GCP credentials obtained via Workload Identity Federation");

        Ok(Token::new(
            token_type.to_string(),
            SecretValue::from(access_token),
            Utc::now() + ChronoDuration::seconds(expires_in),
        ))
    }

    async fn impersonate(&self, url: &str, federated: &Token) -> Result<Token, RelayError> {
        let response = self
            .http_client
            .post(url)
            .bearer_auth(federated.token.as_sensitive_str())
            .json(&json!({ "scope": [CLOUD_PLATFORM_SCOPE] }))
            .send()
            .await
            .map_err(|e| {
                RelayError::PubSubClient(format!("failed to impersonate service account: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::PubSubClient(format!(
                "service account impersonation failed with {}: {}",
                status, body
            )));
        }

        let body: Value = response.json().await.map_err(|e| {
            RelayError::PubSubClient(format!("invalid impersonation response: {}", e))
        })?;

        let access_token = body["accessToken"].as_str().ok_or_else(|| {
            RelayError::PubSubClient("missing accessToken in impersonation response".to_string())
        })?;
        let expiry = body["expireTime"]
            .as_str()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + ChronoDuration::seconds(DEFAULT_EXPIRES_IN_SECS));

        info!("Service account impersonated");

        Ok(Token::new(
            "Bearer".to_string(),
            SecretValue::from(access_token),
            expiry,
        ))
    }
}

/// Build a gcloud-sdk token source for an AWS-sourced external account
///
/// The first token is fetched here, so exchange failures surface while the
/// client is being set up rather than on the publish call. Later refreshes
/// go through the same exchange.
pub async fn federated_token_source(
    account: ExternalAccountConfig,
    config: &RelayConfig,
) -> Result<TokenSourceType, RelayError> {
    let federation = Arc::new(WorkloadIdentityFederation::new(
        account,
        config.aws_region.clone(),
    ));
    let first = federation.fetch_token().await?;
    Ok(token_source(federation, first))
}

fn token_source(federation: Arc<WorkloadIdentityFederation>, first: Token) -> TokenSourceType {
    let seeded = Arc::new(Mutex::new(Some(first)));

    let source = ExternalJwtFunctionSource::new(move || {
        let cached = seeded.lock().ok().and_then(|mut token| token.take());
        let federation = federation.clone();
        // Spawned so the returned future holds only a JoinHandle (Send + Sync)
        let refresh = tokio::spawn(async move {
            match cached {
                Some(token) => Ok(token),
                None => federation.fetch_token().await,
            }
        });
        async move {
            match refresh.await {
                Ok(Ok(token)) => Ok(token),
                Ok(Err(e)) => Err(source_error(e.to_string())),
                Err(e) => Err(source_error(e.to_string())),
            }
        }
    });

    TokenSourceType::ExternalSource(Box::new(source))
}

fn source_error(message: String) -> gcloud_sdk::error::Error {
    gcloud_sdk::error::Error::from(GcloudErrorKind::ExternalCredsSourceError(message))
}
