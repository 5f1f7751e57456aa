use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
const DEFAULT_SCOPES: &[&str] = &["offline_access", "Mail.Read"];

/// Device-code grant against the identity authority. Interactive login runs
/// from the `auth login` command only; the sync path uses refresh tokens.
pub struct DeviceAuth {
    http: reqwest::Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeGrant {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub message: String,
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expiry")]
    pub expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Default)]
struct OAuthErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// The silent-acquisition slice of [`DeviceAuth`], so the gateway can be
/// exercised without a network.
#[async_trait]
pub trait SilentAuth: Send + Sync {
    async fn redeem_refresh_token(&self, refresh_token: &str) -> Result<TokenResponse>;
}

impl DeviceAuth {
    pub fn new(client_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self::with_authority(client_id, tenant_id, DEFAULT_AUTHORITY)
    }

    pub fn with_authority(
        client_id: impl Into<String>,
        tenant_id: impl Into<String>,
        authority: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            authority: authority.into().trim_end_matches('/').to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id)
    }

    pub async fn begin_device_login(&self) -> Result<DeviceCodeGrant> {
        let url = format!("{}/{}/oauth2/v2.0/devicecode", self.authority, self.tenant_id);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", &self.scopes.join(" ")),
            ])
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!("device code request rejected: {body}")));
        }
        response
            .json::<DeviceCodeGrant>()
            .await
            .map_err(|err| Error::Auth(format!("malformed device code response: {err}")))
    }

    /// Poll until the user completes the verification or the code expires.
    pub async fn poll_device_login(&self, grant: &DeviceCodeGrant) -> Result<TokenResponse> {
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_secs(grant.expires_in);
        let mut interval = grant.interval.max(1);
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Auth("device code expired before sign-in".into()));
            }
            tokio::time::sleep(std::time::Duration::from_secs(interval)).await;

            let response = self
                .http
                .post(self.token_url())
                .form(&[
                    ("client_id", self.client_id.as_str()),
                    ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                    ("device_code", &grant.device_code),
                ])
                .send()
                .await
                .map_err(|err| Error::Network(err.to_string()))?;

            if response.status().is_success() {
                return response
                    .json::<TokenResponse>()
                    .await
                    .map_err(|err| Error::Auth(format!("malformed token response: {err}")));
            }
            let body = response.text().await.unwrap_or_default();
            let oauth_error: OAuthErrorBody = serde_json::from_str(&body).unwrap_or_default();
            match oauth_error.error.as_str() {
                "authorization_pending" => continue,
                "slow_down" => {
                    interval += 5;
                    debug!(interval, "authority asked to slow device polling");
                }
                "expired_token" => {
                    return Err(Error::Auth("device code expired before sign-in".into()));
                }
                _ => {
                    return Err(Error::Auth(format!(
                        "device sign-in failed: {} {}",
                        oauth_error.error, oauth_error.error_description
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl SilentAuth for DeviceAuth {
    async fn redeem_refresh_token(&self, refresh_token: &str) -> Result<TokenResponse> {
        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("scope", &self.scopes.join(" ")),
            ])
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<TokenResponse>()
                .await
                .map_err(|err| Error::Auth(format!("malformed token response: {err}")));
        }
        let body = response.text().await.unwrap_or_default();
        let oauth_error: OAuthErrorBody = serde_json::from_str(&body).unwrap_or_default();
        if status.as_u16() == 429 || oauth_error.error_description.to_ascii_lowercase().contains("throttl") {
            return Err(Error::Throttled(format!("token endpoint: {body}")));
        }
        Err(Error::Auth(format!(
            "silent token acquisition failed: {} {}",
            oauth_error.error, oauth_error.error_description
        )))
    }
}
