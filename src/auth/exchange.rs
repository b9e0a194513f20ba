use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::auth::credential::{AuthKind, CredentialConfig, mask_secret};
use crate::error::{GatewayError, Result};

/// Outcome of one refresh-token exchange with the identity provider.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// Remaining usage quota, when the provider reports one.
    pub remaining: Option<u32>,
}

pub type ExchangeFuture = Pin<Box<dyn Future<Output = Result<TokenGrant>> + Send>>;

/// Seam to the identity provider; the pool only ever refreshes through
/// this, so tests can swap in a fabricated exchanger.
pub trait TokenExchanger: Send + Sync {
    fn exchange(&self, config: &CredentialConfig) -> ExchangeFuture;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    expires_in: Option<i64>,
    usage_limit: Option<u32>,
}

/// Production exchanger speaking the provider's two refresh endpoints.
pub struct HttpTokenExchanger {
    client: reqwest::Client,
    social_endpoint: String,
    idc_endpoint: String,
}

impl HttpTokenExchanger {
    pub fn new(social_endpoint: String, idc_endpoint: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            social_endpoint,
            idc_endpoint,
        })
    }

    async fn exchange_impl(
        client: reqwest::Client,
        url: String,
        body: serde_json::Value,
        masked: String,
    ) -> Result<TokenGrant> {
        debug!(credential = %masked, url = %url, "refreshing access token");

        let response = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamService(format!("token exchange failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                400 | 401 | 403 => GatewayError::UpstreamAuth(format!(
                    "identity provider rejected refresh ({status}): {text}"
                )),
                429 => GatewayError::UpstreamRateLimited(format!(
                    "identity provider throttled refresh: {text}"
                )),
                _ => GatewayError::UpstreamService(format!(
                    "token exchange returned {status}: {text}"
                )),
            });
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamService(format!("bad exchange response: {e}")))?;

        let expires_at = Utc::now() + Duration::seconds(parsed.expires_in.unwrap_or(3600));
        info!(credential = %masked, expires_at = %expires_at, "access token refreshed");

        Ok(TokenGrant {
            access_token: parsed.access_token,
            expires_at,
            remaining: parsed.usage_limit,
        })
    }
}

impl TokenExchanger for HttpTokenExchanger {
    fn exchange(&self, config: &CredentialConfig) -> ExchangeFuture {
        let client = self.client.clone();
        let masked = mask_secret(&config.refresh_token);

        let (url, body) = match config.auth {
            AuthKind::Social => (
                format!("{}/refreshToken", self.social_endpoint),
                serde_json::json!({"refreshToken": config.refresh_token}),
            ),
            AuthKind::IdC => (
                format!("{}/token", self.idc_endpoint),
                serde_json::json!({
                    "clientId": config.client_id,
                    "clientSecret": config.client_secret,
                    "refreshToken": config.refresh_token,
                    "grantType": "refresh_token",
                }),
            ),
        };

        Box::pin(Self::exchange_impl(client, url, body, masked))
    }
}
