use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::models::kiro::KiroRequest;

/// Raw byte stream from the backend connection, decoded downstream.
pub type BackendStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

pub type OpenFuture = Pin<Box<dyn Future<Output = Result<BackendStream>> + Send>>;

/// The single upstream streaming endpoint, behind a trait so the
/// orchestrator can be driven against a fabricated backend in tests.
pub trait Backend: Send + Sync {
    /// Open a streaming generation call with the given access token.
    fn open(&self, request: &KiroRequest, access_token: &str) -> OpenFuture;

    fn name(&self) -> &str;
}

/// Production backend client for the generateAssistantResponse endpoint.
pub struct KiroClient {
    client: reqwest::Client,
    endpoint: String,
}

impl KiroClient {
    pub fn new(endpoint: String) -> Result<Self> {
        // Connect timeout only; the read deadline is the orchestrator's
        // dynamic policy, not a fixed client-wide value.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, endpoint })
    }

    async fn open_impl(
        client: reqwest::Client,
        url: String,
        body: Vec<u8>,
        access_token: String,
    ) -> Result<BackendStream> {
        debug!(url = %url, bytes = body.len(), "opening backend stream");

        let response = client
            .post(&url)
            .bearer_auth(&access_token)
            .header("Content-Type", "application/json")
            .header("X-Amz-Target", "AmazonCodeWhispererStreamingService.GenerateAssistantResponse")
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamService(format!("backend request failed: {e}")))?;

        let status = response.status();
        info!(status = %status, "backend responded");

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => GatewayError::UpstreamAuth(format!(
                    "backend rejected access token ({status}): {text}"
                )),
                429 => GatewayError::UpstreamRateLimited(format!("backend throttled: {text}")),
                400..=499 => {
                    GatewayError::InvalidRequest(format!("backend rejected request: {text}"))
                }
                _ => GatewayError::UpstreamService(format!("backend error {status}: {text}")),
            });
        }

        let stream = response.bytes_stream().map(|item| {
            item.map_err(|e| GatewayError::UpstreamService(format!("backend read failed: {e}")))
        });

        Ok(Box::pin(stream))
    }
}

impl Backend for KiroClient {
    fn open(&self, request: &KiroRequest, access_token: &str) -> OpenFuture {
        let client = self.client.clone();
        let url = format!("{}/generateAssistantResponse", self.endpoint);
        let access_token = access_token.to_string();
        let body = serde_json::to_vec(request);

        Box::pin(async move {
            let body = body?;
            Self::open_impl(client, url, body, access_token).await
        })
    }

    fn name(&self) -> &str {
        "kiro"
    }
}
