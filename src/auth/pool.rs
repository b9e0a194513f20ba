use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::credential::{Credential, CredentialConfig, CredentialSnapshot};
use crate::auth::exchange::{TokenExchanger, TokenGrant};
use crate::error::{GatewayError, Result};

/// A credential handed out by the pool for one backend request.
///
/// The refresh token doubles as the credential's identity for reporting
/// outcomes back; indices are volatile under concurrent add/remove and
/// must not be held across calls.
#[derive(Debug, Clone)]
pub struct AcquiredCredential {
    pub access_token: String,
    pub refresh_token: String,
    pub masked: String,
}

/// Live pool counters returned alongside an acquisition.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolUsage {
    pub total: usize,
    pub eligible: usize,
    pub remaining_total: u64,
}

/// Ordered collection of rotating credentials shared by all in-flight
/// requests. Selection, refresh, usage decrement and error annotation
/// all happen under the one pool mutex, so two callers can never race
/// onto the same near-exhausted credential.
pub struct CredentialPool {
    credentials: Mutex<Vec<Credential>>,
    exchanger: Arc<dyn TokenExchanger>,
}

impl CredentialPool {
    pub fn new(configs: Vec<CredentialConfig>, exchanger: Arc<dyn TokenExchanger>) -> Self {
        let credentials = configs.into_iter().map(Credential::new).collect();
        Self {
            credentials: Mutex::new(credentials),
            exchanger,
        }
    }

    /// Select the first usable credential in stored order, refreshing its
    /// access token when expired or absent.
    pub async fn acquire(&self) -> Result<AcquiredCredential> {
        Ok(self.acquire_with_usage().await?.0)
    }

    /// Like [`acquire`](Self::acquire), with a live usage snapshot taken
    /// in the same critical section.
    pub async fn acquire_with_usage(&self) -> Result<(AcquiredCredential, PoolUsage)> {
        let mut creds = self.credentials.lock().await;
        let now = Utc::now();

        for i in 0..creds.len() {
            if !creds[i].is_eligible() {
                continue;
            }

            if creds[i].access_token.is_none() || creds[i].is_expired(now) {
                match self.exchanger.exchange(&creds[i].config).await {
                    Ok(grant) => apply_grant(&mut creds[i], grant),
                    Err(e) => {
                        record_failure(&mut creds[i], &e);
                        continue;
                    }
                }
            }

            return Ok(charge(&mut creds, i));
        }

        // Nothing eligible. One refresh of the least-recently-refreshed
        // expired credential may resurrect an exhausted entry if the
        // provider reports a fresh quota.
        if let Some(i) = least_recently_refreshed_expired(&creds, now) {
            match self.exchanger.exchange(&creds[i].config).await {
                Ok(grant) => {
                    apply_grant(&mut creds[i], grant);
                    if creds[i].is_eligible() {
                        return Ok(charge(&mut creds, i));
                    }
                }
                Err(e) => record_failure(&mut creds[i], &e),
            }
        }

        Err(GatewayError::NoCredentialsAvailable)
    }

    /// Record a backend failure against the credential identified by its
    /// refresh token. Invalid-credential errors take it out of rotation;
    /// nothing is ever refunded.
    pub async fn report_failure(&self, refresh_token: &str, error: &GatewayError) {
        let mut creds = self.credentials.lock().await;
        if let Some(cred) = creds
            .iter_mut()
            .find(|c| c.config.refresh_token == refresh_token)
        {
            record_failure(cred, error);
        }
    }

    /// Whether any credential's last failure was a throttle rather than a
    /// rejection; the orchestrator uses this to decide on one retry.
    pub async fn any_rate_limited(&self) -> bool {
        self.credentials
            .lock()
            .await
            .iter()
            .any(|c| c.rate_limited && !c.unusable && !c.config.disabled)
    }

    /// Validate and append a credential at the end of the pool.
    pub async fn add(&self, config: CredentialConfig) -> Result<usize> {
        config.validate()?;

        let mut creds = self.credentials.lock().await;
        info!(auth = ?config.auth, "adding credential to pool");
        creds.push(Credential::new(config));
        Ok(creds.len())
    }

    /// Remove by position. Entries after `index` shift down by one; the
    /// check and removal share the lock so an in-range index cannot race
    /// with another mutation mid-call.
    pub async fn remove(&self, index: usize) -> Result<usize> {
        let mut creds = self.credentials.lock().await;
        if index >= creds.len() {
            return Err(GatewayError::InvalidRequest(format!(
                "credential index {index} out of range (pool size {})",
                creds.len()
            )));
        }

        let removed = creds.remove(index);
        info!(index, credential = %removed.masked_token(), "removed credential from pool");
        Ok(creds.len())
    }

    pub async fn snapshot(&self) -> Vec<CredentialSnapshot> {
        self.credentials
            .lock()
            .await
            .iter()
            .enumerate()
            .map(|(i, c)| c.snapshot(i))
            .collect()
    }

    /// Current persisted-shape configs, for writing back to disk.
    pub async fn configs(&self) -> Vec<CredentialConfig> {
        self.credentials
            .lock()
            .await
            .iter()
            .map(|c| c.config.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.credentials.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.credentials.lock().await.is_empty()
    }

    /// Startup warm-up: refresh the first eligible credential so the
    /// first request does not pay the exchange round-trip. Never charges
    /// usage; failure is only a warning.
    pub async fn warm_up(&self) {
        let mut creds = self.credentials.lock().await;
        let now = Utc::now();

        let Some(i) = (0..creds.len()).find(|&i| creds[i].is_eligible()) else {
            debug!("warm-up skipped, no eligible credential");
            return;
        };

        if creds[i].access_token.is_some() && !creds[i].is_expired(now) {
            return;
        }

        match self.exchanger.exchange(&creds[i].config).await {
            Ok(grant) => apply_grant(&mut creds[i], grant),
            Err(e) => {
                warn!(credential = %creds[i].masked_token(), error = %e, "warm-up refresh failed");
                record_failure(&mut creds[i], &e);
            }
        }
    }
}

fn apply_grant(cred: &mut Credential, grant: TokenGrant) {
    cred.access_token = Some(grant.access_token);
    cred.expires_at = Some(grant.expires_at);
    cred.last_refresh = Some(Utc::now());
    cred.last_error = None;
    cred.rate_limited = false;
    if let Some(remaining) = grant.remaining {
        cred.remaining = remaining;
    }
}

/// A provider outage must not evict a credential; only an
/// invalid-credential class error marks it unusable.
fn record_failure(cred: &mut Credential, error: &GatewayError) {
    warn!(credential = %cred.masked_token(), error = %error, "credential error");
    cred.last_error = Some(error.to_string());
    match error {
        GatewayError::UpstreamAuth(_) => cred.unusable = true,
        GatewayError::UpstreamRateLimited(_) => cred.rate_limited = true,
        _ => {}
    }
}

fn charge(creds: &mut [Credential], i: usize) -> (AcquiredCredential, PoolUsage) {
    creds[i].remaining -= 1;
    creds[i].rate_limited = false;

    let acquired = AcquiredCredential {
        access_token: creds[i]
            .access_token
            .clone()
            .expect("charged credential has a token"),
        refresh_token: creds[i].config.refresh_token.clone(),
        masked: creds[i].masked_token(),
    };

    let usage = PoolUsage {
        total: creds.len(),
        eligible: creds.iter().filter(|c| c.is_eligible()).count(),
        remaining_total: creds.iter().map(|c| c.remaining as u64).sum(),
    };

    debug!(
        credential = %acquired.masked,
        remaining = creds[i].remaining,
        "credential acquired"
    );
    (acquired, usage)
}

fn least_recently_refreshed_expired(
    creds: &[Credential],
    now: chrono::DateTime<Utc>,
) -> Option<usize> {
    (0..creds.len())
        .filter(|&i| {
            !creds[i].config.disabled && !creds[i].unusable && creds[i].is_expired(now)
        })
        .min_by_key(|&i| creds[i].last_refresh)
}
