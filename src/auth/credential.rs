use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Usage allowance granted per refresh when the identity provider does
/// not report a quota of its own.
pub const DEFAULT_USAGE_ALLOWANCE: u32 = 500;

/// How a credential authenticates against the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthKind {
    #[default]
    Social,
    IdC,
}

/// Persisted credential record, the JSON shape written to the auth
/// config file: `{"auth", "refreshToken", "clientId"?, "clientSecret"?,
/// "disabled"?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialConfig {
    #[serde(default)]
    pub auth: AuthKind,

    pub refresh_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

impl CredentialConfig {
    /// Admission rules: a refresh token is mandatory, and IdC needs the
    /// client pair.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::GatewayError;

        if self.refresh_token.trim().is_empty() {
            return Err(GatewayError::Config("refreshToken must not be empty".into()));
        }

        if self.auth == AuthKind::IdC
            && (self.client_id.as_deref().unwrap_or("").is_empty()
                || self.client_secret.as_deref().unwrap_or("").is_empty())
        {
            return Err(GatewayError::Config(
                "IdC credentials require clientId and clientSecret".into(),
            ));
        }

        Ok(())
    }
}

/// Runtime credential record owned by the pool.
#[derive(Debug, Clone)]
pub struct Credential {
    pub config: CredentialConfig,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining: u32,
    pub last_error: Option<String>,
    pub last_refresh: Option<DateTime<Utc>>,
    /// Set when the last error was invalid-credential class; such a
    /// credential is skipped by selection until re-added.
    pub unusable: bool,
    /// Set on a throttling error; cleared by the next successful refresh
    /// or use. A rate-limited credential stays in rotation.
    pub rate_limited: bool,
}

impl Credential {
    pub fn new(config: CredentialConfig) -> Self {
        Self {
            config,
            access_token: None,
            expires_at: None,
            remaining: DEFAULT_USAGE_ALLOWANCE,
            last_error: None,
            last_refresh: None,
            unusable: false,
            rate_limited: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    /// Eligible for selection: enabled, quota left, not known-bad.
    pub fn is_eligible(&self) -> bool {
        !self.config.disabled && self.remaining > 0 && !self.unusable
    }

    pub fn masked_token(&self) -> String {
        mask_secret(&self.config.refresh_token)
    }

    pub fn snapshot(&self, index: usize) -> CredentialSnapshot {
        CredentialSnapshot {
            index,
            auth: self.config.auth,
            refresh_token: self.masked_token(),
            disabled: self.config.disabled,
            remaining: self.remaining,
            expires_at: self.expires_at,
            last_error: self.last_error.clone(),
            unusable: self.unusable,
        }
    }
}

/// Observability view of one pooled credential; the secret stays masked.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSnapshot {
    pub index: usize,
    pub auth: AuthKind,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
    pub disabled: bool,
    pub remaining: u32,
    #[serde(rename = "expiresAt")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    pub unusable: bool,
}

/// Keep enough of a secret to recognize it in logs, never enough to use.
pub fn mask_secret(secret: &str) -> String {
    if secret.len() <= 8 {
        "****".to_string()
    } else {
        format!("{}****{}", &secret[..4], &secret[secret.len() - 4..])
    }
}
