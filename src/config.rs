use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::auth::credential::CredentialConfig;
use crate::error::{GatewayError, Result};

/// Env var holding either credential JSON or a path to a credential file.
const AUTH_TOKEN_ENV: &str = "KIRO_AUTH_TOKEN";
/// Default file used to persist credentials added at runtime.
const DEFAULT_AUTH_FILE: &str = "auth_config.json";

/// Env vars from older releases; recognized only to warn about them.
const DEPRECATED_ENV_VARS: &[&str] = &[
    "REFRESH_TOKEN",
    "AWS_REFRESHTOKEN",
    "IDC_REFRESH_TOKEN",
    "BULK_REFRESH_TOKENS",
];

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Static bearer key protecting the /v1 routes; empty disables the
    /// check (local development).
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_backend_endpoint")]
    pub backend_endpoint: String,

    #[serde(default = "default_social_auth_endpoint")]
    pub social_auth_endpoint: String,

    #[serde(default = "default_idc_auth_endpoint")]
    pub idc_auth_endpoint: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_backend_endpoint() -> String {
    "https://codewhisperer.us-east-1.amazonaws.com".to_string()
}

fn default_social_auth_endpoint() -> String {
    "https://prod.us-east-1.auth.desktop.kiro.dev".to_string()
}

fn default_idc_auth_endpoint() -> String {
    "https://oidc.us-east-1.amazonaws.com".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            api_key: String::new(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            backend_endpoint: default_backend_endpoint(),
            social_auth_endpoint: default_social_auth_endpoint(),
            idc_auth_endpoint: default_idc_auth_endpoint(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = GatewayConfig::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// TOML file overlaid with environment variables.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("failed to read config file: {e}")))?;

        let mut config: GatewayConfig = toml::from_str(&contents)
            .map_err(|e| GatewayError::Config(format!("failed to parse config file: {e}")))?;

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = env::var("KIRO_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(key) = env::var("KIRO_API_KEY") {
            self.server.api_key = key;
        }
        if let Ok(endpoint) = env::var("KIRO_BACKEND_ENDPOINT") {
            self.upstream.backend_endpoint = endpoint;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addr.is_empty() {
            return Err(GatewayError::Config("listen_addr is empty".into()));
        }
        if self.upstream.backend_endpoint.is_empty() {
            return Err(GatewayError::Config("backend_endpoint is empty".into()));
        }
        Ok(())
    }
}

/// Load credential configs with the established precedence: env var as a
/// file path, then the default file, then the env var as inline JSON.
/// Returns the configs plus the path future add/remove operations
/// persist to. An empty pool is a valid start; accounts can be added at
/// runtime.
pub fn load_credentials() -> Result<(Vec<CredentialConfig>, PathBuf)> {
    for var in DEPRECATED_ENV_VARS {
        if env::var(var).is_ok() {
            warn!(
                variable = var,
                "deprecated credential variable detected; migrate to {AUTH_TOKEN_ENV} JSON"
            );
        }
    }

    let default_path = PathBuf::from(DEFAULT_AUTH_FILE);
    let env_value = env::var(AUTH_TOKEN_ENV).unwrap_or_default();

    if !env_value.is_empty() {
        let as_path = Path::new(&env_value);
        if as_path.is_file() {
            let configs = load_credentials_from_file(as_path)?;
            return Ok((configs, as_path.to_path_buf()));
        }
    }

    if default_path.is_file() {
        let configs = load_credentials_from_file(&default_path)?;
        return Ok((configs, default_path));
    }

    if env_value.is_empty() {
        info!(
            "no {AUTH_TOKEN_ENV} configured; starting with an empty credential pool, \
             accounts added over the API persist to {DEFAULT_AUTH_FILE}"
        );
        return Ok((Vec::new(), default_path));
    }

    debug!("parsing {AUTH_TOKEN_ENV} as inline JSON");
    let configs = parse_credential_json(&env_value)?;
    Ok((process_configs(configs), default_path))
}

fn load_credentials_from_file(path: &Path) -> Result<Vec<CredentialConfig>> {
    let contents = fs::read_to_string(path).map_err(|e| {
        GatewayError::Config(format!(
            "failed to read credential file {}: {e}",
            path.display()
        ))
    })?;

    let configs = parse_credential_json(&contents)?;
    let valid = process_configs(configs);
    info!(
        path = %path.display(),
        count = valid.len(),
        "loaded credential configs"
    );
    Ok(valid)
}

/// Accepts either an array of credential objects or a single object.
fn parse_credential_json(json: &str) -> Result<Vec<CredentialConfig>> {
    if let Ok(configs) = serde_json::from_str::<Vec<CredentialConfig>>(json) {
        return Ok(configs);
    }

    serde_json::from_str::<CredentialConfig>(json)
        .map(|single| vec![single])
        .map_err(|e| GatewayError::Config(format!("invalid credential JSON: {e}")))
}

/// Drop entries that fail admission or are disabled; malformed entries
/// must never crash startup.
fn process_configs(configs: Vec<CredentialConfig>) -> Vec<CredentialConfig> {
    let total = configs.len();
    let valid: Vec<CredentialConfig> = configs
        .into_iter()
        .filter(|c| {
            if c.disabled {
                return false;
            }
            match c.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "skipping invalid credential config");
                    false
                }
            }
        })
        .collect();

    if valid.len() < total {
        warn!(total, valid = valid.len(), "some credential configs were skipped");
    }
    valid
}

/// Persist the credential list with owner-only permissions; the file
/// holds refresh tokens.
pub fn save_credentials(path: &Path, configs: &[CredentialConfig]) -> Result<()> {
    let data = serde_json::to_string_pretty(configs)?;
    fs::write(path, data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    info!(path = %path.display(), count = configs.len(), "credential configs persisted");
    Ok(())
}
