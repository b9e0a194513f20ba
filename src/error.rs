use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No usable credentials available")]
    NoCredentialsAvailable,

    #[error("Corrupt event-stream frame: {0}")]
    FrameCorruption(String),

    #[error("Event stream truncated with {0} buffered bytes")]
    TruncatedStream(usize),

    #[error("Upstream rejected credential: {0}")]
    UpstreamAuth(String),

    #[error("Upstream rate limited: {0}")]
    UpstreamRateLimited(String),

    #[error("Upstream service error: {0}")]
    UpstreamService(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether rotating to a different credential could let the request
    /// succeed. Corruption, truncation and client-side errors cannot be
    /// recovered that way.
    pub fn is_rotatable(&self) -> bool {
        matches!(self, GatewayError::UpstreamAuth(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
