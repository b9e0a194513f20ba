use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::{
    Json,
    body::Body,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::auth::credential::CredentialConfig;
use crate::auth::pool::{AcquiredCredential, CredentialPool, PoolUsage};
use crate::client::{Backend, BackendStream};
use crate::config::{GatewayConfig, save_credentials};
use crate::error::{GatewayError, Result};
use crate::models::claude::{ClaudeRequest, validate_claude_request};
use crate::models::kiro::KiroRequest;
use crate::models::openai::OpenAiRequest;
use crate::streaming::{
    EventTranslator, FrameDecoder, OpenAiEncoder, SseEncoder, StreamEvent,
};
use crate::transform::{
    RequestBudget, ToolSchemaCache, adapt_request, estimate_budget, openai_to_claude,
};

/// Bounds on the dynamically computed streaming deadline.
const MIN_STREAM_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_STREAM_TIMEOUT: Duration = Duration::from_secs(600);
const BASE_STREAM_SECS: u64 = 45;
/// Extra headroom for tool-enabled requests; tool turns run longer.
const TOOL_BONUS_SECS: u64 = 90;
/// Budget tokens per additional deadline second.
const TOKENS_PER_SECOND: u64 = 250;

/// Credential rotations allowed for one request before giving up.
const MAX_CREDENTIAL_ROTATIONS: usize = 3;
/// Backoff before the single pool-exhausted retry.
const POOL_RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct AppState {
    pub pool: CredentialPool,
    pub backend: Arc<dyn Backend>,
    pub tool_cache: ToolSchemaCache,
    pub config: GatewayConfig,
    pub auth_path: PathBuf,
}

/// Deadline for the streaming phase, proportional to the request's
/// effective token budget and clamped to fixed bounds.
pub fn stream_deadline(budget: &RequestBudget) -> Duration {
    let mut secs = BASE_STREAM_SECS + budget.total() as u64 / TOKENS_PER_SECOND;
    if budget.has_tools {
        secs += TOOL_BONUS_SECS;
    }
    Duration::from_secs(secs).clamp(MIN_STREAM_TIMEOUT, MAX_STREAM_TIMEOUT)
}

/// Which client-facing wire format a response is rendered in.
enum DialectEncoder {
    Anthropic(SseEncoder),
    OpenAi(OpenAiEncoder),
}

impl DialectEncoder {
    fn encode(&mut self, event: StreamEvent) -> Vec<String> {
        match self {
            DialectEncoder::Anthropic(enc) => enc.encode(event),
            DialectEncoder::OpenAi(enc) => enc.encode(event),
        }
    }

    fn render_error(&self, message: &str) -> String {
        match self {
            DialectEncoder::Anthropic(_) => SseEncoder::format_error("upstream_error", message),
            DialectEncoder::OpenAi(_) => OpenAiEncoder::format_error(message),
        }
    }
}

// ---------------------------------------------------------------------------
// Anthropic dialect: POST /v1/messages
// ---------------------------------------------------------------------------

pub async fn handle_messages(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClaudeRequest>,
) -> Response {
    if let Err(e) = validate_claude_request(&req) {
        return error_response(&e, Dialect::Anthropic);
    }

    let budget = estimate_budget(&req);
    let kiro_req = match adapt_request(&req, &state.tool_cache) {
        Ok(r) => r,
        Err(e) => return error_response(&e, Dialect::Anthropic),
    };

    let (acquired, source) = match open_with_rotation(&state, &kiro_req).await {
        Ok(pair) => pair,
        Err(e) => return error_response(&e, Dialect::Anthropic),
    };

    let deadline = stream_deadline(&budget);
    info!(
        credential = %acquired.masked,
        deadline_secs = deadline.as_secs(),
        streaming = req.stream,
        "request accepted"
    );

    if req.stream {
        let encoder = DialectEncoder::Anthropic(SseEncoder::new(req.model.clone()));
        sse_response(drive_stream(source, encoder, deadline))
    } else {
        match collect_events(source, deadline).await {
            Ok(collected) => Json(render_claude_message(&req.model, &collected)).into_response(),
            Err(e) => error_response(&e, Dialect::Anthropic),
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAI dialect: POST /v1/chat/completions
// ---------------------------------------------------------------------------

pub async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    Json(openai_req): Json<OpenAiRequest>,
) -> Response {
    let req = match openai_to_claude(openai_req) {
        Ok(r) => r,
        Err(e) => return error_response(&e, Dialect::OpenAi),
    };
    if let Err(e) = validate_claude_request(&req) {
        return error_response(&e, Dialect::OpenAi);
    }

    let budget = estimate_budget(&req);
    let kiro_req = match adapt_request(&req, &state.tool_cache) {
        Ok(r) => r,
        Err(e) => return error_response(&e, Dialect::OpenAi),
    };

    let (acquired, source) = match open_with_rotation(&state, &kiro_req).await {
        Ok(pair) => pair,
        Err(e) => return error_response(&e, Dialect::OpenAi),
    };

    let deadline = stream_deadline(&budget);
    info!(
        credential = %acquired.masked,
        deadline_secs = deadline.as_secs(),
        streaming = req.stream,
        "request accepted"
    );

    if req.stream {
        let encoder =
            DialectEncoder::OpenAi(OpenAiEncoder::new(req.model.clone(), unix_now()));
        sse_response(drive_stream(source, encoder, deadline))
    } else {
        match collect_events(source, deadline).await {
            Ok(collected) => {
                Json(render_openai_completion(&req.model, &collected)).into_response()
            }
            Err(e) => error_response(&e, Dialect::OpenAi),
        }
    }
}

// ---------------------------------------------------------------------------
// Credential acquisition and rotation
// ---------------------------------------------------------------------------

/// Acquire a credential and open the backend stream, rotating to the
/// next credential when the backend rejects the token. A pool that is
/// only rate-limited earns one retry after a short backoff.
async fn open_with_rotation(
    state: &AppState,
    request: &KiroRequest,
) -> Result<(AcquiredCredential, BackendStream)> {
    for rotation in 0..MAX_CREDENTIAL_ROTATIONS {
        let (acquired, usage) = acquire_with_retry(&state.pool).await?;
        info!(
            credential = %acquired.masked,
            eligible = usage.eligible,
            remaining_total = usage.remaining_total,
            "credential selected"
        );

        match state.backend.open(request, &acquired.access_token).await {
            Ok(stream) => return Ok((acquired, stream)),
            Err(e) if e.is_rotatable() => {
                warn!(
                    credential = %acquired.masked,
                    rotation,
                    error = %e,
                    "backend rejected credential, rotating"
                );
                state.pool.report_failure(&acquired.refresh_token, &e).await;
            }
            Err(e) => {
                if matches!(e, GatewayError::UpstreamRateLimited(_)) {
                    state.pool.report_failure(&acquired.refresh_token, &e).await;
                }
                return Err(e);
            }
        }
    }

    Err(GatewayError::NoCredentialsAvailable)
}

async fn acquire_with_retry(
    pool: &CredentialPool,
) -> Result<(AcquiredCredential, PoolUsage)> {
    match pool.acquire_with_usage().await {
        Err(GatewayError::NoCredentialsAvailable) if pool.any_rate_limited().await => {
            tokio::time::sleep(POOL_RETRY_BACKOFF).await;
            pool.acquire_with_usage().await
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Stream driving
// ---------------------------------------------------------------------------

/// Run the decode → translate → encode chain over the backend stream.
///
/// Every rendered chunk is yielded as soon as it exists, so a slow
/// client backpressures the backend read. Failures after the first byte
/// are appended as an in-stream error record; the stream then ends.
/// Dropping the returned stream (client disconnect) drops the backend
/// connection with it; the usage charge is not refunded.
fn drive_stream(
    mut source: BackendStream,
    mut encoder: DialectEncoder,
    deadline: Duration,
) -> impl futures::Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send {
    async_stream::stream! {
        let mut decoder = FrameDecoder::new();
        let mut translator = EventTranslator::new();
        let started = Instant::now();
        let mut terminal_error: Option<String> = None;

        'read: loop {
            if translator.stopped() {
                break;
            }

            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                terminal_error = Some(encoder.render_error("stream deadline exceeded"));
                break;
            };

            let chunk = match tokio::time::timeout(remaining, source.next()).await {
                Err(_) => {
                    terminal_error = Some(encoder.render_error("stream deadline exceeded"));
                    break;
                }
                Ok(None) => {
                    if let Err(e) = decoder.finish() {
                        terminal_error = Some(encoder.render_error(&e.to_string()));
                    } else if let Some(incomplete) = translator.finish() {
                        terminal_error = Some(encoder.render_error(&format!(
                            "stream ended mid tool call {} ({}); partial arguments: {}",
                            incomplete.id, incomplete.name, incomplete.partial_arguments
                        )));
                    } else if !translator.stopped() {
                        terminal_error = Some(
                            encoder.render_error("backend closed the stream before completion"),
                        );
                    }
                    break;
                }
                Ok(Some(Err(e))) => {
                    terminal_error = Some(encoder.render_error(&e.to_string()));
                    break;
                }
                Ok(Some(Ok(bytes))) => bytes,
            };

            let frames = match decoder.feed(&chunk) {
                Ok(frames) => frames,
                Err(e) => {
                    error!(error = %e, "frame decoding failed");
                    terminal_error = Some(encoder.render_error(&e.to_string()));
                    break;
                }
            };

            for frame in frames {
                let events = match translator.translate(&frame) {
                    Ok(events) => events,
                    Err(e) => {
                        error!(error = %e, "frame translation failed");
                        terminal_error = Some(encoder.render_error(&e.to_string()));
                        break 'read;
                    }
                };

                for event in events {
                    for rendered in encoder.encode(event) {
                        yield Ok(Bytes::from(rendered));
                    }
                }
            }
        }

        if let Some(rendered) = terminal_error {
            yield Ok(Bytes::from(rendered));
        }
    }
}

fn sse_response(
    stream: impl futures::Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + 'static,
) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(Body::from_stream(stream))
        .expect("static header set is valid")
}

// ---------------------------------------------------------------------------
// Non-streaming aggregation
// ---------------------------------------------------------------------------

struct CollectedMessage {
    events: Vec<StreamEvent>,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: String,
}

/// Drain the whole backend stream into memory for a non-streaming
/// response. Any failure here happened before the client saw a byte, so
/// a plain error response is still possible.
async fn collect_events(mut source: BackendStream, deadline: Duration) -> Result<CollectedMessage> {
    let mut decoder = FrameDecoder::new();
    let mut translator = EventTranslator::new();
    let mut events = Vec::new();
    let mut stop_reason = "end_turn".to_string();
    let started = Instant::now();

    loop {
        if translator.stopped() {
            break;
        }

        let remaining = deadline
            .checked_sub(started.elapsed())
            .ok_or_else(|| GatewayError::UpstreamService("stream deadline exceeded".into()))?;

        let chunk = match tokio::time::timeout(remaining, source.next()).await {
            Err(_) => {
                return Err(GatewayError::UpstreamService("stream deadline exceeded".into()));
            }
            Ok(None) => {
                decoder.finish()?;
                if let Some(incomplete) = translator.finish() {
                    return Err(GatewayError::UpstreamService(format!(
                        "stream ended mid tool call {}",
                        incomplete.id
                    )));
                }
                break;
            }
            Ok(Some(chunk)) => chunk?,
        };

        for frame in decoder.feed(&chunk)? {
            for event in translator.translate(&frame)? {
                if let StreamEvent::MessageStop { stop_reason: reason } = &event {
                    stop_reason = reason.clone();
                }
                events.push(event);
            }
        }
    }

    let (input_tokens, output_tokens) = translator.usage();
    Ok(CollectedMessage {
        events,
        input_tokens,
        output_tokens,
        stop_reason,
    })
}

fn render_claude_message(model: &str, collected: &CollectedMessage) -> serde_json::Value {
    let mut content = Vec::new();
    let mut text = String::new();
    let mut tool_blocks: Vec<(String, String, String)> = Vec::new();

    for event in &collected.events {
        match event {
            StreamEvent::TextDelta { text: t } => text.push_str(t),
            StreamEvent::ToolUseStart { id, name } => {
                tool_blocks.push((id.clone(), name.clone(), String::new()));
            }
            StreamEvent::ToolUseDelta { id, fragment } => {
                if let Some(block) = tool_blocks.iter_mut().find(|(bid, _, _)| bid == id) {
                    block.2.push_str(fragment);
                }
            }
            _ => {}
        }
    }

    if !text.is_empty() {
        content.push(serde_json::json!({"type": "text", "text": text}));
    }
    for (id, name, args) in tool_blocks {
        let input: serde_json::Value =
            serde_json::from_str(&args).unwrap_or(serde_json::Value::Object(Default::default()));
        content.push(serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input
        }));
    }

    serde_json::json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": collected.stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": collected.input_tokens,
            "output_tokens": collected.output_tokens
        }
    })
}

fn render_openai_completion(model: &str, collected: &CollectedMessage) -> serde_json::Value {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for event in &collected.events {
        match event {
            StreamEvent::TextDelta { text: t } => text.push_str(t),
            StreamEvent::ToolUseStart { id, name } => {
                tool_calls.push(serde_json::json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": String::new()}
                }));
            }
            StreamEvent::ToolUseDelta { id, fragment } => {
                if let Some(call) = tool_calls.iter_mut().find(|c| c["id"] == *id) {
                    let args = call["function"]["arguments"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    call["function"]["arguments"] =
                        serde_json::Value::String(format!("{args}{fragment}"));
                }
            }
            _ => {}
        }
    }

    let mut message = serde_json::json!({"role": "assistant", "content": text});
    if !tool_calls.is_empty() {
        message["tool_calls"] = serde_json::Value::Array(tool_calls);
    }

    serde_json::json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": unix_now(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": crate::streaming::openai::finish_reason_for(&collected.stop_reason)
        }],
        "usage": {
            "prompt_tokens": collected.input_tokens,
            "completion_tokens": collected.output_tokens,
            "total_tokens": collected.input_tokens + collected.output_tokens
        }
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Admin API: credential management
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TokenApiResponse {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

pub async fn handle_list_tokens(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.pool.snapshot().await;
    Json(serde_json::json!({
        "count": snapshot.len(),
        "credentials": snapshot
    }))
    .into_response()
}

pub async fn handle_add_token(
    State(state): State<Arc<AppState>>,
    Json(config): Json<CredentialConfig>,
) -> Response {
    match state.pool.add(config).await {
        Ok(count) => {
            persist_pool(&state).await;
            (
                StatusCode::OK,
                Json(TokenApiResponse {
                    success: true,
                    message: Some("credential added".into()),
                    error: None,
                    count: Some(count),
                }),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "rejected credential add");
            (
                StatusCode::BAD_REQUEST,
                Json(TokenApiResponse {
                    success: false,
                    message: None,
                    error: Some(e.to_string()),
                    count: None,
                }),
            )
                .into_response()
        }
    }
}

pub async fn handle_delete_token(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Response {
    match state.pool.remove(index).await {
        Ok(count) => {
            persist_pool(&state).await;
            (
                StatusCode::OK,
                Json(TokenApiResponse {
                    success: true,
                    message: Some("credential removed".into()),
                    error: None,
                    count: Some(count),
                }),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(TokenApiResponse {
                success: false,
                message: None,
                error: Some(e.to_string()),
                count: None,
            }),
        )
            .into_response(),
    }
}

async fn persist_pool(state: &AppState) {
    let configs = state.pool.configs().await;
    if let Err(e) = save_credentials(&state.auth_path, &configs) {
        error!(error = %e, "failed to persist credential configs");
    }
}

// ---------------------------------------------------------------------------
// Bearer auth on the /v1 surface
// ---------------------------------------------------------------------------

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let expected = &state.config.server.api_key;
    if expected.is_empty() {
        return next.run(request).await;
    }

    let provided = bearer_token(&request).or_else(|| {
        request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
    });

    if provided == Some(expected.as_str()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "type": "error",
                "error": {"type": "authentication_error", "message": "invalid API key"}
            })),
        )
            .into_response()
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

// ---------------------------------------------------------------------------
// Error rendering
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Dialect {
    Anthropic,
    OpenAi,
}

fn error_response(err: &GatewayError, dialect: Dialect) -> Response {
    let status = match err {
        GatewayError::NoCredentialsAvailable => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::InvalidRequest(_)
        | GatewayError::UnsupportedModel(_)
        | GatewayError::Config(_)
        | GatewayError::Json(_) => StatusCode::BAD_REQUEST,
        GatewayError::UpstreamRateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::UpstreamAuth(_)
        | GatewayError::UpstreamService(_)
        | GatewayError::FrameCorruption(_)
        | GatewayError::TruncatedStream(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    error!(status = %status, error = %err, "request failed");

    let body = match dialect {
        Dialect::Anthropic => serde_json::json!({
            "type": "error",
            "error": {"type": error_type_name(err), "message": err.to_string()}
        }),
        Dialect::OpenAi => serde_json::json!({
            "error": {"type": error_type_name(err), "message": err.to_string()}
        }),
    };

    (status, Json(body)).into_response()
}

fn error_type_name(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::NoCredentialsAvailable => "overloaded_error",
        GatewayError::InvalidRequest(_) | GatewayError::Json(_) => "invalid_request_error",
        GatewayError::UnsupportedModel(_) => "not_found_error",
        GatewayError::UpstreamRateLimited(_) => "rate_limit_error",
        GatewayError::UpstreamAuth(_) => "authentication_error",
        _ => "api_error",
    }
}
