use std::collections::HashSet;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;

use kiro_gateway::auth::credential::DEFAULT_USAGE_ALLOWANCE;
use kiro_gateway::auth::{CredentialConfig, CredentialPool, TokenExchanger, TokenGrant};
use kiro_gateway::client::{Backend, BackendStream, OpenFuture};
use kiro_gateway::config::GatewayConfig;
use kiro_gateway::handler::{AppState, handle_chat_completions, handle_messages};
use kiro_gateway::models::claude::ClaudeRequest;
use kiro_gateway::models::kiro::KiroRequest;
use kiro_gateway::models::openai::OpenAiRequest;
use kiro_gateway::streaming::Frame;
use kiro_gateway::transform::ToolSchemaCache;

struct GrantingExchanger;

impl TokenExchanger for GrantingExchanger {
    fn exchange(&self, config: &CredentialConfig) -> kiro_gateway::auth::exchange::ExchangeFuture {
        let token = format!("at-{}", config.refresh_token);
        Box::pin(async move {
            Ok(TokenGrant {
                access_token: token,
                expires_at: Utc::now() + chrono::Duration::hours(1),
                remaining: None,
            })
        })
    }
}

/// Backend that replays a scripted byte stream, optionally rejecting
/// specific access tokens the way the real backend rejects a revoked
/// credential.
struct ScriptedBackend {
    chunks: Vec<Vec<u8>>,
    reject_tokens: HashSet<String>,
}

impl Backend for ScriptedBackend {
    fn open(&self, _request: &KiroRequest, access_token: &str) -> OpenFuture {
        if self.reject_tokens.contains(access_token) {
            let token = access_token.to_string();
            return Box::pin(async move {
                Err(kiro_gateway::GatewayError::UpstreamAuth(format!(
                    "token {token} rejected"
                )))
            });
        }

        let chunks = self.chunks.clone();
        Box::pin(async move {
            let stream = futures::stream::iter(
                chunks.into_iter().map(|c| Ok(Bytes::from(c))),
            );
            Ok(Box::pin(stream) as BackendStream)
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn three_frame_wire() -> Vec<u8> {
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&Frame::encode(
        "assistantResponseEvent",
        br#"{"content":"Hi"}"#,
    ));
    wire.extend_from_slice(&Frame::encode(
        "assistantResponseEvent",
        br#"{"content":" there"}"#,
    ));
    wire.extend_from_slice(&Frame::encode(
        "messageStopEvent",
        br#"{"stopReason":"end_turn"}"#,
    ));
    wire.to_vec()
}

/// Split a wire capture into fixed-size network chunks.
fn chunked(wire: &[u8], size: usize) -> Vec<Vec<u8>> {
    wire.chunks(size).map(|c| c.to_vec()).collect()
}

fn make_state(chunks: Vec<Vec<u8>>, credentials: Vec<&str>) -> Arc<AppState> {
    make_state_rejecting(chunks, credentials, &[])
}

fn make_state_rejecting(
    chunks: Vec<Vec<u8>>,
    credentials: Vec<&str>,
    reject: &[&str],
) -> Arc<AppState> {
    let configs = credentials
        .into_iter()
        .map(|t| serde_json::from_str(&format!(r#"{{"refreshToken":"{t}"}}"#)).unwrap())
        .collect();

    Arc::new(AppState {
        pool: CredentialPool::new(configs, Arc::new(GrantingExchanger)),
        backend: Arc::new(ScriptedBackend {
            chunks,
            reject_tokens: reject.iter().map(|t| t.to_string()).collect(),
        }),
        tool_cache: ToolSchemaCache::new(),
        config: GatewayConfig::default(),
        auth_path: std::env::temp_dir().join("kiro-gateway-pipeline-test.json"),
    })
}

fn claude_request(stream: bool) -> ClaudeRequest {
    serde_json::from_value(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 100,
        "messages": [{"role": "user", "content": "Hi"}],
        "stream": stream
    }))
    .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn sse_event_names(body: &str) -> Vec<&str> {
    body.lines()
        .filter_map(|l| l.strip_prefix("event: "))
        .collect()
}

#[tokio::test]
async fn anthropic_three_frame_stream_renders_in_order() {
    let state = make_state(chunked(&three_frame_wire(), 5), vec!["rt-primary-001"]);

    let response = handle_messages(State(state), Json(claude_request(true))).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = body_string(response).await;
    assert_eq!(
        sse_event_names(&body),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    assert!(body.contains(r#""text":"Hi""#));
    assert!(body.contains(r#""text":" there""#));
    assert!(body.contains(r#""stop_reason":"end_turn""#));
}

#[tokio::test]
async fn openai_same_stream_renders_chunked_deltas() {
    let state = make_state(chunked(&three_frame_wire(), 5), vec!["rt-primary-001"]);

    let request: OpenAiRequest = serde_json::from_value(serde_json::json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 100,
        "messages": [{"role": "user", "content": "Hi"}],
        "stream": true
    }))
    .unwrap();

    let response = handle_chat_completions(State(state), Json(request)).await;
    assert_eq!(response.status(), 200);

    let body = body_string(response).await;
    let content_chunks: Vec<&str> = body
        .lines()
        .filter(|l| l.contains(r#""content":"Hi""#) || l.contains(r#""content":" there""#))
        .collect();
    assert_eq!(content_chunks.len(), 2);

    let finish_pos = body.find(r#""finish_reason":"stop""#).unwrap();
    let done_pos = body.find("data: [DONE]").unwrap();
    assert!(finish_pos < done_pos);
}

#[tokio::test]
async fn tool_call_fragments_reassemble_to_original_arguments() {
    let original_args = serde_json::json!({"city": "Oslo", "unit": "celsius"});
    let args_json = serde_json::to_string(&original_args).unwrap();

    // Split the argument JSON into three uneven fragments across frames.
    let (a, rest) = args_json.split_at(5);
    let (b, c) = rest.split_at(11);

    let mut wire = BytesMut::new();
    wire.extend_from_slice(&Frame::encode(
        "toolUseEvent",
        br#"{"name":"get_weather","toolUseId":"toolu_rt_01"}"#,
    ));
    for fragment in [a, b, c] {
        let payload = serde_json::json!({"input": fragment}).to_string();
        wire.extend_from_slice(&Frame::encode("toolUseEvent", payload.as_bytes()));
    }
    wire.extend_from_slice(&Frame::encode("toolUseEvent", br#"{"stop":true}"#));
    wire.extend_from_slice(&Frame::encode(
        "messageStopEvent",
        br#"{"stopReason":"tool_use"}"#,
    ));

    let state = make_state(chunked(&wire, 9), vec!["rt-primary-001"]);
    let response = handle_messages(State(state), Json(claude_request(true))).await;
    let body = body_string(response).await;

    // Reassemble the partial_json fragments in emission order.
    let mut reassembled = String::new();
    for line in body.lines() {
        if let Some(data) = line.strip_prefix("data: ") {
            let value: serde_json::Value = serde_json::from_str(data).unwrap();
            if value["delta"]["type"] == "input_json_delta" {
                reassembled.push_str(value["delta"]["partial_json"].as_str().unwrap());
            }
        }
    }

    let parsed: serde_json::Value = serde_json::from_str(&reassembled).unwrap();
    assert_eq!(parsed, original_args);
}

#[tokio::test]
async fn non_streaming_request_aggregates_to_one_message() {
    let state = make_state(chunked(&three_frame_wire(), 7), vec!["rt-primary-001"]);

    let response = handle_messages(State(state), Json(claude_request(false))).await;
    assert_eq!(response.status(), 200);

    let body: serde_json::Value =
        serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["content"][0]["text"], "Hi there");
    assert_eq!(body["stop_reason"], "end_turn");
}

#[tokio::test]
async fn corrupt_stream_appends_error_event_after_partial_output() {
    let mut wire = Vec::new();
    wire.extend_from_slice(&Frame::encode(
        "assistantResponseEvent",
        br#"{"content":"Hi"}"#,
    ));
    // Garbage after a valid frame: a length prefix the checksum refutes.
    let mut bad = Frame::encode("assistantResponseEvent", br#"{"content":"lost"}"#).to_vec();
    let len = bad.len();
    bad[len - 6] ^= 0xFF;
    wire.extend_from_slice(&bad);

    let state = make_state(chunked(&wire, 11), vec!["rt-primary-001"]);
    let response = handle_messages(State(state), Json(claude_request(true))).await;
    let body = body_string(response).await;

    let names = sse_event_names(&body);
    assert!(names.contains(&"content_block_delta"));
    assert_eq!(*names.last().unwrap(), "error");
    assert!(!names.contains(&"message_stop"));
}

#[tokio::test]
async fn truncated_stream_appends_error_event() {
    let wire = three_frame_wire();
    // Drop the tail of the final frame.
    let truncated = wire[..wire.len() - 4].to_vec();

    let state = make_state(chunked(&truncated, 13), vec!["rt-primary-001"]);
    let response = handle_messages(State(state), Json(claude_request(true))).await;
    let body = body_string(response).await;

    let names = sse_event_names(&body);
    assert_eq!(*names.last().unwrap(), "error");
    assert!(body.contains("truncated"));
}

#[tokio::test]
async fn rejected_credential_rotates_to_next() {
    let state = make_state_rejecting(
        chunked(&three_frame_wire(), 6),
        vec!["rt-revoked-0001", "rt-healthy-0002"],
        &["at-rt-revoked-0001"],
    );

    let response = handle_messages(State(state.clone()), Json(claude_request(true))).await;
    assert_eq!(response.status(), 200);

    let body = body_string(response).await;
    assert!(body.contains("message_stop"));

    let snapshot = state.pool.snapshot().await;
    assert!(snapshot[0].unusable);
    assert!(!snapshot[1].unusable);
}

#[tokio::test]
async fn empty_pool_returns_service_unavailable() {
    let state = make_state(chunked(&three_frame_wire(), 5), vec![]);

    let response = handle_messages(State(state), Json(claude_request(true))).await;
    assert_eq!(response.status(), 503);

    let body: serde_json::Value =
        serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["type"], "error");
}

#[tokio::test]
async fn client_disconnect_keeps_usage_charged() {
    let state = make_state(chunked(&three_frame_wire(), 5), vec!["rt-primary-001"]);

    let response = handle_messages(State(state.clone()), Json(claude_request(true))).await;
    let mut data = response.into_body().into_data_stream();

    // Read one chunk, then hang up.
    let first = data.next().await;
    assert!(first.is_some());
    drop(data);

    let snapshot = state.pool.snapshot().await;
    assert_eq!(snapshot[0].remaining, DEFAULT_USAGE_ALLOWANCE - 1);
}
