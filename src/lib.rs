//! # Kiro Gateway
//!
//! A protocol-translating API gateway for the Kiro/CodeWhisperer
//! streaming backend.
//!
//! ## Overview
//!
//! The gateway accepts requests in two client-facing dialects:
//! - **Anthropic Messages API** on `/v1/messages`
//! - **OpenAI Chat Completions API** on `/v1/chat/completions`
//!
//! and re-encodes them for the backend's binary event-stream protocol,
//! forwarding each over a pool of rotating refresh-token credentials.
//! The backend's length-prefixed frames are translated back into the
//! client's expected wire format in real time.
//!
//! The proxy handles:
//! - Credential selection, refresh and failover under concurrent load
//! - Incremental binary frame decoding with checksum verification
//! - Tool-call argument reconstruction across frames
//! - SSE / chunked-JSON response generation per dialect
//! - Dynamic stream deadlines derived from the request's token budget
//!
//! ## Modules
//!
//! - [`auth`] - Credential records, pool and token exchange
//! - [`client`] - Backend streaming client
//! - [`config`] - Server and credential configuration
//! - [`error`] - Error types and handling
//! - [`handler`] - Request orchestration and HTTP handlers
//! - [`models`] - Data structures for both dialects and the backend
//! - [`streaming`] - Frame decoder, event translator, dialect encoders
//! - [`transform`] - Request adaptation and tool-schema translation

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod models;
pub mod streaming;
pub mod transform;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
