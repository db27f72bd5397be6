#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! hubwire - A real-time hub invocation engine
//!
//! hubwire turns a bidirectional byte stream into typed RPC invocations of
//! hub methods and back: handshake, concurrent dispatch with a per-client
//! parallelism limit, server-to-client invocations with results, upload and
//! download streaming, group/user broadcast, keep-alive and client timeouts,
//! and stateful reconnect with a resend log.
//!
//! # Feature Flags
//!
//! | Feature | Description | Key Dependencies |
//! |---------|-------------|------------------|
//! | (none) | The engine, in-memory transport and configuration | `tokio`, `serde_json`, `dashmap` |
//! | `cli` | axum WebSocket host and the `hubwire` binary | `axum`, `clap`, `tracing-subscriber` |
//!
//! ```toml
//! # Engine only
//! hubwire = { version = "0.1", default-features = false }
//!
//! # Default (WebSocket host + CLI binary)
//! hubwire = "0.1"
//! ```
//!
//! # Architecture
//!
//! - **[`hub`]**: The engine (always available)
//!   - `handler`: connection loop from handshake to close
//!   - `dispatcher`: per-message dispatch and invocation execution
//!   - `router` / `params`: method dispatch table and parameter binding
//!   - `registry` / `clients`: connection, group and user addressing
//!   - `codec` / `protocol`: message model and the JSON protocol
//! - **[`config`]**: `HubOptions` loading and per-hub overrides
//! - **[`server`]**: axum WebSocket host (requires `cli`)
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use hubwire::hub::*;
//! use std::sync::Arc;
//!
//! struct ChatHub;
//! impl Hub for ChatHub {}
//!
//! async fn send(_hub: Arc<ChatHub>, ctx: HubContext, Arg(text): Arg<String>) -> HubResult<()> {
//!     ctx.clients()
//!         .others()
//!         .send("Receive", vec![text.into()])
//!         .await
//!         .map_err(|e| HubError::internal(e.to_string()))
//! }
//!
//! let definition = HubDefinition::builder().method("Send", send).build()?;
//! let handler = HubConnectionHandler::builder(definition)
//!     .hub_factory(|| ChatHub)
//!     .build()?;
//!
//! // Serve an in-memory connection
//! let (transport, client) = MemoryTransport::pair();
//! tokio::spawn(async move { handler.run(transport).await });
//! ```

pub mod config;
pub mod hub;

// Server module - requires CLI feature
#[cfg(feature = "cli")]
pub mod server;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{HubOptions, HubOptionsOverride};
pub use hub::{
    Hub, HubConnectionHandler, HubContext, HubDefinition, HubError, HubResult, MemoryTransport,
};
