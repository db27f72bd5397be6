//! WebSocket server module for hubwire
//!
//! This module hosts a hub over axum WebSockets.
//!
//! # Architecture
//!
//! - `websocket` - Adapter from an axum WebSocket to the engine transport traits
//! - `demo` - The demo hub served by `hubwire serve`
//!
//! # Endpoints
//!
//! - `GET /hub` - WebSocket upgrade; an optional `?user=<id>` query parameter
//!   sets the user identity used for user addressing
//!
//! The `?user=` identity is taken on trust and exists for the demo hub and
//! local testing. Any client can claim any ID with it, including one that
//! receives another user's `User(...)` messages. Deployments that need real
//! identities should authenticate in front of this router and build their
//! own upgrade handler around [`websocket_transport`], which takes the
//! [`HubUser`] explicitly.
//! - `GET /health` - returns `OK`
//!
//! Message size limits, keep-alive pings and client timeouts are enforced by
//! the engine (see [`HubOptions`]), not by the WebSocket layer.
//!
//! # Usage
//!
//! ```rust,ignore
//! use hubwire::server::{demo, start_server, ServerConfig};
//! use hubwire::hub::HubConnectionHandler;
//!
//! let handler = HubConnectionHandler::builder(demo::demo_definition()?)
//!     .services(demo::demo_services())
//!     .hub_factory(|| demo::DemoHub)
//!     .build()?;
//! start_server(handler, ServerConfig::default()).await?;
//! ```

pub mod demo;
pub mod websocket;

pub use websocket::{websocket_transport, WsReader, WsWriter};

use crate::config::HubOptions;
use crate::hub::auth::HubUser;
use crate::hub::{Hub, HubConnectionHandler};
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::Response,
    routing::get,
    Router as AxumRouter,
};
use std::collections::HashMap;
use tower_http::cors::{Any, CorsLayer};

// =============================================================================
// Server Configuration
// =============================================================================

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub address: String,

    /// Port to listen on
    pub port: u16,

    /// Options for the hosted hub
    pub hub_options: HubOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8080,
            hub_options: HubOptions::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_hub_options(mut self, options: HubOptions) -> Self {
        self.hub_options = options;
        self
    }

    /// Get the full bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

// =============================================================================
// Server State
// =============================================================================

/// Shared server state
pub struct ServerState<H: Hub> {
    pub handler: HubConnectionHandler<H>,
}

impl<H: Hub> Clone for ServerState<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

// =============================================================================
// Axum Router Creation
// =============================================================================

/// Create the Axum router serving `handler` at `/hub`
pub fn create_axum_router<H: Hub>(handler: HubConnectionHandler<H>) -> AxumRouter {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    AxumRouter::new()
        .route("/hub", get(ws_handler::<H>))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(ServerState { handler })
}

/// Health check handler
async fn health_handler() -> &'static str {
    "OK"
}

/// WebSocket upgrade handler. The user comes from the unauthenticated
/// `?user=` query parameter; a missing or empty value is anonymous.
async fn ws_handler<H: Hub>(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<ServerState<H>>,
) -> Response {
    let user = match params.get("user") {
        Some(id) if !id.is_empty() => HubUser::with_id(id.clone()),
        _ => HubUser::anonymous(),
    };
    ws.on_upgrade(move |socket| async move {
        tracing::debug!("WebSocket connection upgraded");
        let transport = websocket_transport(socket, user);
        if let Err(e) = state.handler.run(transport).await {
            tracing::warn!("WebSocket connection ended during setup: {}", e);
        }
    })
}

// =============================================================================
// Server Startup
// =============================================================================

/// Start the WebSocket server
pub async fn start_server<H: Hub>(
    handler: HubConnectionHandler<H>,
    config: ServerConfig,
) -> anyhow::Result<()> {
    let app = create_axum_router(handler);

    let bind_address = config.bind_address();
    tracing::info!("Starting WebSocket server on {}", bind_address);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.hub_options, HubOptions::default());
    }

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::new().with_address("0.0.0.0").with_port(9000);

        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
    }
}
