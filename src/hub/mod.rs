//! Hub invocation engine
//!
//! This module turns a bidirectional byte stream into hub method
//! invocations and back.
//!
//! # Architecture
//!
//! - `protocol` - Logical message model (handshake, invocations, completions, control)
//! - `codec` - Pluggable codec trait, JSON codec and handshake framing
//! - `serialized` - Per-protocol encoding cache for broadcast messages
//! - `method` - `Hub` lifecycle trait, `HubError`, method return shapes
//! - `params` - Parameter extractors and the argument binder
//! - `router` - Method dispatch table (`HubDefinition`) and its builder
//! - `services` / `activator` - Scoped services and hub activation
//! - `auth` - Users and policy authorization
//! - `tracker` - Inbound invocation tracking and cancellation
//! - `client_results` - Outbound server-to-client invocations awaiting results
//! - `limiter` - Per-connection parallelism limit with FIFO queueing
//! - `streams` - Upload stream channels
//! - `lifetime` - Connection states, keep-alive and client-timeout timers
//! - `buffer` - Resend log for stateful reconnect
//! - `connection` - Per-connection context and the outbound write path
//! - `sink` - Single-terminal invocation response sink
//! - `registry` / `clients` - Connection, group and user addressing
//! - `context` - `HubContext` handed to hub methods
//! - `dispatcher` - Per-message dispatch and invocation execution
//! - `handler` - Connection loop from handshake to close
//! - `transport` - Transport traits and the in-memory transport
//!
//! # Usage
//!
//! ```rust,ignore
//! use hubwire::hub::*;
//!
//! struct ChatHub;
//! impl Hub for ChatHub {}
//!
//! async fn send(_hub: Arc<ChatHub>, ctx: HubContext, Arg(text): Arg<String>) -> HubResult<()> {
//!     ctx.clients().all().send("Receive", vec![text.into()]).await.ok();
//!     Ok(())
//! }
//!
//! let definition = HubDefinition::builder().method("Send", send).build()?;
//! let handler = HubConnectionHandler::builder(definition)
//!     .hub_factory(|| ChatHub)
//!     .build()?;
//! handler.run(transport).await?;
//! ```

pub mod activator;
pub mod auth;
pub mod buffer;
pub mod client_results;
pub mod clients;
pub mod codec;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod handler;
pub mod lifetime;
pub mod limiter;
pub mod method;
pub mod params;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod serialized;
pub mod services;
pub mod sink;
pub mod streams;
pub mod tracker;
pub mod transport;

// Re-export commonly used types
pub use activator::{DefaultHubActivator, HubActivator, HubHandle};
pub use auth::{AuthorizationResource, Authorizer, HubUser, PolicyAuthorizer};
pub use buffer::{BufferError, MessageBuffer};
pub use client_results::{ClientResult, ClientResultError, ClientResultTracker};
pub use clients::{ClientProxy, Groups, HubCallerClients, HubClients, SingleClientProxy};
pub use codec::{HubProtocol, JsonHubProtocol, ProtocolError, TransferFormat};
pub use connection::{ConnectionError, HubConnectionContext, SendError};
pub use context::HubContext;
pub use handler::{HubConnectionHandler, HubConnectionHandlerBuilder};
pub use lifetime::{ConnectionLifetime, ConnectionState, HeartbeatAction};
pub use limiter::ParallelismLimiter;
pub use method::{Hub, HubError, HubErrorKind, HubResult, MethodOutput, ReturnShape};
pub use params::{Arg, FromKeyedServices, FromServices, ServiceKey, UploadStream};
pub use protocol::{
    CloseMessage, CompletionMessage, CompletionOutcome, HandshakeRequest, HandshakeResponse,
    HubMessage, InvocationMessage, StreamInvocationMessage, StreamItemMessage,
};
pub use registry::{ConnectionRegistry, Target};
pub use router::{HubBuildError, HubDefinition, HubDefinitionBuilder, MethodDescriptor};
pub use services::{ServiceCollection, ServiceProvider, ServiceScope};
pub use streams::StreamError;
pub use tracker::{InvocationStatus, InvocationTracker, TrackerError};
pub use transport::{
    MemoryClient, MemoryTransport, ReconnectFeature, Transport, TransportError,
    TransportFeatures, TransportReader, TransportWriter,
};
