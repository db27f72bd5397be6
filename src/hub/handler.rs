//! Connection handler
//!
//! [`HubConnectionHandler`] owns everything shared by the connections of one
//! hub and runs each connection from handshake to close:
//!
//! 1. Handshake (with timeout; the request may arrive split across reads or
//!    together with the first hub message)
//! 2. Register the connection, start keep-alive and replay tasks
//! 3. `on_connected`
//! 4. Read loop: frame, size-check and dispatch every message
//! 5. Cleanup: cancel invocations, write Close, unregister, `on_disconnected`

use crate::config::HubOptions;
use crate::hub::activator::{DefaultHubActivator, HubActivator};
use crate::hub::auth::{Authorizer, PolicyAuthorizer};
use crate::hub::buffer::MessageBuffer;
use crate::hub::clients::{Groups, HubClients};
use crate::hub::codec::{
    parse_handshake_request, write_handshake_response, HubProtocol, JsonHubProtocol,
};
use crate::hub::connection::{close_message, ConnectionError, ConnectionSetup, HubConnectionContext};
use crate::hub::dispatcher::{DispatchFlow, HubDispatcher, HubRuntime};
use crate::hub::lifetime::{ConnectionLifetime, HeartbeatAction};
use crate::hub::method::Hub;
use crate::hub::protocol::{HandshakeRequest, HandshakeResponse, HubMessage};
use crate::hub::registry::ConnectionRegistry;
use crate::hub::router::HubDefinition;
use crate::hub::services::{ServiceCollection, ServiceProvider, ServiceScope};
use crate::hub::transport::{Transport, TransportFeatures, TransportReader, TransportWriter};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Builder
// =============================================================================

pub struct HubConnectionHandlerBuilder<H: Hub> {
    definition: HubDefinition<H>,
    options: HubOptions,
    services: Option<ServiceProvider>,
    activator: Option<Arc<dyn HubActivator<H>>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    protocols: Vec<Arc<dyn HubProtocol>>,
    registry: Option<Arc<ConnectionRegistry>>,
}

impl<H: Hub> HubConnectionHandlerBuilder<H> {
    /// Global options; per-hub overrides on the definition win.
    pub fn options(mut self, options: HubOptions) -> Self {
        self.options = options;
        self
    }

    pub fn services(mut self, services: ServiceProvider) -> Self {
        self.services = Some(services);
        self
    }

    pub fn activator(mut self, activator: Arc<dyn HubActivator<H>>) -> Self {
        self.activator = Some(activator);
        self
    }

    /// Create a fresh hub per dispatch with `factory`; it is disposed after use.
    pub fn hub_factory<F>(self, factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.activator(Arc::new(DefaultHubActivator::with_factory(
            move |_: &ServiceScope| factory(),
        )))
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Add a protocol. JSON is used when none is added.
    pub fn protocol(mut self, protocol: Arc<dyn HubProtocol>) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// Share a registry with other handlers or outside code.
    pub fn registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<HubConnectionHandler<H>> {
        let options = self.definition.options().resolve(&self.options);
        options.validate()?;

        let mut protocols = self.protocols;
        if protocols.is_empty() {
            protocols.push(Arc::new(JsonHubProtocol));
        }
        protocols.retain(|p| {
            options
                .supported_protocols
                .iter()
                .any(|name| name.eq_ignore_ascii_case(p.name()))
        });
        if protocols.is_empty() {
            return Err(anyhow!(
                "none of the supported protocols ({}) is available",
                options.supported_protocols.join(", ")
            ));
        }

        let runtime = HubRuntime {
            definition: Arc::new(self.definition),
            activator: self
                .activator
                .unwrap_or_else(|| Arc::new(DefaultHubActivator::from_services())),
            authorizer: self
                .authorizer
                .unwrap_or_else(|| Arc::new(PolicyAuthorizer::new())),
            services: self
                .services
                .unwrap_or_else(|| ServiceCollection::new().build()),
            registry: self.registry.unwrap_or_default(),
            options,
        };

        Ok(HubConnectionHandler {
            runtime: Arc::new(runtime),
            protocols: Arc::new(protocols),
        })
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Serves connections for one hub type.
pub struct HubConnectionHandler<H: Hub> {
    runtime: Arc<HubRuntime<H>>,
    protocols: Arc<Vec<Arc<dyn HubProtocol>>>,
}

impl<H: Hub> Clone for HubConnectionHandler<H> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            protocols: self.protocols.clone(),
        }
    }
}

enum HandshakeFailure {
    /// Timed out, or the client went away before finishing
    Canceled,
    /// The request was unusable; the text is sent back to the client
    Rejected(String),
}

impl<H: Hub> HubConnectionHandler<H> {
    pub fn builder(definition: HubDefinition<H>) -> HubConnectionHandlerBuilder<H> {
        HubConnectionHandlerBuilder {
            definition,
            options: HubOptions::default(),
            services: None,
            activator: None,
            authorizer: None,
            protocols: Vec::new(),
            registry: None,
        }
    }

    /// Effective options of this hub
    pub fn options(&self) -> &HubOptions {
        &self.runtime.options
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.runtime.registry
    }

    /// Client proxies for code running outside hub methods.
    pub fn clients(&self) -> HubClients {
        HubClients::new(self.runtime.registry.clone())
    }

    pub fn groups(&self) -> Groups {
        Groups::new(self.runtime.registry.clone())
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Serve one connection until it closes.
    ///
    /// Returns an error only when the handshake or `on_connected` failed;
    /// every other ending is reported to `on_disconnected` instead.
    pub async fn run(&self, transport: Transport) -> Result<(), ConnectionError> {
        let Transport {
            mut reader,
            mut writer,
            features,
        } = transport;

        let options = &self.runtime.options;
        let handshake = tokio::time::timeout(
            options.handshake_timeout,
            self.read_handshake(reader.as_mut(), &features),
        )
        .await
        .unwrap_or(Err(HandshakeFailure::Canceled));

        let (request, protocol, leftover) = match handshake {
            Ok(negotiated) => negotiated,
            Err(HandshakeFailure::Canceled) => {
                tracing::debug!("Handshake was canceled");
                let _ = writer.close().await;
                return Err(ConnectionError::Handshake("Handshake was canceled.".to_string()));
            }
            Err(HandshakeFailure::Rejected(error)) => {
                tracing::warn!("Handshake failed: {}", error);
                let _ = send_handshake_response(writer.as_mut(), &HandshakeResponse::failure(&error))
                    .await;
                let _ = writer.close().await;
                return Err(ConnectionError::Handshake(error));
            }
        };

        if let Err(e) = send_handshake_response(writer.as_mut(), &HandshakeResponse::success()).await {
            tracing::debug!("Failed to send handshake response: {}", e);
            return Err(e);
        }

        let connection = self.create_connection(&request, protocol, writer, features);
        tracing::info!(
            "Connection {} established ({} v{})",
            connection.connection_id(),
            connection.protocol().name(),
            connection.protocol_version()
        );
        self.runtime.registry.add(connection.clone());

        let dispatcher = HubDispatcher::new(self.runtime.clone(), connection.clone());
        let background = CancellationToken::new();
        self.spawn_heartbeat(connection.clone(), background.clone());

        if let Err(e) = dispatcher.on_connected().await {
            tracing::error!(
                "Error when dispatching 'OnConnected' on {}: {}",
                connection.connection_id(),
                e
            );
            let error = ConnectionError::HubFailure(e);
            self.finish(&dispatcher, &connection, &background, Some(error.clone()))
                .await;
            return Err(error);
        }

        let error = match self.read_loop(&dispatcher, &connection, reader.as_mut(), leftover).await {
            Err(e) => Some(e),
            Ok(()) => connection.take_close_reason(),
        };
        self.finish(&dispatcher, &connection, &background, error).await;
        Ok(())
    }

    async fn read_handshake(
        &self,
        reader: &mut dyn TransportReader,
        features: &TransportFeatures,
    ) -> Result<(HandshakeRequest, Arc<dyn HubProtocol>, Vec<u8>), HandshakeFailure> {
        let limit = self.runtime.options.maximum_receive_message_size;
        let mut buffer = Vec::new();
        loop {
            match reader.read().await {
                Ok(Some(chunk)) => buffer.extend_from_slice(&chunk),
                Ok(None) | Err(_) => return Err(HandshakeFailure::Canceled),
            }

            let parsed = parse_handshake_request(&buffer)
                .map_err(|e| HandshakeFailure::Rejected(e.to_string()))?;
            let Some((request, consumed)) = parsed else {
                // An unterminated handshake may not grow past the message size limit
                if let Some(limit) = limit.filter(|limit| buffer.len() > *limit) {
                    return Err(HandshakeFailure::Rejected(
                        ConnectionError::MessageTooLarge { limit }.message(),
                    ));
                }
                continue;
            };
            let protocol = self
                .select_protocol(&request, features)
                .map_err(HandshakeFailure::Rejected)?;
            buffer.drain(..consumed);
            return Ok((request, protocol, buffer));
        }
    }

    fn select_protocol(
        &self,
        request: &HandshakeRequest,
        features: &TransportFeatures,
    ) -> Result<Arc<dyn HubProtocol>, String> {
        let protocol = self
            .protocols
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(&request.protocol))
            .ok_or_else(|| format!("The protocol '{}' is not supported.", request.protocol))?;

        if !protocol.is_version_supported(request.version) {
            return Err(format!(
                "The server does not support version {} of the '{}' protocol.",
                request.version, request.protocol
            ));
        }

        let format = protocol.transfer_format();
        if !features.transfer_formats.contains(&format) {
            return Err(format!(
                "Cannot use the '{}' protocol on the current transport. The transport does not support '{}' transfer format.",
                request.protocol, format
            ));
        }
        Ok(protocol.clone())
    }

    fn create_connection(
        &self,
        request: &HandshakeRequest,
        protocol: Arc<dyn HubProtocol>,
        writer: Box<dyn TransportWriter>,
        features: TransportFeatures,
    ) -> Arc<HubConnectionContext> {
        let options = &self.runtime.options;
        let version = request.version.min(protocol.version());
        let now = Instant::now();
        let mut lifetime = ConnectionLifetime::new(
            options.keep_alive_interval,
            options.client_timeout_interval,
            now,
        );
        lifetime.activate(now);

        // Stateful reconnect needs both the transport feature and protocol v2+.
        let reconnect = features.reconnect.filter(|_| version >= 2);
        let buffer = reconnect
            .as_ref()
            .map(|_| Arc::new(MessageBuffer::new(options.stateful_reconnect_buffer_size)));

        let connection = Arc::new(HubConnectionContext::new(ConnectionSetup {
            connection_id: features
                .connection_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            user: features.user,
            protocol,
            protocol_version: version,
            writer,
            lifetime,
            buffer,
            reconnect: reconnect.clone(),
            detailed_errors: options.enable_detailed_errors,
        }));

        match reconnect {
            Some(reconnect) => {
                let notify = Arc::new(Notify::new());
                let signal = notify.clone();
                reconnect.on_reconnected(Box::new(move || signal.notify_one()));
                spawn_replay(connection.clone(), notify);
            }
            None => connection.disable_reconnect(),
        }
        connection
    }

    fn spawn_heartbeat(&self, connection: Arc<HubConnectionContext>, stop: CancellationToken) {
        let period = self.runtime.options.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.cancelled() => break,
                    _ = connection.aborted().cancelled() => break,
                }

                let action = connection.heartbeat(Instant::now());
                if action == HeartbeatAction::TimedOut {
                    tracing::info!(
                        "Connection {} timed out waiting for the client",
                        connection.connection_id()
                    );
                    connection.abort(ConnectionError::Timeout);
                    break;
                }

                // Control frames never wait behind a pending write.
                let mut wrote = false;
                if let Some(buffer) = connection.buffer() {
                    if let Some(sequence_id) = buffer.take_pending_ack() {
                        match connection
                            .try_write_control(&HubMessage::Ack { sequence_id })
                            .await
                        {
                            Ok(true) => wrote = true,
                            Ok(false) => buffer.restore_pending_ack(),
                            Err(_) => {}
                        }
                    }
                }

                if action == HeartbeatAction::SendPing && !wrote {
                    tracing::debug!("Sending keep-alive ping to {}", connection.connection_id());
                    if let Ok(false) = connection.try_write_control(&HubMessage::Ping).await {
                        tracing::debug!(
                            "Skipping ping to {}, a write is in progress",
                            connection.connection_id()
                        );
                    }
                }
            }
        });
    }

    // =========================================================================
    // Read loop
    // =========================================================================

    async fn read_loop(
        &self,
        dispatcher: &Arc<HubDispatcher<H>>,
        connection: &Arc<HubConnectionContext>,
        reader: &mut dyn TransportReader,
        mut pending: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        loop {
            if self.process_buffer(dispatcher, connection, &mut pending).await? == DispatchFlow::Stop {
                return Ok(());
            }

            let chunk = tokio::select! {
                chunk = reader.read() => chunk,
                _ = connection.aborted().cancelled() => return Ok(()),
            };
            match chunk {
                Ok(Some(bytes)) => pending.extend_from_slice(&bytes),
                Ok(None) => {
                    tracing::debug!("Client {} finished sending", connection.connection_id());
                    return Ok(());
                }
                Err(e) => return Err(ConnectionError::Transport(e)),
            }
        }
    }

    /// Dispatch every complete message in `pending`, keeping any partial tail.
    async fn process_buffer(
        &self,
        dispatcher: &Arc<HubDispatcher<H>>,
        connection: &Arc<HubConnectionContext>,
        pending: &mut Vec<u8>,
    ) -> Result<DispatchFlow, ConnectionError> {
        let limit = self.runtime.options.maximum_receive_message_size;
        let protocol = connection.protocol().clone();
        let mut offset = 0;
        let mut flow = DispatchFlow::Continue;

        while offset < pending.len() {
            let remaining = &pending[offset..];
            let window = match limit {
                Some(limit) => &remaining[..remaining.len().min(limit)],
                None => remaining,
            };

            let Some((message, consumed)) = protocol.try_parse(window).map_err(ConnectionError::Protocol)?
            else {
                if let Some(limit) = limit {
                    if remaining.len() >= limit {
                        return Err(ConnectionError::MessageTooLarge { limit });
                    }
                }
                break;
            };

            offset += consumed;
            connection.on_message_received();
            if dispatcher.dispatch(message).await? == DispatchFlow::Stop {
                flow = DispatchFlow::Stop;
                break;
            }
        }

        pending.drain(..offset);
        Ok(flow)
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    async fn finish(
        &self,
        dispatcher: &Arc<HubDispatcher<H>>,
        connection: &Arc<HubConnectionContext>,
        background: &CancellationToken,
        error: Option<ConnectionError>,
    ) {
        background.cancel();
        connection.disable_reconnect();
        connection.begin_close();
        dispatcher.shutdown();

        let close = close_message(error.as_ref(), self.runtime.options.enable_detailed_errors);
        if let Err(e) = connection.write_close(&close).await {
            tracing::debug!("Could not send Close to {}: {}", connection.connection_id(), e);
        }

        self.runtime.registry.remove(connection.connection_id());

        if let Err(e) = dispatcher.on_disconnected(error.as_ref()).await {
            tracing::error!(
                "Error when dispatching 'OnDisconnected' on {}: {}",
                connection.connection_id(),
                e
            );
        }

        connection.close_writer().await;
        match &error {
            Some(e) => tracing::info!("Connection {} closed: {}", connection.connection_id(), e),
            None => tracing::info!("Connection {} closed", connection.connection_id()),
        }
    }
}

async fn send_handshake_response(
    writer: &mut dyn TransportWriter,
    response: &HandshakeResponse,
) -> Result<(), ConnectionError> {
    let mut bytes = Vec::new();
    write_handshake_response(response, &mut bytes);
    writer.write(&bytes).await.map_err(ConnectionError::Transport)
}

fn spawn_replay(connection: Arc<HubConnectionContext>, notify: Arc<Notify>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = notify.notified() => {}
                _ = connection.aborted().cancelled() => break,
            }
            if let Err(e) = connection.replay_buffered().await {
                tracing::debug!("Replay to {} failed: {}", connection.connection_id(), e);
            }
        }
    });
}
