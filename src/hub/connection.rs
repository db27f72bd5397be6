//! Per-connection state and the outbound write path
//!
//! [`HubConnectionContext`] is created once the handshake succeeded and lives
//! until the connection handler has finished cleanup. Every outbound frame,
//! whether a completion, a broadcast, a ping or a replay, goes through
//! [`HubConnectionContext::write_message`] or its serialized variant, which
//! serializes writers, feeds the resend log and records send activity for
//! the keep-alive timer.

use crate::hub::auth::HubUser;
use crate::hub::buffer::{BufferError, MessageBuffer};
use crate::hub::codec::{HubProtocol, ProtocolError};
use crate::hub::lifetime::{ConnectionLifetime, ConnectionState, HeartbeatAction};
use crate::hub::method::HubError;
use crate::hub::protocol::{CloseMessage, HubMessage};
use crate::hub::serialized::SerializedHubMessage;
use crate::hub::transport::{ReconnectFeature, TransportError, TransportWriter};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Errors
// =============================================================================

/// Why a connection ended abnormally
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Reading from or writing to the transport failed
    Transport(TransportError),
    /// The client sent a frame the protocol could not parse
    Protocol(ProtocolError),
    /// A message exceeded the configured maximum size
    MessageTooLarge { limit: usize },
    /// Nothing arrived within the client timeout interval
    Timeout,
    /// The handshake failed or timed out
    Handshake(String),
    /// `on_connected` failed
    HubFailure(HubError),
    /// Server code aborted the connection
    Aborted(String),
    /// Stateful reconnect sequencing broke
    Sequence(BufferError),
}

impl ConnectionError {
    /// Type label shown to clients in detailed close text
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionError::Transport(_) => "TransportError",
            ConnectionError::Protocol(_) | ConnectionError::MessageTooLarge { .. } => {
                "InvalidDataError"
            }
            ConnectionError::Timeout => "OperationCanceledError",
            ConnectionError::Handshake(_) => "HandshakeError",
            ConnectionError::HubFailure(e) => e.label(),
            ConnectionError::Aborted(_) => "ConnectionAbortedError",
            ConnectionError::Sequence(_) => "InvalidOperationError",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ConnectionError::Transport(e) => e.to_string(),
            ConnectionError::Protocol(e) => e.to_string(),
            ConnectionError::MessageTooLarge { limit } => format!(
                "The maximum message size of {}B was exceeded. The message size can be configured in HubOptions.",
                limit
            ),
            ConnectionError::Timeout => {
                "Client hasn't sent a message/ping within the configured client timeout interval."
                    .to_string()
            }
            ConnectionError::Handshake(e) => e.clone(),
            ConnectionError::HubFailure(e) => e.message.clone(),
            ConnectionError::Aborted(reason) => reason.clone(),
            ConnectionError::Sequence(e) => e.to_string(),
        }
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.label(), self.message())
    }
}

impl std::error::Error for ConnectionError {}

/// Close frame for a connection ending with `error` (`None` = graceful).
pub fn close_message(error: Option<&ConnectionError>, detailed: bool) -> CloseMessage {
    match error {
        None => CloseMessage::graceful(),
        Some(error) if detailed => {
            CloseMessage::with_error(format!("Connection closed with an error. {}", error))
        }
        Some(_) => CloseMessage::with_error("Connection closed with an error."),
    }
}

/// Errors returned to code sending to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The caller's token fired before the message was written
    Canceled,
    /// The connection is closing or gone
    Closed,
    /// The message could not be encoded
    Serialization(String),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Canceled => write!(f, "Send canceled."),
            SendError::Closed => write!(f, "Connection is closed."),
            SendError::Serialization(e) => write!(f, "Failed to serialize message: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

// =============================================================================
// Connection context
// =============================================================================

/// Everything the engine knows about one connected client.
pub struct HubConnectionContext {
    connection_id: String,
    user: HubUser,
    items: Mutex<HashMap<String, Value>>,
    protocol: Arc<dyn HubProtocol>,
    protocol_version: u32,
    writer: tokio::sync::Mutex<Box<dyn TransportWriter>>,
    aborted: CancellationToken,
    lifetime: Mutex<ConnectionLifetime>,
    buffer: Option<Arc<MessageBuffer>>,
    reconnect: Option<Arc<dyn ReconnectFeature>>,
    close_reason: Mutex<Option<ConnectionError>>,
    closing: AtomicBool,
    detailed_errors: bool,
}

/// Negotiated parameters for a new [`HubConnectionContext`]
pub struct ConnectionSetup {
    pub connection_id: String,
    pub user: HubUser,
    pub protocol: Arc<dyn HubProtocol>,
    pub protocol_version: u32,
    pub writer: Box<dyn TransportWriter>,
    pub lifetime: ConnectionLifetime,
    /// Resend log; present only when stateful reconnect was negotiated
    pub buffer: Option<Arc<MessageBuffer>>,
    pub reconnect: Option<Arc<dyn ReconnectFeature>>,
    pub detailed_errors: bool,
}

impl HubConnectionContext {
    pub fn new(setup: ConnectionSetup) -> Self {
        Self {
            connection_id: setup.connection_id,
            user: setup.user,
            items: Mutex::new(HashMap::new()),
            protocol: setup.protocol,
            protocol_version: setup.protocol_version,
            writer: tokio::sync::Mutex::new(setup.writer),
            aborted: CancellationToken::new(),
            lifetime: Mutex::new(setup.lifetime),
            buffer: setup.buffer,
            reconnect: setup.reconnect,
            close_reason: Mutex::new(None),
            closing: AtomicBool::new(false),
            detailed_errors: setup.detailed_errors,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn user(&self) -> &HubUser {
        &self.user
    }

    pub fn protocol(&self) -> &Arc<dyn HubProtocol> {
        &self.protocol
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn detailed_errors(&self) -> bool {
        self.detailed_errors
    }

    fn items(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-connection value bag shared by every invocation
    pub fn get_item(&self, key: &str) -> Option<Value> {
        self.items().get(key).cloned()
    }

    pub fn set_item(&self, key: impl Into<String>, value: Value) {
        self.items().insert(key.into(), value);
    }

    pub fn remove_item(&self, key: &str) -> Option<Value> {
        self.items().remove(key)
    }

    // -------------------------------------------------------------------------
    // Lifetime
    // -------------------------------------------------------------------------

    fn lifetime(&self) -> MutexGuard<'_, ConnectionLifetime> {
        self.lifetime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lifetime().state()
    }

    pub fn on_message_received(&self) {
        self.lifetime().on_message_received(Instant::now());
    }

    pub fn heartbeat(&self, now: Instant) -> HeartbeatAction {
        self.lifetime().tick(now)
    }

    /// Fires when the connection ends, for any reason.
    pub fn aborted(&self) -> &CancellationToken {
        &self.aborted
    }

    /// End the connection with `reason`. Only the first reason is kept.
    pub fn abort(&self, reason: ConnectionError) {
        {
            let mut close_reason = self.close_reason.lock().unwrap_or_else(PoisonError::into_inner);
            if close_reason.is_none() && !self.aborted.is_cancelled() {
                tracing::debug!("Connection {} aborted: {}", self.connection_id, reason);
                *close_reason = Some(reason);
            }
        }
        self.aborted.cancel();
    }

    pub fn take_close_reason(&self) -> Option<ConnectionError> {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Refuse further writes and fire the abort token. Idempotent.
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.lifetime().begin_draining();
        self.aborted.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Stateful reconnect
    // -------------------------------------------------------------------------

    pub fn buffer(&self) -> Option<&Arc<MessageBuffer>> {
        self.buffer.as_ref()
    }

    /// Tell the transport not to accept a reconnect any more.
    pub fn disable_reconnect(&self) {
        if let Some(reconnect) = &self.reconnect {
            reconnect.disable_reconnect();
        }
    }

    /// Re-send a `Sequence` frame and every unacknowledged message.
    pub async fn replay_buffered(&self) -> Result<(), SendError> {
        let Some(buffer) = &self.buffer else {
            return Ok(());
        };
        if self.is_closing() {
            return Err(SendError::Closed);
        }

        let mut writer = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = self.aborted.cancelled() => return Err(SendError::Closed),
        };
        let (first, entries) = buffer.replay();
        tracing::debug!(
            "Replaying {} buffered message(s) from sequence {} to {}",
            entries.len(),
            first,
            self.connection_id
        );

        let mut sequence = Vec::new();
        self.protocol
            .write(&HubMessage::Sequence { sequence_id: first }, &mut sequence)
            .map_err(|e| SendError::Serialization(e.to_string()))?;
        self.write_locked(&mut writer, &sequence).await?;
        for entry in entries {
            self.write_locked(&mut writer, &entry).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Encode and send one message.
    pub async fn write_message(
        &self,
        message: &HubMessage,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), SendError> {
        let mut bytes = Vec::new();
        self.protocol
            .write(message, &mut bytes)
            .map_err(|e| SendError::Serialization(e.to_string()))?;
        self.write_frame(Arc::from(bytes), message.is_sequenced(), cancel)
            .await
    }

    /// Send a message shared with other connections, reusing its encoding.
    pub async fn write_serialized(
        &self,
        message: &SerializedHubMessage,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), SendError> {
        let bytes = message
            .get_or_serialize(self.protocol.as_ref())
            .await
            .map_err(|e| SendError::Serialization(e.to_string()))?;
        self.write_frame(bytes, message.message().is_sequenced(), cancel)
            .await
    }

    async fn write_frame(
        &self,
        bytes: Arc<[u8]>,
        sequenced: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), SendError> {
        if self.is_closing() {
            return Err(SendError::Closed);
        }
        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);

        // Room in the resend log is taken before the writer lock so a full
        // log never stalls pings, acks or the close frame.
        let reservation = match self.buffer.as_deref().filter(|_| sequenced) {
            Some(buffer) => tokio::select! {
                reserved = buffer.reserve(bytes.len(), cancel) => match reserved {
                    Ok(reservation) => Some(reservation),
                    Err(_) => return Err(SendError::Canceled),
                },
                _ = self.aborted.cancelled() => return Err(SendError::Closed),
            },
            None => None,
        };

        let mut writer = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = cancel.cancelled() => return Err(SendError::Canceled),
            _ = self.aborted.cancelled() => return Err(SendError::Closed),
        };
        if self.is_closing() {
            return Err(SendError::Closed);
        }

        if let Some(reservation) = reservation {
            reservation.commit(bytes.clone());
        }
        self.write_locked(&mut writer, &bytes).await
    }

    /// Send an unsequenced control message unless another write is in
    /// progress. Returns whether the message was written.
    pub async fn try_write_control(&self, message: &HubMessage) -> Result<bool, SendError> {
        if self.is_closing() {
            return Err(SendError::Closed);
        }
        let mut bytes = Vec::new();
        self.protocol
            .write(message, &mut bytes)
            .map_err(|e| SendError::Serialization(e.to_string()))?;
        let Ok(mut writer) = self.writer.try_lock() else {
            return Ok(false);
        };
        self.write_locked(&mut writer, &bytes).await?;
        Ok(true)
    }

    async fn write_locked(
        &self,
        writer: &mut Box<dyn TransportWriter>,
        bytes: &[u8],
    ) -> Result<(), SendError> {
        match writer.write(bytes).await {
            Ok(()) => {
                self.lifetime().on_message_sent(Instant::now());
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed writing message to {}: {}", self.connection_id, e);
                self.abort(ConnectionError::Transport(e));
                Err(SendError::Closed)
            }
        }
    }

    /// Write the final Close frame. Works after [`begin_close`](Self::begin_close).
    pub async fn write_close(&self, close: &CloseMessage) -> Result<(), SendError> {
        let mut bytes = Vec::new();
        self.protocol
            .write(&HubMessage::Close(close.clone()), &mut bytes)
            .map_err(|e| SendError::Serialization(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer.write(&bytes).await.map_err(|_| SendError::Closed)
    }

    /// Finish the outbound side of the transport.
    pub async fn close_writer(&self) {
        self.lifetime().close();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            tracing::debug!("Closing transport of {} failed: {}", self.connection_id, e);
        }
    }
}

impl std::fmt::Debug for HubConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnectionContext")
            .field("connection_id", &self.connection_id)
            .field("protocol", &self.protocol.name())
            .field("protocol_version", &self.protocol_version)
            .finish_non_exhaustive()
    }
}
