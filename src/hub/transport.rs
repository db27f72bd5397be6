//! Transport boundary
//!
//! The engine reads raw byte chunks from a [`TransportReader`] and writes
//! encoded frames to a [`TransportWriter`]. Chunk boundaries carry no meaning:
//! a read may hold part of a frame or several frames.
//!
//! [`MemoryTransport`] is an in-process transport used by tests and embedders.
//! It can simulate a dropped network link followed by a reconnect, which
//! exercises stateful reconnect end to end.

use crate::hub::auth::HubUser;
use crate::hub::codec::TransferFormat;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

// =============================================================================
// Traits
// =============================================================================

#[async_trait]
pub trait TransportReader: Send + 'static {
    /// Next chunk of bytes, or `None` once the peer has finished sending.
    async fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

#[async_trait]
pub trait TransportWriter: Send + 'static {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Finish the outbound side. Further writes fail.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Callback fired by the transport after the client re-attached.
pub type ReconnectCallback = Box<dyn Fn() + Send + Sync>;

/// Stateful reconnect support offered by a transport.
pub trait ReconnectFeature: Send + Sync + 'static {
    /// Stop accepting reconnects. Called once the server decides to close.
    fn disable_reconnect(&self);

    fn is_reconnect_enabled(&self) -> bool;

    /// Register a callback run each time the transport reconnects.
    fn on_reconnected(&self, callback: ReconnectCallback);
}

/// Capabilities and identity supplied with a transport.
#[derive(Clone)]
pub struct TransportFeatures {
    /// Connection ID assigned by the transport, generated when absent
    pub connection_id: Option<String>,

    /// Authenticated user
    pub user: HubUser,

    /// Transfer formats the transport can carry
    pub transfer_formats: Vec<TransferFormat>,

    /// Present when the transport supports stateful reconnect
    pub reconnect: Option<Arc<dyn ReconnectFeature>>,
}

impl Default for TransportFeatures {
    fn default() -> Self {
        Self {
            connection_id: None,
            user: HubUser::anonymous(),
            transfer_formats: vec![TransferFormat::Text, TransferFormat::Binary],
            reconnect: None,
        }
    }
}

/// A connected transport handed to the engine.
pub struct Transport {
    pub reader: Box<dyn TransportReader>,
    pub writer: Box<dyn TransportWriter>,
    pub features: TransportFeatures,
}

impl Transport {
    pub fn new(
        reader: impl TransportReader,
        writer: impl TransportWriter,
        features: TransportFeatures,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            features,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport has been closed
    Closed,
    /// The peer aborted the connection
    Aborted(String),
    /// I/O failure
    Io(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Closed => write!(f, "Transport closed"),
            TransportError::Aborted(reason) => write!(f, "Connection aborted: {}", reason),
            TransportError::Io(e) => write!(f, "Transport I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

// =============================================================================
// In-memory transport
// =============================================================================

enum Inbound {
    Data(Vec<u8>),
    End,
    Fault(String),
}

enum Outbound {
    Connected(mpsc::UnboundedSender<Vec<u8>>),
    /// Link dropped; writes are discarded until the client reconnects
    Detached,
    Closed,
}

struct Shared {
    outbound: Mutex<Outbound>,
    reconnect_enabled: AtomicBool,
    callbacks: Mutex<Vec<ReconnectCallback>>,
}

impl Shared {
    fn outbound(&self) -> std::sync::MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl TransportReader for MemoryReader {
    async fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.inbound.recv().await {
            Some(Inbound::Data(bytes)) => Ok(Some(bytes)),
            Some(Inbound::Fault(reason)) => Err(TransportError::Aborted(reason)),
            Some(Inbound::End) | None => Ok(None),
        }
    }
}

struct MemoryWriter {
    shared: Arc<Shared>,
}

#[async_trait]
impl TransportWriter for MemoryWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match &*self.shared.outbound() {
            Outbound::Connected(tx) => tx.send(data.to_vec()).map_err(|_| TransportError::Closed),
            Outbound::Detached => Ok(()),
            Outbound::Closed => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        *self.shared.outbound() = Outbound::Closed;
        Ok(())
    }
}

struct MemoryReconnect {
    shared: Arc<Shared>,
}

impl ReconnectFeature for MemoryReconnect {
    fn disable_reconnect(&self) {
        self.shared.reconnect_enabled.store(false, Ordering::SeqCst);
    }

    fn is_reconnect_enabled(&self) -> bool {
        self.shared.reconnect_enabled.load(Ordering::SeqCst)
    }

    fn on_reconnected(&self, callback: ReconnectCallback) {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

/// Builder for an in-memory transport pair.
#[derive(Default)]
pub struct MemoryTransport {
    features: TransportFeatures,
    stateful_reconnect: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport plus client half with default features
    pub fn pair() -> (Transport, MemoryClient) {
        Self::new().build()
    }

    pub fn with_user(mut self, user: HubUser) -> Self {
        self.features.user = user;
        self
    }

    pub fn with_connection_id(mut self, id: impl Into<String>) -> Self {
        self.features.connection_id = Some(id.into());
        self
    }

    pub fn with_transfer_formats(mut self, formats: Vec<TransferFormat>) -> Self {
        self.features.transfer_formats = formats;
        self
    }

    /// Offer the stateful reconnect feature
    pub fn with_stateful_reconnect(mut self) -> Self {
        self.stateful_reconnect = true;
        self
    }

    pub fn build(self) -> (Transport, MemoryClient) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            outbound: Mutex::new(Outbound::Connected(outbound_tx)),
            reconnect_enabled: AtomicBool::new(self.stateful_reconnect),
            callbacks: Mutex::new(Vec::new()),
        });

        let mut features = self.features;
        if self.stateful_reconnect {
            features.reconnect = Some(Arc::new(MemoryReconnect {
                shared: shared.clone(),
            }));
        }

        let transport = Transport::new(
            MemoryReader {
                inbound: inbound_rx,
            },
            MemoryWriter {
                shared: shared.clone(),
            },
            features,
        );

        let client = MemoryClient {
            inbound: inbound_tx,
            outbound: outbound_rx,
            shared,
        };

        (transport, client)
    }
}

/// Client half of a [`MemoryTransport`].
pub struct MemoryClient {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
}

impl MemoryClient {
    /// Deliver bytes to the server
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.inbound
            .send(Inbound::Data(bytes.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Next chunk written by the server, `None` once the server closed its side
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.outbound.recv().await
    }

    /// Graceful end of the inbound stream
    pub fn close(&self) {
        let _ = self.inbound.send(Inbound::End);
    }

    /// Fault the inbound stream
    pub fn abort(&self, reason: impl Into<String>) {
        let _ = self.inbound.send(Inbound::Fault(reason.into()));
    }

    /// Simulate a lost link: server writes are dropped until [`reconnect`](Self::reconnect).
    pub fn detach(&self) {
        let mut outbound = self.shared.outbound();
        if matches!(*outbound, Outbound::Connected(_)) {
            *outbound = Outbound::Detached;
        }
    }

    /// Re-attach after [`detach`](Self::detach). Returns false when the server
    /// disabled reconnects or already closed the connection.
    pub fn reconnect(&mut self) -> bool {
        if !self.shared.reconnect_enabled.load(Ordering::SeqCst) {
            return false;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut outbound = self.shared.outbound();
            if matches!(*outbound, Outbound::Closed) {
                return false;
            }
            *outbound = Outbound::Connected(tx);
        }
        self.outbound = rx;

        let callbacks = self
            .shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback();
        }
        true
    }

    /// Whether the server still allows reconnecting
    pub fn reconnect_enabled(&self) -> bool {
        self.shared.reconnect_enabled.load(Ordering::SeqCst)
    }
}
