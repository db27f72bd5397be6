//! Outbound client-result correlation
//!
//! When server code asks a client for a value it registers a pending entry
//! keyed by `(connection ID, invocation ID)`. The matching Completion from
//! that connection resolves it. The table is shared by every connection, so
//! it lives in a sharded [`DashMap`].

use crate::hub::protocol::{CompletionMessage, CompletionOutcome};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// Errors surfaced to code awaiting a client result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientResultError {
    /// The server canceled the request
    Canceled,
    /// The connection went away before the client answered
    ConnectionClosed,
    /// The client answered with an error
    Client(String),
    /// The client's answer could not be decoded
    InvalidResult(String),
    /// No such connection
    NotConnected(String),
    /// Invocation ID already pending on the connection
    DuplicateId(String),
}

impl std::fmt::Display for ClientResultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientResultError::Canceled => write!(f, "Invocation canceled by the server."),
            ClientResultError::ConnectionClosed => write!(f, "Connection disconnected."),
            ClientResultError::Client(e) => write!(f, "{}", e),
            ClientResultError::InvalidResult(e) => {
                write!(f, "Error trying to deserialize result: {}", e)
            }
            ClientResultError::NotConnected(id) => {
                write!(f, "Connection '{}' does not exist.", id)
            }
            ClientResultError::DuplicateId(id) => {
                write!(f, "Invocation ID '{}' is already in use.", id)
            }
        }
    }
}

impl std::error::Error for ClientResultError {}

pub type ClientResult = Result<Value, ClientResultError>;

struct PendingClientResult {
    method: String,
    sender: oneshot::Sender<ClientResult>,
}

/// Pending server-to-client invocations of every connection.
#[derive(Default)]
pub struct ClientResultTracker {
    pending: DashMap<(String, String), PendingClientResult>,
    next_id: AtomicU64,
}

impl ClientResultTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh invocation ID for a server-initiated call
    pub fn next_invocation_id(&self) -> String {
        format!("s{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a pending call. The receiver resolves exactly once.
    pub fn register(
        &self,
        connection_id: &str,
        invocation_id: &str,
        method: &str,
    ) -> Result<oneshot::Receiver<ClientResult>, ClientResultError> {
        let key = (connection_id.to_string(), invocation_id.to_string());
        match self.pending.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ClientResultError::DuplicateId(invocation_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (sender, receiver) = oneshot::channel();
                slot.insert(PendingClientResult {
                    method: method.to_string(),
                    sender,
                });
                Ok(receiver)
            }
        }
    }

    /// Resolve a pending call from a client Completion.
    ///
    /// Unknown IDs (never registered, already canceled, duplicates) are logged
    /// and ignored.
    pub fn try_complete(&self, connection_id: &str, completion: &CompletionMessage) -> bool {
        let key = (
            connection_id.to_string(),
            completion.invocation_id.clone(),
        );
        let Some((_, pending)) = self.pending.remove(&key) else {
            tracing::warn!(
                "Connection {} sent a completion for unknown invocation '{}'; discarding",
                connection_id,
                completion.invocation_id
            );
            return false;
        };

        let result = match &completion.outcome {
            CompletionOutcome::Result(value) => Ok(value.clone()),
            CompletionOutcome::Void => Ok(Value::Null),
            CompletionOutcome::Error(error) => Err(ClientResultError::Client(error.clone())),
        };
        tracing::debug!(
            "Client result for '{}' ({}) received from {}",
            pending.method,
            completion.invocation_id,
            connection_id
        );
        let _ = pending.sender.send(result);
        true
    }

    /// Fault a pending call as canceled by the server. Returns false if it was
    /// no longer pending.
    pub fn try_cancel(&self, connection_id: &str, invocation_id: &str) -> bool {
        let key = (connection_id.to_string(), invocation_id.to_string());
        match self.pending.remove(&key) {
            Some((_, pending)) => {
                let _ = pending.sender.send(Err(ClientResultError::Canceled));
                true
            }
            None => false,
        }
    }

    /// Forget a pending call without resolving it.
    pub fn remove(&self, connection_id: &str, invocation_id: &str) {
        self.pending
            .remove(&(connection_id.to_string(), invocation_id.to_string()));
    }

    /// Fault every pending call of a connection that has gone away.
    pub fn fail_connection(&self, connection_id: &str) {
        let keys: Vec<_> = self
            .pending
            .iter()
            .filter(|entry| entry.key().0 == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                let _ = pending.sender.send(Err(ClientResultError::ConnectionClosed));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
