//! Inbound invocation tracker
//!
//! This module provides the `InvocationTracker` which records the client
//! invocations of one connection that carry an ID, so they can be canceled by
//! a `CancelInvocation` message and so duplicate IDs are rejected while the
//! first invocation is still running.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Invocation Status
// =============================================================================

/// Status of a tracked invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    /// Invocation is currently running
    Running,
    /// Invocation completed successfully
    Completed,
    /// Invocation failed with an error
    Failed,
    /// Invocation was cancelled
    Cancelled,
}

// =============================================================================
// Invocation Entry
// =============================================================================

/// Information about a tracked invocation
#[derive(Debug)]
pub struct InvocationEntry {
    /// The hub method name
    pub method: String,

    /// Current status
    pub status: InvocationStatus,

    /// Child of the connection token; fired by cancel or connection loss
    pub cancel_token: CancellationToken,
}

// =============================================================================
// Invocation Tracker
// =============================================================================

/// Tracker for the active invocations of one connection.
pub struct InvocationTracker {
    /// Map from invocation ID to entry
    invocations: Mutex<HashMap<String, InvocationEntry>>,

    /// Connection-wide token every invocation token derives from
    connection_token: CancellationToken,
}

impl InvocationTracker {
    pub fn new(connection_token: CancellationToken) -> Self {
        Self {
            invocations: Mutex::new(HashMap::new()),
            connection_token,
        }
    }

    fn invocations(&self) -> MutexGuard<'_, HashMap<String, InvocationEntry>> {
        self.invocations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token for an invocation that carries no ID
    pub fn untracked_token(&self) -> CancellationToken {
        self.connection_token.child_token()
    }

    /// Register an invocation.
    ///
    /// Fails without touching the existing entry if the ID is already active.
    pub fn try_add(&self, id: &str, method: &str) -> Result<CancellationToken, TrackerError> {
        let mut invocations = self.invocations();
        if invocations.contains_key(id) {
            return Err(TrackerError::DuplicateId(id.to_string()));
        }

        let cancel_token = self.connection_token.child_token();
        invocations.insert(
            id.to_string(),
            InvocationEntry {
                method: method.to_string(),
                status: InvocationStatus::Running,
                cancel_token: cancel_token.clone(),
            },
        );
        Ok(cancel_token)
    }

    /// Cancel an invocation by ID
    pub fn cancel(&self, id: &str) -> Result<(), TrackerError> {
        let mut invocations = self.invocations();
        match invocations.get_mut(id) {
            Some(entry) if entry.status == InvocationStatus::Running => {
                tracing::debug!("Canceling invocation '{}' of '{}'", id, entry.method);
                entry.status = InvocationStatus::Cancelled;
                entry.cancel_token.cancel();
                Ok(())
            }
            Some(_) => Err(TrackerError::NotRunning(id.to_string())),
            None => Err(TrackerError::NotFound(id.to_string())),
        }
    }

    /// Record the final status and forget the invocation.
    ///
    /// Idempotent: completing an unknown or already removed ID is a no-op.
    pub fn complete(&self, id: &str, status: InvocationStatus) -> Option<InvocationEntry> {
        let mut entry = self.invocations().remove(id)?;
        if entry.status == InvocationStatus::Running {
            entry.status = status;
        }
        Some(entry)
    }

    /// Cancel everything; used when the connection ends.
    pub fn cancel_all(&self) {
        let mut invocations = self.invocations();
        for entry in invocations.values_mut() {
            if entry.status == InvocationStatus::Running {
                entry.status = InvocationStatus::Cancelled;
            }
            entry.cancel_token.cancel();
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur with the invocation tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// ID already in use by an active invocation
    DuplicateId(String),
    /// Invocation not found
    NotFound(String),
    /// Invocation is not running
    NotRunning(String),
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::DuplicateId(id) => write!(f, "Invocation ID '{}' is already in use.", id),
            TrackerError::NotFound(id) => write!(f, "Invocation '{}' not found", id),
            TrackerError::NotRunning(id) => write!(f, "Invocation '{}' is not running", id),
        }
    }
}

impl std::error::Error for TrackerError {}

// =============================================================================
// Tests
// =============================================================================
