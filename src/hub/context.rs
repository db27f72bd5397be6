//! Per-dispatch hub context
//!
//! A [`HubContext`] is handed to every hub method and lifecycle hook. It
//! exposes the calling connection (ID, user, item bag, abort signal) and the
//! client and group proxies.

use crate::hub::auth::HubUser;
use crate::hub::clients::{Groups, HubCallerClients, HubClients};
use crate::hub::connection::{ConnectionError, HubConnectionContext};
use crate::hub::limiter::InvocationLease;
use crate::hub::registry::ConnectionRegistry;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct HubContext {
    connection: Arc<HubConnectionContext>,
    registry: Arc<ConnectionRegistry>,
    lease: Option<Arc<InvocationLease>>,
    invocation_id: Option<String>,
}

impl HubContext {
    pub(crate) fn new(
        connection: Arc<HubConnectionContext>,
        registry: Arc<ConnectionRegistry>,
        lease: Option<Arc<InvocationLease>>,
        invocation_id: Option<String>,
    ) -> Self {
        Self {
            connection,
            registry,
            lease,
            invocation_id,
        }
    }

    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    pub fn user(&self) -> &HubUser {
        self.connection.user()
    }

    /// ID of the current invocation; `None` for hooks and fire-and-forget calls
    pub fn invocation_id(&self) -> Option<&str> {
        self.invocation_id.as_deref()
    }

    pub fn get_item(&self, key: &str) -> Option<Value> {
        self.connection.get_item(key)
    }

    pub fn set_item(&self, key: impl Into<String>, value: Value) {
        self.connection.set_item(key, value);
    }

    pub fn clients(&self) -> HubCallerClients {
        HubCallerClients::new(
            HubClients::with_lease(self.registry.clone(), self.lease.clone()),
            self.connection_id().to_string(),
        )
    }

    pub fn groups(&self) -> Groups {
        Groups::new(self.registry.clone())
    }

    /// Fires when the connection ends.
    pub fn connection_aborted(&self) -> CancellationToken {
        self.connection.aborted().clone()
    }

    /// Close the calling connection.
    pub fn abort(&self) {
        self.connection.abort(ConnectionError::Aborted(
            "The connection was aborted by the hub.".to_string(),
        ));
    }

    pub fn connection(&self) -> &Arc<HubConnectionContext> {
        &self.connection
    }
}

impl std::fmt::Debug for HubContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubContext")
            .field("connection_id", &self.connection_id())
            .field("invocation_id", &self.invocation_id)
            .finish()
    }
}
