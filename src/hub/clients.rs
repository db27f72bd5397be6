//! Typed client proxies
//!
//! [`ClientProxy`] addresses any set of connections and can only send.
//! [`SingleClientProxy`] addresses exactly one connection and can also invoke
//! it and wait for a result; multi-target proxies have no `invoke`.

use crate::hub::client_results::ClientResultError;
use crate::hub::connection::SendError;
use crate::hub::limiter::InvocationLease;
use crate::hub::registry::{ConnectionRegistry, Target};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Sends to a set of connections.
#[derive(Clone)]
pub struct ClientProxy {
    registry: Arc<ConnectionRegistry>,
    target: Target,
}

impl ClientProxy {
    pub fn new(registry: Arc<ConnectionRegistry>, target: Target) -> Self {
        Self { registry, target }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Invoke `method` on every addressed client without waiting for answers.
    pub async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError> {
        self.registry.send(&self.target, method, arguments, None).await
    }

    pub async fn send_with_cancel(
        &self,
        method: &str,
        arguments: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        self.registry
            .send(&self.target, method, arguments, Some(cancel))
            .await
    }
}

/// Sends to, or invokes, one connection.
#[derive(Clone)]
pub struct SingleClientProxy {
    proxy: ClientProxy,
    connection_id: String,
    lease: Option<Arc<InvocationLease>>,
}

impl SingleClientProxy {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError> {
        self.proxy.send(method, arguments).await
    }

    pub async fn send_with_cancel(
        &self,
        method: &str,
        arguments: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        self.proxy.send_with_cancel(method, arguments, cancel).await
    }

    /// Invoke `method` on the client and wait for its result.
    ///
    /// When called from a hub method the invocation's parallelism slot is
    /// given up while waiting, so other queued invocations of the calling
    /// connection (including the one delivering this answer) can run.
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        method: &str,
        arguments: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<T, ClientResultError> {
        if let Some(lease) = &self.lease {
            lease.park();
        }
        let result = self
            .proxy
            .registry
            .invoke_connection(&self.connection_id, method, arguments, cancel)
            .await;
        if let Some(lease) = &self.lease {
            lease.resume().await;
        }
        serde_json::from_value(result?).map_err(|e| ClientResultError::InvalidResult(e.to_string()))
    }
}

/// Addressing entry point for code inside and outside hub methods.
#[derive(Clone)]
pub struct HubClients {
    registry: Arc<ConnectionRegistry>,
    lease: Option<Arc<InvocationLease>>,
}

impl HubClients {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            lease: None,
        }
    }

    pub(crate) fn with_lease(registry: Arc<ConnectionRegistry>, lease: Option<Arc<InvocationLease>>) -> Self {
        Self { registry, lease }
    }

    fn proxy(&self, target: Target) -> ClientProxy {
        ClientProxy::new(self.registry.clone(), target)
    }

    pub fn all(&self) -> ClientProxy {
        self.proxy(Target::All)
    }

    pub fn all_except(&self, excluded: Vec<String>) -> ClientProxy {
        self.proxy(Target::AllExcept(excluded))
    }

    pub fn client(&self, connection_id: &str) -> SingleClientProxy {
        SingleClientProxy {
            proxy: self.proxy(Target::Connection(connection_id.to_string())),
            connection_id: connection_id.to_string(),
            lease: self.lease.clone(),
        }
    }

    pub fn clients(&self, connection_ids: Vec<String>) -> ClientProxy {
        self.proxy(Target::Connections(connection_ids))
    }

    pub fn group(&self, group: &str) -> ClientProxy {
        self.proxy(Target::Group(group.to_string()))
    }

    pub fn groups(&self, groups: Vec<String>) -> ClientProxy {
        self.proxy(Target::Groups(groups))
    }

    pub fn group_except(&self, group: &str, excluded: Vec<String>) -> ClientProxy {
        self.proxy(Target::GroupExcept(group.to_string(), excluded))
    }

    pub fn user(&self, user_id: &str) -> ClientProxy {
        self.proxy(Target::User(user_id.to_string()))
    }

    pub fn users(&self, user_ids: Vec<String>) -> ClientProxy {
        self.proxy(Target::Users(user_ids))
    }
}

/// [`HubClients`] plus addressing relative to the calling connection.
#[derive(Clone)]
pub struct HubCallerClients {
    clients: HubClients,
    caller_id: String,
}

impl HubCallerClients {
    pub(crate) fn new(clients: HubClients, caller_id: String) -> Self {
        Self { clients, caller_id }
    }

    /// The connection that made the current call
    pub fn caller(&self) -> SingleClientProxy {
        self.clients.client(&self.caller_id)
    }

    /// Every connection except the caller
    pub fn others(&self) -> ClientProxy {
        self.clients.all_except(vec![self.caller_id.clone()])
    }

    /// Members of `group` except the caller
    pub fn others_in_group(&self, group: &str) -> ClientProxy {
        self.clients.group_except(group, vec![self.caller_id.clone()])
    }
}

impl std::ops::Deref for HubCallerClients {
    type Target = HubClients;

    fn deref(&self) -> &HubClients {
        &self.clients
    }
}

/// Group membership management.
#[derive(Clone)]
pub struct Groups {
    registry: Arc<ConnectionRegistry>,
}

impl Groups {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn add_to_connection(&self, connection_id: &str, group: &str) {
        self.registry.add_to_group(connection_id, group);
    }

    pub fn remove_from_connection(&self, connection_id: &str, group: &str) {
        self.registry.remove_from_group(connection_id, group);
    }
}
