//! Connection, group and user registry
//!
//! Shared by every connection of a hub. Connections are looked up by ID,
//! groups map a name to member connection IDs, and users are matched through
//! each connection's [`HubUser`](crate::hub::auth::HubUser) ID. All maps are
//! sharded [`DashMap`]s so unrelated connections never contend on one lock.
//!
//! Fan-out encodes a message once per protocol through
//! [`SerializedHubMessage`] and writes to all targets concurrently.

use crate::hub::client_results::{ClientResult, ClientResultError, ClientResultTracker};
use crate::hub::connection::{HubConnectionContext, SendError};
use crate::hub::protocol::{HubMessage, InvocationMessage};
use crate::hub::serialized::SerializedHubMessage;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Set of connections a send is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    AllExcept(Vec<String>),
    Connection(String),
    Connections(Vec<String>),
    Group(String),
    Groups(Vec<String>),
    GroupExcept(String, Vec<String>),
    User(String),
    Users(Vec<String>),
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<HubConnectionContext>>,
    groups: DashMap<String, HashSet<String>>,
    client_results: ClientResultTracker,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<HubConnectionContext>) {
        self.connections
            .insert(connection.connection_id().to_string(), connection);
    }

    /// Forget a connection, drop its group memberships and fault its pending
    /// client results.
    pub fn remove(&self, connection_id: &str) {
        self.connections.remove(connection_id);
        self.groups.retain(|_, members| {
            members.remove(connection_id);
            !members.is_empty()
        });
        self.client_results.fail_connection(connection_id);
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<HubConnectionContext>> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn client_results(&self) -> &ClientResultTracker {
        &self.client_results
    }

    // -------------------------------------------------------------------------
    // Groups
    // -------------------------------------------------------------------------

    /// Add a connection to a group. Unknown connections are ignored.
    pub fn add_to_group(&self, connection_id: &str, group: &str) {
        if !self.connections.contains_key(connection_id) {
            tracing::debug!(
                "Not adding unknown connection {} to group '{}'",
                connection_id,
                group
            );
            return;
        }
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    pub fn remove_from_group(&self, connection_id: &str, group: &str) {
        self.groups.remove_if_mut(group, |_, members| {
            members.remove(connection_id);
            members.is_empty()
        });
    }

    pub fn group_members(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    /// Connections currently addressed by `target`, each at most once.
    pub fn resolve(&self, target: &Target) -> Vec<Arc<HubConnectionContext>> {
        let ids: HashSet<String> = match target {
            Target::All => self.connection_ids().into_iter().collect(),
            Target::AllExcept(excluded) => self
                .connection_ids()
                .into_iter()
                .filter(|id| !excluded.contains(id))
                .collect(),
            Target::Connection(id) => HashSet::from([id.clone()]),
            Target::Connections(ids) => ids.iter().cloned().collect(),
            Target::Group(group) => self.group_members(group).into_iter().collect(),
            Target::Groups(groups) => groups
                .iter()
                .flat_map(|group| self.group_members(group))
                .collect(),
            Target::GroupExcept(group, excluded) => self
                .group_members(group)
                .into_iter()
                .filter(|id| !excluded.contains(id))
                .collect(),
            Target::User(user) => self.user_connections(std::slice::from_ref(user)),
            Target::Users(users) => self.user_connections(users),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    fn user_connections(&self, users: &[String]) -> HashSet<String> {
        self.connections
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .user()
                    .id
                    .as_ref()
                    .is_some_and(|id| users.contains(id))
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Send a non-blocking invocation of `method` to every target connection.
    ///
    /// Cancelling stops writes still waiting for their connection; writes
    /// already in progress finish. Connections that went away are skipped.
    pub async fn send(
        &self,
        target: &Target,
        method: &str,
        arguments: Vec<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), SendError> {
        let connections = self.resolve(target);
        if connections.is_empty() {
            return Ok(());
        }

        let message = SerializedHubMessage::new(HubMessage::Invocation(
            InvocationMessage::non_blocking(method, arguments),
        ));
        let results = join_all(
            connections
                .iter()
                .map(|connection| connection.write_serialized(&message, cancel)),
        )
        .await;

        let mut outcome = Ok(());
        for (connection, result) in connections.iter().zip(results) {
            match result {
                Ok(()) | Err(SendError::Closed) => {}
                Err(SendError::Canceled) => outcome = Err(SendError::Canceled),
                Err(e) => {
                    tracing::warn!(
                        "Failed to send '{}' to {}: {}",
                        method,
                        connection.connection_id(),
                        e
                    );
                    outcome = Err(e);
                }
            }
        }
        outcome
    }

    /// Invoke `method` on one connection and wait for its answer.
    ///
    /// Cancelling `cancel` sends a `CancelInvocation` to the client and
    /// resolves with [`ClientResultError::Canceled`]; a completion the client
    /// sends afterwards is discarded.
    pub async fn invoke_connection(
        &self,
        connection_id: &str,
        method: &str,
        arguments: Vec<Value>,
        cancel: &CancellationToken,
    ) -> ClientResult {
        let connection = self
            .get(connection_id)
            .ok_or_else(|| ClientResultError::NotConnected(connection_id.to_string()))?;

        let invocation_id = self.client_results.next_invocation_id();
        let receiver = self
            .client_results
            .register(connection_id, &invocation_id, method)?;

        let message = HubMessage::Invocation(InvocationMessage::new(
            invocation_id.clone(),
            method,
            arguments,
        ));
        if let Err(e) = connection.write_message(&message, Some(cancel)).await {
            self.client_results.remove(connection_id, &invocation_id);
            return Err(match e {
                SendError::Canceled => ClientResultError::Canceled,
                _ => ClientResultError::ConnectionClosed,
            });
        }

        tokio::pin!(receiver);
        tokio::select! {
            result = &mut receiver => result.unwrap_or(Err(ClientResultError::ConnectionClosed)),
            _ = cancel.cancelled() => {
                if !self.client_results.try_cancel(connection_id, &invocation_id) {
                    // The answer won the race.
                    return receiver.await.unwrap_or(Err(ClientResultError::ConnectionClosed));
                }
                let cancel_message = HubMessage::CancelInvocation { invocation_id };
                if let Err(e) = connection.write_message(&cancel_message, None).await {
                    tracing::debug!("Could not send CancelInvocation to {}: {}", connection_id, e);
                }
                Err(ClientResultError::Canceled)
            }
        }
    }
}
