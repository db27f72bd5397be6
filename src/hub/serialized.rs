//! Serialize-once message wrapper used for fan-out.
//!
//! A broadcast to many connections encodes the message once per distinct
//! protocol. Concurrent writers asking for the same protocol share a single
//! encoding through a per-protocol [`OnceCell`].

use crate::hub::codec::{HubProtocol, ProtocolError};
use crate::hub::protocol::HubMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// A hub message plus its cached encodings, keyed by protocol name.
pub struct SerializedHubMessage {
    message: HubMessage,
    cache: Mutex<HashMap<String, Arc<OnceCell<Arc<[u8]>>>>>,
}

impl SerializedHubMessage {
    pub fn new(message: HubMessage) -> Self {
        Self {
            message,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped message
    pub fn message(&self) -> &HubMessage {
        &self.message
    }

    /// Encoded bytes for `protocol`, serializing at most once per protocol name.
    pub async fn get_or_serialize(
        &self,
        protocol: &dyn HubProtocol,
    ) -> Result<Arc<[u8]>, ProtocolError> {
        let cell = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache
                .entry(protocol.name().to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let bytes = cell
            .get_or_try_init(|| async {
                let mut output = Vec::new();
                protocol.write(&self.message, &mut output)?;
                Ok::<_, ProtocolError>(Arc::<[u8]>::from(output))
            })
            .await?;
        Ok(bytes.clone())
    }

    /// Number of protocols this message has been encoded for
    pub fn cached_protocols(&self) -> usize {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.values().filter(|cell| cell.initialized()).count()
    }
}

impl std::fmt::Debug for SerializedHubMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializedHubMessage")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
