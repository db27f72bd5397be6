//! Invocation-scoped sink with terminal-guard enforcement.
//!
//! Every client invocation that carries an ID gets exactly one terminal
//! `Completion`, optionally preceded by `StreamItem`s:
//!
//! - `send_item`: 0..N times (streaming invocations only)
//! - then exactly one `send_completion`
//!
//! After the terminal message is sent, subsequent send attempts return an
//! error. Invocations without an ID are fire-and-forget: completions are
//! swallowed and items are rejected.

use crate::hub::connection::{HubConnectionContext, SendError};
use crate::hub::protocol::{CompletionMessage, CompletionOutcome, HubMessage, StreamItemMessage};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Errors that can occur when sending via [`InvocationSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Serialization or underlying connection send failure.
    Send(SendError),
    /// The terminal completion was already sent for this invocation.
    TerminalAlreadySent,
    /// Attempted to emit a stream item for an invocation without an ID.
    MissingInvocationId,
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Send(e) => write!(f, "{e}"),
            SinkError::TerminalAlreadySent => write!(f, "completion already sent"),
            SinkError::MissingInvocationId => write!(f, "missing invocation id for stream item"),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<SendError> for SinkError {
    fn from(e: SendError) -> Self {
        SinkError::Send(e)
    }
}

/// Writes the responses of one invocation.
#[derive(Clone)]
pub struct InvocationSink {
    connection: Arc<HubConnectionContext>,
    invocation_id: Option<String>,
    terminal_sent: Arc<Mutex<bool>>,
}

impl InvocationSink {
    pub fn new(connection: Arc<HubConnectionContext>, invocation_id: Option<String>) -> Self {
        Self {
            connection,
            invocation_id,
            terminal_sent: Arc::new(Mutex::new(false)),
        }
    }

    pub fn invocation_id(&self) -> Option<&str> {
        self.invocation_id.as_deref()
    }

    /// Send one streamed result item.
    pub async fn send_item(&self, item: Value) -> Result<(), SinkError> {
        self.ensure_not_terminal().await?;
        let invocation_id = self
            .invocation_id
            .as_ref()
            .ok_or(SinkError::MissingInvocationId)?;
        let message = HubMessage::StreamItem(StreamItemMessage {
            invocation_id: invocation_id.clone(),
            item,
        });
        Ok(self.connection.write_message(&message, None).await?)
    }

    /// Send the terminal completion. Allowed exactly once.
    pub async fn send_completion(&self, outcome: CompletionOutcome) -> Result<(), SinkError> {
        self.mark_terminal().await?;
        let Some(invocation_id) = &self.invocation_id else {
            return Ok(());
        };
        let message = HubMessage::Completion(CompletionMessage {
            invocation_id: invocation_id.clone(),
            outcome,
        });
        Ok(self.connection.write_message(&message, None).await?)
    }

    pub async fn send_error(&self, error: impl Into<String>) -> Result<(), SinkError> {
        self.send_completion(CompletionOutcome::Error(error.into()))
            .await
    }

    pub async fn is_terminal(&self) -> bool {
        *self.terminal_sent.lock().await
    }

    async fn ensure_not_terminal(&self) -> Result<(), SinkError> {
        if *self.terminal_sent.lock().await {
            return Err(SinkError::TerminalAlreadySent);
        }
        Ok(())
    }

    async fn mark_terminal(&self) -> Result<(), SinkError> {
        let mut guard = self.terminal_sent.lock().await;
        if *guard {
            return Err(SinkError::TerminalAlreadySent);
        }
        *guard = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::auth::HubUser;
    use crate::hub::codec::{HubProtocol, JsonHubProtocol};
    use crate::hub::connection::ConnectionSetup;
    use crate::hub::lifetime::ConnectionLifetime;
    use crate::hub::transport::{MemoryClient, MemoryTransport};
    use std::time::Duration;
    use tokio::time::Instant;

    fn connection() -> (Arc<HubConnectionContext>, MemoryClient) {
        let (transport, client) = MemoryTransport::pair();
        let now = Instant::now();
        let mut lifetime =
            ConnectionLifetime::new(Duration::from_secs(15), Duration::from_secs(30), now);
        lifetime.activate(now);
        let connection = HubConnectionContext::new(ConnectionSetup {
            connection_id: "c1".to_string(),
            user: HubUser::anonymous(),
            protocol: Arc::new(JsonHubProtocol),
            protocol_version: 1,
            writer: transport.writer,
            lifetime,
            buffer: None,
            reconnect: None,
            detailed_errors: false,
        });
        (Arc::new(connection), client)
    }

    async fn next_message(client: &mut MemoryClient) -> HubMessage {
        let bytes = client.recv().await.unwrap();
        JsonHubProtocol.try_parse(&bytes).unwrap().unwrap().0
    }

    #[tokio::test]
    async fn test_items_then_single_completion() {
        let (connection, mut client) = connection();
        let sink = InvocationSink::new(connection, Some("7".to_string()));

        sink.send_item(Value::from(1)).await.unwrap();
        sink.send_completion(CompletionOutcome::Void).await.unwrap();
        assert_eq!(
            sink.send_completion(CompletionOutcome::Void).await,
            Err(SinkError::TerminalAlreadySent)
        );
        assert_eq!(sink.send_item(Value::from(2)).await, Err(SinkError::TerminalAlreadySent));

        assert!(matches!(next_message(&mut client).await, HubMessage::StreamItem(_)));
        assert_eq!(
            next_message(&mut client).await,
            HubMessage::Completion(CompletionMessage::void("7"))
        );
    }

    #[tokio::test]
    async fn test_fire_and_forget_sends_nothing() {
        let (connection, _client) = connection();
        let sink = InvocationSink::new(connection, None);

        assert_eq!(sink.send_item(Value::Null).await, Err(SinkError::MissingInvocationId));
        sink.send_error("boom").await.unwrap();
        assert!(sink.is_terminal().await);
    }
}
