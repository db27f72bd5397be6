//! Hub message model
//!
//! This module defines the logical messages exchanged between a hub and its
//! clients. The shapes are codec-independent: `codec` maps them to bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Handshake
// =============================================================================

/// First frame sent by a client: the protocol it wants to speak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Protocol name, e.g. `"json"`
    pub protocol: String,

    /// Requested protocol version
    pub version: u32,
}

/// Server reply to a handshake request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Present when the handshake was rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// Successful handshake response
    pub fn success() -> Self {
        Self { error: None }
    }

    /// Failed handshake response
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
        }
    }
}

// =============================================================================
// Hub messages
// =============================================================================

/// Request to run a hub method. An absent ID means fire-and-forget.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationMessage {
    pub invocation_id: Option<String>,
    pub target: String,
    pub arguments: Vec<Value>,
    pub stream_ids: Vec<String>,
}

impl InvocationMessage {
    /// Invocation expecting a completion
    pub fn new(id: impl Into<String>, target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            invocation_id: Some(id.into()),
            target: target.into(),
            arguments,
            stream_ids: Vec::new(),
        }
    }

    /// Fire-and-forget invocation
    pub fn non_blocking(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            invocation_id: None,
            target: target.into(),
            arguments,
            stream_ids: Vec::new(),
        }
    }

    /// Attach upload stream IDs
    pub fn with_stream_ids(mut self, stream_ids: Vec<String>) -> Self {
        self.stream_ids = stream_ids;
        self
    }
}

/// Request to run a hub method whose result is streamed back item by item.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInvocationMessage {
    pub invocation_id: String,
    pub target: String,
    pub arguments: Vec<Value>,
    pub stream_ids: Vec<String>,
}

impl StreamInvocationMessage {
    pub fn new(id: impl Into<String>, target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            invocation_id: id.into(),
            target: target.into(),
            arguments,
            stream_ids: Vec::new(),
        }
    }

    pub fn with_stream_ids(mut self, stream_ids: Vec<String>) -> Self {
        self.stream_ids = stream_ids;
        self
    }
}

/// One item of an upload or download stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItemMessage {
    pub invocation_id: String,
    pub item: Value,
}

/// How an invocation or stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// No result (void method, finished stream, client-canceled stream)
    Void,
    /// Returned value (may be `null`)
    Result(Value),
    /// Error text
    Error(String),
}

/// Terminal message for an invocation or stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    pub invocation_id: String,
    pub outcome: CompletionOutcome,
}

impl CompletionMessage {
    pub fn void(id: impl Into<String>) -> Self {
        Self {
            invocation_id: id.into(),
            outcome: CompletionOutcome::Void,
        }
    }

    pub fn with_result(id: impl Into<String>, result: Value) -> Self {
        Self {
            invocation_id: id.into(),
            outcome: CompletionOutcome::Result(result),
        }
    }

    pub fn with_error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            invocation_id: id.into(),
            outcome: CompletionOutcome::Error(error.into()),
        }
    }

    /// Error text, if this completion carries one
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            CompletionOutcome::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Result value, if this completion carries one
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            CompletionOutcome::Result(v) => Some(v),
            _ => None,
        }
    }
}

/// Close frame. `allow_reconnect` hints the client whether to reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseMessage {
    pub error: Option<String>,
    pub allow_reconnect: bool,
}

impl CloseMessage {
    pub fn graceful() -> Self {
        Self::default()
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            allow_reconnect: false,
        }
    }
}

/// All messages that may appear after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(InvocationMessage),
    StreamInvocation(StreamInvocationMessage),
    StreamItem(StreamItemMessage),
    Completion(CompletionMessage),
    CancelInvocation { invocation_id: String },
    Ping,
    Close(CloseMessage),
    Ack { sequence_id: u64 },
    Sequence { sequence_id: u64 },
}

impl HubMessage {
    /// Short name of the message kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::Invocation(_) => "Invocation",
            HubMessage::StreamInvocation(_) => "StreamInvocation",
            HubMessage::StreamItem(_) => "StreamItem",
            HubMessage::Completion(_) => "Completion",
            HubMessage::CancelInvocation { .. } => "CancelInvocation",
            HubMessage::Ping => "Ping",
            HubMessage::Close(_) => "Close",
            HubMessage::Ack { .. } => "Ack",
            HubMessage::Sequence { .. } => "Sequence",
        }
    }

    /// Invocation ID carried by the message, if any
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            HubMessage::Invocation(m) => m.invocation_id.as_deref(),
            HubMessage::StreamInvocation(m) => Some(&m.invocation_id),
            HubMessage::StreamItem(m) => Some(&m.invocation_id),
            HubMessage::Completion(m) => Some(&m.invocation_id),
            HubMessage::CancelInvocation { invocation_id } => Some(invocation_id),
            _ => None,
        }
    }

    /// Whether the message takes part in stateful-reconnect sequencing.
    ///
    /// Pings, closes and the sequencing control frames themselves are never
    /// buffered or counted.
    pub fn is_sequenced(&self) -> bool {
        !matches!(
            self,
            HubMessage::Ping | HubMessage::Close(_) | HubMessage::Ack { .. } | HubMessage::Sequence { .. }
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
