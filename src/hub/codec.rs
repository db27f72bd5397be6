//! Wire codecs for hub messages
//!
//! A [`HubProtocol`] turns [`HubMessage`]s into bytes and back. The engine only
//! talks to the trait, so further protocols can be registered next to the
//! built-in [`JsonHubProtocol`].
//!
//! The JSON protocol frames every message (and the handshake) as one JSON
//! object followed by the ASCII record separator `0x1E`.

use crate::hub::protocol::{
    CloseMessage, CompletionMessage, CompletionOutcome, HandshakeRequest, HandshakeResponse,
    HubMessage, InvocationMessage, StreamInvocationMessage, StreamItemMessage,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Record separator terminating each text frame.
pub const RECORD_SEPARATOR: u8 = 0x1E;

// =============================================================================
// Protocol trait
// =============================================================================

/// Transfer format a protocol needs from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    Text,
    Binary,
}

impl std::fmt::Display for TransferFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferFormat::Text => write!(f, "Text"),
            TransferFormat::Binary => write!(f, "Binary"),
        }
    }
}

/// A pluggable hub message codec.
pub trait HubProtocol: Send + Sync + 'static {
    /// Name clients request in the handshake
    fn name(&self) -> &str;

    /// Highest protocol version understood
    fn version(&self) -> u32;

    /// Transfer format required from the transport
    fn transfer_format(&self) -> TransferFormat;

    /// Whether the protocol can serve a client asking for `version`
    fn is_version_supported(&self, version: u32) -> bool {
        version <= self.version()
    }

    /// Parse one message from the front of `buffer`.
    ///
    /// Returns `Ok(None)` when `buffer` does not yet hold a complete message,
    /// otherwise the message and the number of bytes it consumed.
    fn try_parse(&self, buffer: &[u8]) -> Result<Option<(HubMessage, usize)>, ProtocolError>;

    /// Append the encoded form of `message` to `output`.
    fn write(&self, message: &HubMessage, output: &mut Vec<u8>) -> Result<(), ProtocolError>;
}

// =============================================================================
// Errors
// =============================================================================

/// Errors produced while encoding or decoding frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is not valid for the protocol
    Malformed(String),
    /// Frame carries an unknown message type discriminant
    UnknownMessageType(u64),
    /// Required field absent for the message type
    MissingField {
        message: &'static str,
        field: &'static str,
    },
    /// Message could not be encoded
    Serialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "Error reading JSON: {}", e),
            ProtocolError::UnknownMessageType(t) => write!(f, "Unknown message type: {}", t),
            ProtocolError::MissingField { message, field } => {
                write!(f, "Missing required property '{}' on {} message.", field, message)
            }
            ProtocolError::Serialization(e) => write!(f, "Failed to serialize message: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

// =============================================================================
// Handshake framing
// =============================================================================

fn split_frame(buffer: &[u8]) -> Option<(&[u8], usize)> {
    buffer
        .iter()
        .position(|b| *b == RECORD_SEPARATOR)
        .map(|pos| (&buffer[..pos], pos + 1))
}

/// Parse a handshake request from the front of `buffer`.
pub fn parse_handshake_request(
    buffer: &[u8],
) -> Result<Option<(HandshakeRequest, usize)>, ProtocolError> {
    let Some((frame, consumed)) = split_frame(buffer) else {
        return Ok(None);
    };
    let request: HandshakeRequest =
        serde_json::from_slice(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(Some((request, consumed)))
}

/// Parse a handshake response from the front of `buffer`.
pub fn parse_handshake_response(
    buffer: &[u8],
) -> Result<Option<(HandshakeResponse, usize)>, ProtocolError> {
    let Some((frame, consumed)) = split_frame(buffer) else {
        return Ok(None);
    };
    let response: HandshakeResponse =
        serde_json::from_slice(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(Some((response, consumed)))
}

/// Encode a handshake request frame.
pub fn write_handshake_request(request: &HandshakeRequest, output: &mut Vec<u8>) {
    write_frame(request, output);
}

/// Encode a handshake response frame.
pub fn write_handshake_response(response: &HandshakeResponse, output: &mut Vec<u8>) {
    write_frame(response, output);
}

fn write_frame<T: Serialize>(value: &T, output: &mut Vec<u8>) {
    // Handshake structs only hold strings and integers, so encoding cannot fail.
    if serde_json::to_writer(&mut *output, value).is_ok() {
        output.push(RECORD_SEPARATOR);
    }
}

// =============================================================================
// JSON protocol
// =============================================================================

const INVOCATION: u64 = 1;
const STREAM_ITEM: u64 = 2;
const COMPLETION: u64 = 3;
const STREAM_INVOCATION: u64 = 4;
const CANCEL_INVOCATION: u64 = 5;
const PING: u64 = 6;
const CLOSE: u64 = 7;
const ACK: u64 = 8;
const SEQUENCE: u64 = 9;

/// Distinguishes an explicit `null` from an absent field.
fn deserialize_some<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    kind: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream_ids: Option<Vec<String>>,

    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    item: Option<Value>,

    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence_id: Option<u64>,
}

impl WireMessage {
    fn into_message(self) -> Result<HubMessage, ProtocolError> {
        let message = match self.kind {
            INVOCATION => HubMessage::Invocation(InvocationMessage {
                invocation_id: self.invocation_id,
                target: self.target.ok_or(ProtocolError::MissingField {
                    message: "Invocation",
                    field: "target",
                })?,
                arguments: self.arguments.ok_or(ProtocolError::MissingField {
                    message: "Invocation",
                    field: "arguments",
                })?,
                stream_ids: self.stream_ids.unwrap_or_default(),
            }),
            STREAM_INVOCATION => HubMessage::StreamInvocation(StreamInvocationMessage {
                invocation_id: self.invocation_id.ok_or(ProtocolError::MissingField {
                    message: "StreamInvocation",
                    field: "invocationId",
                })?,
                target: self.target.ok_or(ProtocolError::MissingField {
                    message: "StreamInvocation",
                    field: "target",
                })?,
                arguments: self.arguments.ok_or(ProtocolError::MissingField {
                    message: "StreamInvocation",
                    field: "arguments",
                })?,
                stream_ids: self.stream_ids.unwrap_or_default(),
            }),
            STREAM_ITEM => HubMessage::StreamItem(StreamItemMessage {
                invocation_id: self.invocation_id.ok_or(ProtocolError::MissingField {
                    message: "StreamItem",
                    field: "invocationId",
                })?,
                item: self.item.unwrap_or(Value::Null),
            }),
            COMPLETION => {
                let invocation_id = self.invocation_id.ok_or(ProtocolError::MissingField {
                    message: "Completion",
                    field: "invocationId",
                })?;
                let outcome = match (self.error, self.result) {
                    (Some(error), _) => CompletionOutcome::Error(error),
                    (None, Some(result)) => CompletionOutcome::Result(result),
                    (None, None) => CompletionOutcome::Void,
                };
                HubMessage::Completion(CompletionMessage {
                    invocation_id,
                    outcome,
                })
            }
            CANCEL_INVOCATION => HubMessage::CancelInvocation {
                invocation_id: self.invocation_id.ok_or(ProtocolError::MissingField {
                    message: "CancelInvocation",
                    field: "invocationId",
                })?,
            },
            PING => HubMessage::Ping,
            CLOSE => HubMessage::Close(CloseMessage {
                error: self.error,
                allow_reconnect: self.allow_reconnect.unwrap_or(false),
            }),
            ACK => HubMessage::Ack {
                sequence_id: self.sequence_id.ok_or(ProtocolError::MissingField {
                    message: "Ack",
                    field: "sequenceId",
                })?,
            },
            SEQUENCE => HubMessage::Sequence {
                sequence_id: self.sequence_id.ok_or(ProtocolError::MissingField {
                    message: "Sequence",
                    field: "sequenceId",
                })?,
            },
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(message)
    }

    fn from_message(message: &HubMessage) -> Self {
        match message {
            HubMessage::Invocation(m) => WireMessage {
                kind: INVOCATION,
                invocation_id: m.invocation_id.clone(),
                target: Some(m.target.clone()),
                arguments: Some(m.arguments.clone()),
                stream_ids: (!m.stream_ids.is_empty()).then(|| m.stream_ids.clone()),
                ..Default::default()
            },
            HubMessage::StreamInvocation(m) => WireMessage {
                kind: STREAM_INVOCATION,
                invocation_id: Some(m.invocation_id.clone()),
                target: Some(m.target.clone()),
                arguments: Some(m.arguments.clone()),
                stream_ids: (!m.stream_ids.is_empty()).then(|| m.stream_ids.clone()),
                ..Default::default()
            },
            HubMessage::StreamItem(m) => WireMessage {
                kind: STREAM_ITEM,
                invocation_id: Some(m.invocation_id.clone()),
                item: Some(m.item.clone()),
                ..Default::default()
            },
            HubMessage::Completion(m) => {
                let (result, error) = match &m.outcome {
                    CompletionOutcome::Void => (None, None),
                    CompletionOutcome::Result(v) => (Some(v.clone()), None),
                    CompletionOutcome::Error(e) => (None, Some(e.clone())),
                };
                WireMessage {
                    kind: COMPLETION,
                    invocation_id: Some(m.invocation_id.clone()),
                    result,
                    error,
                    ..Default::default()
                }
            }
            HubMessage::CancelInvocation { invocation_id } => WireMessage {
                kind: CANCEL_INVOCATION,
                invocation_id: Some(invocation_id.clone()),
                ..Default::default()
            },
            HubMessage::Ping => WireMessage {
                kind: PING,
                ..Default::default()
            },
            HubMessage::Close(m) => WireMessage {
                kind: CLOSE,
                error: m.error.clone(),
                allow_reconnect: m.allow_reconnect.then_some(true),
                ..Default::default()
            },
            HubMessage::Ack { sequence_id } => WireMessage {
                kind: ACK,
                sequence_id: Some(*sequence_id),
                ..Default::default()
            },
            HubMessage::Sequence { sequence_id } => WireMessage {
                kind: SEQUENCE,
                sequence_id: Some(*sequence_id),
                ..Default::default()
            },
        }
    }
}

/// The `json` hub protocol (version 2, text transfer format).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHubProtocol;

impl JsonHubProtocol {
    pub const NAME: &'static str = "json";
    pub const VERSION: u32 = 2;
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> u32 {
        Self::VERSION
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn try_parse(&self, buffer: &[u8]) -> Result<Option<(HubMessage, usize)>, ProtocolError> {
        let Some((frame, consumed)) = split_frame(buffer) else {
            return Ok(None);
        };
        let wire: WireMessage =
            serde_json::from_slice(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(Some((wire.into_message()?, consumed)))
    }

    fn write(&self, message: &HubMessage, output: &mut Vec<u8>) -> Result<(), ProtocolError> {
        serde_json::to_writer(&mut *output, &WireMessage::from_message(message))
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        output.push(RECORD_SEPARATOR);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
