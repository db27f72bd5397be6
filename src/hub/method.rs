//! Hub trait, method errors and result conversion
//!
//! This module defines the [`Hub`] trait every hub type implements, the
//! [`HubError`] type hub methods return, and the conversions that turn a hub
//! method's return value into a [`MethodOutput`] the dispatcher can send.

use crate::hub::connection::ConnectionError;
use crate::hub::context::HubContext;
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::any::TypeId;

// =============================================================================
// Hub Trait
// =============================================================================

/// A server-side type whose methods remote connections can invoke.
///
/// Methods themselves are registered on a
/// [`HubDefinition`](crate::hub::HubDefinition); this trait only carries the
/// connection lifecycle hooks. A hub instance is created for each top-level
/// dispatch and released right after it.
#[async_trait]
pub trait Hub: Send + Sync + 'static {
    /// Runs once after the handshake, before any invocation is processed.
    async fn on_connected(&self, _ctx: &HubContext) -> HubResult<()> {
        Ok(())
    }

    /// Runs once when the connection ends. `error` is `None` for a graceful close.
    async fn on_disconnected(
        &self,
        _ctx: &HubContext,
        _error: Option<&ConnectionError>,
    ) -> HubResult<()> {
        Ok(())
    }

    /// Called when the framework releases a hub it created.
    fn dispose(&self) {}
}

// =============================================================================
// Errors
// =============================================================================

/// Result type for hub methods
pub type HubResult<T> = Result<T, HubError>;

/// Category of a [`HubError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubErrorKind {
    /// Raised intentionally by hub code; its message always reaches the client
    Hub,
    /// Arguments or stream items could not be bound
    InvalidData,
    /// Any other failure
    Internal,
    /// Authorization denied
    Unauthorized,
    /// Operation was canceled
    Canceled,
}

/// Error type for hub methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubError {
    pub kind: HubErrorKind,
    pub message: String,
}

impl HubError {
    /// An intentional error whose message is always sent to the caller
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: HubErrorKind::Hub,
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self {
            kind: HubErrorKind::InvalidData,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: HubErrorKind::Internal,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            kind: HubErrorKind::Unauthorized,
            message: message.into(),
        }
    }

    pub fn canceled() -> Self {
        Self {
            kind: HubErrorKind::Canceled,
            message: "The operation was canceled.".to_string(),
        }
    }

    /// Type label shown to clients in detailed error text
    pub fn label(&self) -> &'static str {
        match self.kind {
            HubErrorKind::Hub => "HubError",
            HubErrorKind::InvalidData => "InvalidDataError",
            HubErrorKind::Internal => "InternalError",
            HubErrorKind::Unauthorized => "UnauthorizedError",
            HubErrorKind::Canceled => "OperationCanceledError",
        }
    }

    pub fn is_intentional(&self) -> bool {
        self.kind == HubErrorKind::Hub
    }
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.label(), self.message)
    }
}

impl std::error::Error for HubError {}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<HubError>() {
            Ok(hub) => hub,
            Err(other) => Self::internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(err.to_string())
    }
}

/// Client-facing error text: `prefix`, plus the error itself when details are
/// enabled or the error was raised intentionally.
pub fn error_message(prefix: &str, error: &HubError, detailed: bool) -> String {
    if detailed || error.is_intentional() {
        format!("{} {}", prefix, error)
    } else {
        prefix.to_string()
    }
}

// =============================================================================
// Method output
// =============================================================================

/// What a hub method produced
pub enum MethodOutput {
    Void,
    Value(Value),
    Stream(BoxStream<'static, HubResult<Value>>),
}

impl std::fmt::Debug for MethodOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodOutput::Void => write!(f, "Void"),
            MethodOutput::Value(v) => write!(f, "Value({})", v),
            MethodOutput::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// Return shape recorded in a method descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    Void,
    Value,
    Stream,
}

/// Conversion for values returned by non-streaming hub methods.
pub trait IntoMethodResult: Send + 'static {
    fn shape() -> ReturnShape;

    fn into_method_result(self) -> HubResult<MethodOutput>;
}

impl<T> IntoMethodResult for HubResult<T>
where
    T: Serialize + Send + 'static,
{
    fn shape() -> ReturnShape {
        if TypeId::of::<T>() == TypeId::of::<()>() {
            ReturnShape::Void
        } else {
            ReturnShape::Value
        }
    }

    fn into_method_result(self) -> HubResult<MethodOutput> {
        let value = self?;
        if Self::shape() == ReturnShape::Void {
            return Ok(MethodOutput::Void);
        }
        let value = serde_json::to_value(value)
            .map_err(|e| HubError::internal(format!("Failed to serialize result: {}", e)))?;
        Ok(MethodOutput::Value(value))
    }
}

/// Conversion for values returned by streaming hub methods.
pub trait IntoStreamResult: Send + 'static {
    fn into_stream(self) -> HubResult<BoxStream<'static, HubResult<Value>>>;
}

impl<S, T> IntoStreamResult for HubResult<S>
where
    S: Stream<Item = HubResult<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    fn into_stream(self) -> HubResult<BoxStream<'static, HubResult<Value>>> {
        let stream = self?;
        Ok(stream
            .map(|item| {
                item.and_then(|value| {
                    serde_json::to_value(value).map_err(|e| {
                        HubError::internal(format!("Failed to serialize stream item: {}", e))
                    })
                })
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_error_message_hides_details() {
        let err = HubError::internal("disk on fire");
        assert_eq!(
            error_message("An unexpected error occurred invoking 'Save' on the server.", &err, false),
            "An unexpected error occurred invoking 'Save' on the server."
        );
        assert_eq!(
            error_message("An unexpected error occurred invoking 'Save' on the server.", &err, true),
            "An unexpected error occurred invoking 'Save' on the server. InternalError: disk on fire"
        );
    }

    #[test]
    fn test_intentional_error_always_shown() {
        let err = HubError::new("Not allowed today");
        assert_eq!(
            error_message("An unexpected error occurred invoking 'Save' on the server.", &err, false),
            "An unexpected error occurred invoking 'Save' on the server. HubError: Not allowed today"
        );
    }

    #[test]
    fn test_anyhow_conversion_keeps_hub_errors() {
        let wrapped: HubError = anyhow::Error::new(HubError::new("custom")).into();
        assert!(wrapped.is_intentional());

        let plain: HubError = anyhow::anyhow!("boom").into();
        assert_eq!(plain.kind, HubErrorKind::Internal);
        assert_eq!(plain.message, "boom");
    }

    #[test]
    fn test_unit_result_is_void() {
        assert_eq!(<HubResult<()> as IntoMethodResult>::shape(), ReturnShape::Void);
        assert!(matches!(
            Ok::<(), HubError>(()).into_method_result(),
            Ok(MethodOutput::Void)
        ));

        assert_eq!(<HubResult<String> as IntoMethodResult>::shape(), ReturnShape::Value);
        match Ok::<_, HubError>("hi".to_string()).into_method_result() {
            Ok(MethodOutput::Value(v)) => assert_eq!(v, Value::from("hi")),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_items_serialized() {
        let result: HubResult<_> = Ok(stream::iter(vec![Ok::<_, HubError>(1), Ok(2)]));
        let items: Vec<_> = result.into_stream().unwrap().collect().await;
        assert_eq!(items, vec![Ok(Value::from(1)), Ok(Value::from(2))]);
    }
}
