//! Parameter binding for hub methods
//!
//! Each hub method parameter type implements [`FromInvocation`], which says
//! where its value comes from: a positional wire argument, the service scope,
//! an upload stream, or the invocation's cancellation token. Binding runs
//! before the hub is activated, so binding failures never reach hub code.

use crate::hub::method::{HubError, HubResult};
use crate::hub::services::ServiceScope;
use crate::hub::streams::{StreamEnd, StreamError, StreamOutcome, UploadChannel};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Descriptors
// =============================================================================

/// Where a parameter's value comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterKind {
    /// Positional wire argument
    Argument,
    /// Resolved from the service scope, optionally keyed
    Service { key: Option<&'static str> },
    /// Client-to-server stream
    Stream,
    /// The invocation's cancellation token
    Cancellation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDescriptor {
    pub kind: ParameterKind,
    /// Rust type name, used in diagnostics
    pub type_name: &'static str,
}

impl ParameterDescriptor {
    pub fn of<T>(kind: ParameterKind) -> Self {
        Self {
            kind,
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn is_wire_argument(&self) -> bool {
        self.kind == ParameterKind::Argument
    }

    pub fn is_stream(&self) -> bool {
        self.kind == ParameterKind::Stream
    }
}

// =============================================================================
// Binder
// =============================================================================

/// Per-invocation source of parameter values.
pub struct ArgumentBinder {
    arguments: VecDeque<Value>,
    streams: VecDeque<UploadChannel>,
    scope: Arc<ServiceScope>,
    cancellation: CancellationToken,
}

impl ArgumentBinder {
    pub fn new(
        arguments: Vec<Value>,
        streams: Vec<UploadChannel>,
        scope: Arc<ServiceScope>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            arguments: arguments.into(),
            streams: streams.into(),
            scope,
            cancellation,
        }
    }

    fn next_argument(&mut self) -> HubResult<Value> {
        self.arguments.pop_front().ok_or_else(|| {
            HubError::invalid_data("Invocation provides fewer arguments than the target expects.")
        })
    }

    fn next_stream(&mut self) -> HubResult<UploadChannel> {
        self.streams
            .pop_front()
            .ok_or_else(|| HubError::invalid_data("Invocation provides fewer streams than the target expects."))
    }

    pub fn scope(&self) -> &ServiceScope {
        &self.scope
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// A hub method parameter type.
pub trait FromInvocation: Sized + Send + 'static {
    fn descriptor() -> ParameterDescriptor;

    fn from_invocation(binder: &mut ArgumentBinder) -> HubResult<Self>;
}

// =============================================================================
// Extractors
// =============================================================================

const BINDING_ERROR: &str = "Error binding arguments. Make sure that the types of the provided values match the types of the hub method being invoked.";

/// A positional argument decoded from the invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Arg<T>(pub T);

impl<T> FromInvocation for Arg<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn descriptor() -> ParameterDescriptor {
        ParameterDescriptor::of::<T>(ParameterKind::Argument)
    }

    fn from_invocation(binder: &mut ArgumentBinder) -> HubResult<Self> {
        let value = binder.next_argument()?;
        serde_json::from_value(value)
            .map(Arg)
            .map_err(|_| HubError::invalid_data(BINDING_ERROR))
    }
}

/// A service resolved from the invocation's scope.
pub struct FromServices<T>(pub Arc<T>);

impl<T> FromInvocation for FromServices<T>
where
    T: Send + Sync + 'static,
{
    fn descriptor() -> ParameterDescriptor {
        ParameterDescriptor::of::<T>(ParameterKind::Service { key: None })
    }

    fn from_invocation(binder: &mut ArgumentBinder) -> HubResult<Self> {
        binder.scope().get::<T>().map(FromServices).ok_or_else(|| {
            HubError::internal(format!(
                "No service for type '{}' has been registered.",
                std::any::type_name::<T>()
            ))
        })
    }
}

/// Compile-time key for [`FromKeyedServices`].
pub trait ServiceKey: Send + 'static {
    const KEY: &'static str;
}

/// A keyed service resolved from the invocation's scope.
pub struct FromKeyedServices<T, K>(pub Arc<T>, PhantomData<fn() -> K>);

impl<T, K> FromKeyedServices<T, K> {
    pub fn into_inner(self) -> Arc<T> {
        self.0
    }
}

impl<T, K> FromInvocation for FromKeyedServices<T, K>
where
    T: Send + Sync + 'static,
    K: ServiceKey,
{
    fn descriptor() -> ParameterDescriptor {
        ParameterDescriptor::of::<T>(ParameterKind::Service { key: Some(K::KEY) })
    }

    fn from_invocation(binder: &mut ArgumentBinder) -> HubResult<Self> {
        binder
            .scope()
            .get_keyed::<T>(K::KEY)
            .map(|service| FromKeyedServices(service, PhantomData))
            .ok_or_else(|| {
                HubError::internal(format!(
                    "No keyed service for type '{}' using key '{}' has been registered.",
                    std::any::type_name::<T>(),
                    K::KEY
                ))
            })
    }
}

impl FromInvocation for CancellationToken {
    fn descriptor() -> ParameterDescriptor {
        ParameterDescriptor::of::<CancellationToken>(ParameterKind::Cancellation)
    }

    fn from_invocation(binder: &mut ArgumentBinder) -> HubResult<Self> {
        Ok(binder.cancellation().clone())
    }
}

/// Items uploaded by the client, decoded as `T`.
///
/// The stream ends when the client completes it. A client-side error is
/// yielded once as `Err` before the stream ends.
pub struct UploadStream<T> {
    id: String,
    rx: mpsc::Receiver<Value>,
    outcome: StreamOutcome,
    done: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T> UploadStream<T> {
    /// Stream ID declared by the client
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T> FromInvocation for UploadStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn descriptor() -> ParameterDescriptor {
        ParameterDescriptor::of::<T>(ParameterKind::Stream)
    }

    fn from_invocation(binder: &mut ArgumentBinder) -> HubResult<Self> {
        let channel = binder.next_stream()?;
        let (id, rx, outcome) = channel.into_parts();
        Ok(UploadStream {
            id,
            rx,
            outcome,
            done: false,
            _item: PhantomData,
        })
    }
}

impl<T: DeserializeOwned> Stream for UploadStream<T> {
    type Item = HubResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(value)) => Poll::Ready(Some(
                serde_json::from_value(value).map_err(|_| HubError::invalid_data(BINDING_ERROR)),
            )),
            Poll::Ready(None) => {
                self.done = true;
                match self.outcome.get() {
                    Some(StreamEnd::Completed(Some(error))) => Poll::Ready(Some(Err(
                        HubError::internal(format!("Stream errored by client: '{}'", error)),
                    ))),
                    Some(StreamEnd::Overflowed { capacity }) => {
                        let error = StreamError::Overflow {
                            id: self.id.clone(),
                            capacity,
                        };
                        Poll::Ready(Some(Err(HubError::invalid_data(error.to_string()))))
                    }
                    _ => Poll::Ready(None),
                }
            }
        }
    }
}
