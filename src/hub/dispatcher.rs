//! Per-connection message dispatch
//!
//! The connection handler parses frames and hands each message to
//! [`HubDispatcher::dispatch`] in receipt order. Everything that may take
//! time (waiting for a parallelism slot, running hub code, producing stream
//! items) happens on spawned tasks, so the reader keeps consuming frames and
//! stays responsive to pings, cancellations and client results.
//!
//! # Invocation pipeline
//!
//! 1. Resolve the method (case-insensitive)
//! 2. Check the wire argument count
//! 3. Authorize hub and method policies
//! 4. Check the invocation mode (streaming vs non-streaming)
//! 5. Check the upload stream count
//! 6. Register the invocation ID and open upload streams
//! 7. Queue for a parallelism slot (invocations with upload streams skip it)
//! 8. Bind parameters, activate the hub, run the method, send the results
//!
//! Failures in steps 1-6 are answered with an error completion; the
//! connection stays open. Those completions are written as soon as the
//! failure is known and are not ordered behind invocations that are still
//! queued or running, so a rejected invocation can complete before an
//! earlier accepted one.

use crate::config::HubOptions;
use crate::hub::activator::{HubActivator, HubHandle};
use crate::hub::auth::{AuthorizationResource, Authorizer};
use crate::hub::connection::{ConnectionError, HubConnectionContext};
use crate::hub::context::HubContext;
use crate::hub::limiter::{Acquire, InvocationLease, ParallelismLimiter};
use crate::hub::method::{error_message, Hub, HubError, HubErrorKind, HubResult, MethodOutput};
use crate::hub::params::ArgumentBinder;
use crate::hub::protocol::{CompletionMessage, CompletionOutcome, HubMessage};
use crate::hub::registry::ConnectionRegistry;
use crate::hub::router::HubDefinition;
use crate::hub::services::ServiceProvider;
use crate::hub::sink::InvocationSink;
use crate::hub::streams::{StreamError, StreamManager, UploadChannel};
use crate::hub::tracker::{InvocationStatus, InvocationTracker};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared, immutable pieces every connection of a hub uses.
pub struct HubRuntime<H: Hub> {
    pub definition: Arc<HubDefinition<H>>,
    pub activator: Arc<dyn HubActivator<H>>,
    pub authorizer: Arc<dyn Authorizer>,
    pub services: ServiceProvider,
    pub registry: Arc<ConnectionRegistry>,
    pub options: HubOptions,
}

/// What the reader should do after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchFlow {
    Continue,
    /// The client sent Close
    Stop,
}

/// An invocation that passed validation, waiting to run.
struct PendingInvocation {
    invocation_id: Option<String>,
    method: String,
    arguments: Vec<Value>,
    stream_ids: Vec<String>,
    uploads: Vec<UploadChannel>,
    token: CancellationToken,
    streaming: bool,
    slot: Option<Acquire>,
}

pub struct HubDispatcher<H: Hub> {
    runtime: Arc<HubRuntime<H>>,
    connection: Arc<HubConnectionContext>,
    tracker: InvocationTracker,
    streams: StreamManager,
    limiter: ParallelismLimiter,
}

impl<H: Hub> HubDispatcher<H> {
    pub fn new(runtime: Arc<HubRuntime<H>>, connection: Arc<HubConnectionContext>) -> Arc<Self> {
        let tracker = InvocationTracker::new(connection.aborted().clone());
        let streams = StreamManager::new(runtime.options.stream_buffer_capacity);
        let limiter =
            ParallelismLimiter::new(runtime.options.maximum_parallel_invocations_per_client);
        Arc::new(Self {
            runtime,
            connection,
            tracker,
            streams,
            limiter,
        })
    }

    fn detailed(&self) -> bool {
        self.runtime.options.enable_detailed_errors
    }

    fn context(
        &self,
        lease: Option<Arc<InvocationLease>>,
        invocation_id: Option<String>,
    ) -> HubContext {
        HubContext::new(
            self.connection.clone(),
            self.runtime.registry.clone(),
            lease,
            invocation_id,
        )
    }

    // =========================================================================
    // Lifecycle hooks
    // =========================================================================

    pub async fn on_connected(&self) -> HubResult<()> {
        let scope = self.runtime.services.create_scope();
        let handle = HubHandle::activate(self.runtime.activator.clone(), &scope)?;
        let hub = handle.hub();
        let ctx = self.context(None, None);
        AssertUnwindSafe(hub.on_connected(&ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HubError::internal("OnConnected panicked.")))
    }

    pub async fn on_disconnected(&self, error: Option<&ConnectionError>) -> HubResult<()> {
        let scope = self.runtime.services.create_scope();
        let handle = HubHandle::activate(self.runtime.activator.clone(), &scope)?;
        let hub = handle.hub();
        let ctx = self.context(None, None);
        AssertUnwindSafe(hub.on_disconnected(&ctx, error))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HubError::internal("OnDisconnected panicked.")))
    }

    /// Cancel running invocations and drop upload streams.
    pub fn shutdown(&self) {
        self.tracker.cancel_all();
        self.streams.close_all();
    }

    // =========================================================================
    // Message dispatch
    // =========================================================================

    pub async fn dispatch(
        self: &Arc<Self>,
        message: HubMessage,
    ) -> Result<DispatchFlow, ConnectionError> {
        if message.is_sequenced() {
            if let Some(buffer) = self.connection.buffer() {
                if !buffer.should_process() {
                    tracing::debug!(
                        "Skipping replayed {} message on {}",
                        message.kind(),
                        self.connection.connection_id()
                    );
                    return Ok(DispatchFlow::Continue);
                }
            }
        }

        match message {
            HubMessage::Invocation(m) => {
                self.on_invocation(m.invocation_id, m.target, m.arguments, m.stream_ids, false)
                    .await;
            }
            HubMessage::StreamInvocation(m) => {
                self.on_invocation(Some(m.invocation_id), m.target, m.arguments, m.stream_ids, true)
                    .await;
            }
            HubMessage::StreamItem(m) => match self.streams.route_item(&m.invocation_id, m.item) {
                Ok(()) => {}
                Err(e @ StreamError::Overflow { .. }) => tracing::error!(
                    "Failing upload stream on {}: {}",
                    self.connection.connection_id(),
                    e
                ),
                Err(e) => tracing::warn!(
                    "Dropping stream item on {}: {}",
                    self.connection.connection_id(),
                    e
                ),
            },
            HubMessage::Completion(m) => self.on_completion(m),
            HubMessage::CancelInvocation { invocation_id } => {
                if let Err(e) = self.tracker.cancel(&invocation_id) {
                    tracing::debug!("Ignoring CancelInvocation: {}", e);
                }
            }
            HubMessage::Ping => {}
            HubMessage::Ack { sequence_id } => match self.connection.buffer() {
                Some(buffer) => buffer.ack(sequence_id),
                None => tracing::debug!("Ack received without stateful reconnect; ignoring"),
            },
            HubMessage::Sequence { sequence_id } => match self.connection.buffer() {
                Some(buffer) => buffer
                    .reset_sequence(sequence_id)
                    .map_err(ConnectionError::Sequence)?,
                None => tracing::debug!("Sequence received without stateful reconnect; ignoring"),
            },
            HubMessage::Close(close) => {
                tracing::debug!(
                    "Client {} closed the connection{}",
                    self.connection.connection_id(),
                    close.error.map(|e| format!(": {}", e)).unwrap_or_default()
                );
                return Ok(DispatchFlow::Stop);
            }
        }
        Ok(DispatchFlow::Continue)
    }

    fn on_completion(&self, completion: CompletionMessage) {
        let id = completion.invocation_id.as_str();
        if !self.streams.contains(id) {
            self.runtime
                .registry
                .client_results()
                .try_complete(self.connection.connection_id(), &completion);
            return;
        }

        let error = match completion.outcome {
            CompletionOutcome::Void => None,
            CompletionOutcome::Error(error) => Some(error),
            CompletionOutcome::Result(_) => {
                tracing::warn!("Upload stream '{}' was completed with a result", id);
                Some("Server does not support completing an upload stream with a result.".to_string())
            }
        };
        self.streams.complete(id, error);
    }

    async fn on_invocation(
        self: &Arc<Self>,
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
        stream_ids: Vec<String>,
        streaming: bool,
    ) {
        let Some(method) = self.runtime.definition.find(&target) else {
            tracing::warn!("Unknown hub method '{}'", target);
            self.reject(
                invocation_id,
                format!(
                    "Failed to invoke '{}' due to an error on the server. HubError: Method does not exist.",
                    target
                ),
            );
            return;
        };
        let name = method.name.clone();

        let expected = method.wire_argument_count();
        if arguments.len() != expected {
            let error = HubError::invalid_data(format!(
                "Invocation provides {} argument(s) but target expects {}.",
                arguments.len(),
                expected
            ));
            self.reject(
                invocation_id,
                error_message(
                    &format!("Failed to invoke '{}' due to an error on the server.", name),
                    &error,
                    self.detailed(),
                ),
            );
            return;
        }

        let authorized = self
            .authorize(&name, &arguments, &method.policies)
            .await;
        if !authorized {
            tracing::debug!(
                "Connection {} is not authorized to invoke '{}'",
                self.connection.connection_id(),
                name
            );
            self.reject(
                invocation_id,
                format!("Failed to invoke '{}' because user is unauthorized", name),
            );
            return;
        }

        if streaming && !method.is_streaming() {
            self.reject(
                invocation_id,
                format!(
                    "The client attempted to invoke the non-streaming '{}' method with a streaming invocation.",
                    name
                ),
            );
            return;
        }
        if !streaming && method.is_streaming() {
            self.reject(
                invocation_id,
                format!(
                    "The client attempted to invoke the streaming '{}' method with a non-streaming invocation.",
                    name
                ),
            );
            return;
        }

        let expected_streams = method.stream_parameter_count();
        if stream_ids.len() != expected_streams {
            let error = HubError::new(format!(
                "Client sent {} stream(s), Hub method expects {}.",
                stream_ids.len(),
                expected_streams
            ));
            self.reject(
                invocation_id,
                error_message(
                    &format!("An unexpected error occurred invoking '{}' on the server.", name),
                    &error,
                    self.detailed(),
                ),
            );
            return;
        }

        let token = match &invocation_id {
            Some(id) => match self.tracker.try_add(id, &name) {
                Ok(token) => token,
                Err(e) => {
                    tracing::warn!("Rejecting invocation of '{}': {}", name, e);
                    self.reject(invocation_id, e.to_string());
                    return;
                }
            },
            None => self.tracker.untracked_token(),
        };

        let uploads = match self.streams.open(&stream_ids) {
            Ok(uploads) => uploads,
            Err(e) => {
                if let Some(id) = &invocation_id {
                    self.tracker.complete(id, InvocationStatus::Failed);
                }
                self.reject(invocation_id, e.to_string());
                return;
            }
        };

        // Upload-stream invocations wait on the network, not on a slot.
        let slot = stream_ids.is_empty().then(|| self.limiter.acquire());

        let pending = PendingInvocation {
            invocation_id,
            method: name,
            arguments,
            stream_ids,
            uploads,
            token,
            streaming,
            slot,
        };
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run_invocation(pending).await });
    }

    async fn authorize(
        &self,
        method: &str,
        arguments: &[Value],
        method_policies: &[String],
    ) -> bool {
        let resource = AuthorizationResource {
            connection_id: self.connection.connection_id(),
            method,
            arguments,
        };
        for policy in self
            .runtime
            .definition
            .policies()
            .iter()
            .chain(method_policies.iter())
        {
            if !self
                .runtime
                .authorizer
                .authorize(self.connection.user(), policy, &resource)
                .await
            {
                return false;
            }
        }
        true
    }

    /// Answer an invocation that never ran. Written from a task so the reader
    /// never waits on the transport; the answer may overtake completions of
    /// earlier invocations that are still queued or running.
    fn reject(&self, invocation_id: Option<String>, error: String) {
        let Some(invocation_id) = invocation_id else {
            tracing::debug!("Dropping error for fire-and-forget invocation: {}", error);
            return;
        };
        let connection = self.connection.clone();
        tokio::spawn(async move {
            let message =
                HubMessage::Completion(CompletionMessage::with_error(invocation_id, error));
            if let Err(e) = connection.write_message(&message, None).await {
                tracing::debug!("Failed to send error completion: {}", e);
            }
        });
    }

    // =========================================================================
    // Invocation execution
    // =========================================================================

    async fn run_invocation(self: Arc<Self>, pending: PendingInvocation) {
        let PendingInvocation {
            invocation_id,
            method,
            arguments,
            stream_ids,
            uploads,
            token,
            streaming,
            slot,
        } = pending;
        let sink = InvocationSink::new(self.connection.clone(), invocation_id.clone());
        let unexpected = format!(
            "An unexpected error occurred invoking '{}' on the server.",
            method
        );

        let lease = match slot {
            None => None,
            Some(slot) => {
                let permit = tokio::select! {
                    biased;
                    permit = slot.wait() => permit,
                    _ = token.cancelled() => None,
                };
                match permit {
                    Some(permit) => {
                        Some(Arc::new(InvocationLease::new(self.limiter.clone(), permit)))
                    }
                    None => {
                        let outcome = if streaming {
                            CompletionOutcome::Void
                        } else {
                            CompletionOutcome::Error(error_message(
                                &unexpected,
                                &HubError::canceled(),
                                self.detailed(),
                            ))
                        };
                        self.finish(&invocation_id, &stream_ids, InvocationStatus::Cancelled);
                        let _ = sink.send_completion(outcome).await;
                        return;
                    }
                }
            }
        };

        let Some(descriptor) = self.runtime.definition.find(&method) else {
            let error = format!("Failed to invoke '{}'. Method does not exist.", method);
            self.fail(&sink, &invocation_id, &stream_ids, lease.as_deref(), error)
                .await;
            return;
        };

        let scope = Arc::new(self.runtime.services.create_scope());
        let mut binder = ArgumentBinder::new(arguments, uploads, scope.clone(), token.clone());
        let call = match descriptor.bind(&mut binder) {
            Ok(call) => call,
            Err(e) => {
                tracing::debug!("Failed binding arguments for '{}': {}", method, e);
                let prefix = if e.kind == HubErrorKind::InvalidData {
                    format!("Failed to invoke '{}' due to an error on the server.", method)
                } else {
                    unexpected.clone()
                };
                self.fail(
                    &sink,
                    &invocation_id,
                    &stream_ids,
                    lease.as_deref(),
                    error_message(&prefix, &e, self.detailed()),
                )
                .await;
                return;
            }
        };

        let handle = match HubHandle::activate(self.runtime.activator.clone(), &scope) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Failed to activate hub for '{}': {}", method, e);
                self.fail(
                    &sink,
                    &invocation_id,
                    &stream_ids,
                    lease.as_deref(),
                    error_message(&unexpected, &e, self.detailed()),
                )
                .await;
                return;
            }
        };

        let ctx = self.context(lease.clone(), invocation_id.clone());
        let output = AssertUnwindSafe(call(handle.hub(), ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(HubError::internal(format!(
                    "Hub method '{}' panicked.",
                    method
                )))
            });

        match output {
            Err(e) => {
                tracing::error!("Failed invoking hub method '{}': {}", method, e);
                self.fail(
                    &sink,
                    &invocation_id,
                    &stream_ids,
                    lease.as_deref(),
                    error_message(&unexpected, &e, self.detailed()),
                )
                .await;
            }
            Ok(MethodOutput::Stream(stream)) => {
                // Producing items does not hold a slot.
                if let Some(lease) = &lease {
                    lease.finish();
                }
                self.stream_results(&sink, &invocation_id, &stream_ids, stream, &token)
                    .await;
            }
            Ok(output) => {
                let outcome = match output {
                    MethodOutput::Value(value) => CompletionOutcome::Result(value),
                    _ => CompletionOutcome::Void,
                };
                self.finish(&invocation_id, &stream_ids, InvocationStatus::Completed);
                if let Err(e) = sink.send_completion(outcome).await {
                    tracing::debug!("Failed to send completion for '{}': {}", method, e);
                }
                if let Some(lease) = &lease {
                    lease.finish();
                }
            }
        }
        drop(handle);
    }

    async fn stream_results(
        &self,
        sink: &InvocationSink,
        invocation_id: &Option<String>,
        stream_ids: &[String],
        mut stream: futures::stream::BoxStream<'static, HubResult<Value>>,
        token: &CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!("Stream invocation {:?} canceled", invocation_id);
                    self.finish(invocation_id, stream_ids, InvocationStatus::Cancelled);
                    let _ = sink.send_completion(CompletionOutcome::Void).await;
                    return;
                }
                next = AssertUnwindSafe(stream.next()).catch_unwind() => next,
            };

            match next {
                Ok(Some(Ok(item))) => {
                    if let Err(e) = sink.send_item(item).await {
                        tracing::debug!("Stopping stream {:?}: {}", invocation_id, e);
                        self.finish(invocation_id, stream_ids, InvocationStatus::Failed);
                        return;
                    }
                }
                Ok(None) => {
                    self.finish(invocation_id, stream_ids, InvocationStatus::Completed);
                    let _ = sink.send_completion(CompletionOutcome::Void).await;
                    return;
                }
                Ok(Some(Err(e))) => {
                    self.stream_failed(sink, invocation_id, stream_ids, &e).await;
                    return;
                }
                Err(_) => {
                    let e = HubError::internal("Stream producer panicked.");
                    self.stream_failed(sink, invocation_id, stream_ids, &e).await;
                    return;
                }
            }
        }
    }

    async fn stream_failed(
        &self,
        sink: &InvocationSink,
        invocation_id: &Option<String>,
        stream_ids: &[String],
        error: &HubError,
    ) {
        tracing::error!("Stream invocation {:?} failed: {}", invocation_id, error);
        self.finish(invocation_id, stream_ids, InvocationStatus::Failed);
        let _ = sink
            .send_error(error_message(
                "An error occurred on the server while streaming results.",
                error,
                self.detailed(),
            ))
            .await;
    }

    async fn fail(
        &self,
        sink: &InvocationSink,
        invocation_id: &Option<String>,
        stream_ids: &[String],
        lease: Option<&InvocationLease>,
        error: String,
    ) {
        self.finish(invocation_id, stream_ids, InvocationStatus::Failed);
        if let Err(e) = sink.send_error(error).await {
            tracing::debug!("Failed to send error completion: {}", e);
        }
        if let Some(lease) = lease {
            lease.finish();
        }
    }

    /// Forget the invocation ID and close leftover upload streams. Runs before
    /// the terminal completion so the client may reuse the ID right away.
    fn finish(
        &self,
        invocation_id: &Option<String>,
        stream_ids: &[String],
        status: InvocationStatus,
    ) {
        if let Some(id) = invocation_id {
            self.tracker.complete(id, status);
        }
        self.streams.close_for_invocation(stream_ids);
    }
}
