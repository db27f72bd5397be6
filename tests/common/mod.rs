//! Shared hub and client for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use hubwire::hub::codec::{parse_handshake_response, RECORD_SEPARATOR};
use hubwire::hub::{
    Arg, CompletionMessage, ConnectionError, FromServices, Hub, HubConnectionHandler,
    HubContext, HubDefinition, HubDefinitionBuilder, HubError, HubMessage, HubProtocol,
    HubResult, HubUser, InvocationMessage, JsonHubProtocol, MemoryClient, MemoryTransport,
    ServiceCollection, StreamInvocationMessage, Transport, UploadStream,
};
use hubwire::HubOptions;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Barrier, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test hub
// =============================================================================

/// Lifecycle events recorded by [`TestHub`]
#[derive(Debug, Default)]
pub struct Events {
    pub connected: Mutex<Vec<String>>,
    pub disconnected: Mutex<Vec<(String, Option<String>)>>,
    pub recorded: Mutex<Vec<String>>,
    /// Holds `GatedSum` back until a test calls `notify_one`
    pub gate: Notify,
}

impl Events {
    pub fn disconnected(&self) -> Vec<(String, Option<String>)> {
        self.disconnected.lock().unwrap().clone()
    }

    pub fn recorded(&self) -> Vec<String> {
        self.recorded.lock().unwrap().clone()
    }
}

pub struct TestHub {
    pub events: Arc<Events>,
    pub fail_connect: bool,
}

#[async_trait]
impl Hub for TestHub {
    async fn on_connected(&self, ctx: &HubContext) -> HubResult<()> {
        if self.fail_connect {
            return Err(HubError::new("Not today."));
        }
        self.events
            .connected
            .lock()
            .unwrap()
            .push(ctx.connection_id().to_string());
        Ok(())
    }

    async fn on_disconnected(
        &self,
        ctx: &HubContext,
        error: Option<&ConnectionError>,
    ) -> HubResult<()> {
        self.events
            .disconnected
            .lock()
            .unwrap()
            .push((ctx.connection_id().to_string(), error.map(|e| e.to_string())));
        Ok(())
    }
}

async fn echo(_hub: Arc<TestHub>, _ctx: HubContext, Arg(text): Arg<String>) -> HubResult<String> {
    Ok(text)
}

async fn add(_hub: Arc<TestHub>, _ctx: HubContext, Arg(a): Arg<i64>, Arg(b): Arg<i64>) -> HubResult<i64> {
    Ok(a + b)
}

async fn nothing(_hub: Arc<TestHub>, _ctx: HubContext) -> HubResult<()> {
    Ok(())
}

async fn null_result(_hub: Arc<TestHub>, _ctx: HubContext) -> HubResult<Option<String>> {
    Ok(None)
}

async fn fail(_hub: Arc<TestHub>, _ctx: HubContext) -> HubResult<()> {
    Err(HubError::new("boom"))
}

async fn crash(_hub: Arc<TestHub>, _ctx: HubContext) -> HubResult<()> {
    Err(anyhow::anyhow!("disk on fire").into())
}

async fn record(hub: Arc<TestHub>, _ctx: HubContext, Arg(text): Arg<String>) -> HubResult<()> {
    hub.events.recorded.lock().unwrap().push(text);
    Ok(())
}

/// Runs until the invocation is canceled.
async fn block(_hub: Arc<TestHub>, _ctx: HubContext, token: CancellationToken) -> HubResult<String> {
    token.cancelled().await;
    Ok("released".to_string())
}

/// Completes only once two invocations are inside it at the same time.
async fn rendezvous(
    _hub: Arc<TestHub>,
    _ctx: HubContext,
    FromServices(barrier): FromServices<Barrier>,
) -> HubResult<()> {
    barrier.wait().await;
    Ok(())
}

async fn counter(
    _hub: Arc<TestHub>,
    _ctx: HubContext,
    Arg(count): Arg<u32>,
) -> HubResult<impl Stream<Item = HubResult<u32>>> {
    Ok(futures::stream::iter((0..count).map(Ok::<_, HubError>)))
}

async fn endless(
    _hub: Arc<TestHub>,
    _ctx: HubContext,
) -> HubResult<impl Stream<Item = HubResult<u64>>> {
    Ok(futures::stream::iter(0u64..).then(|i| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok::<_, HubError>(i)
    }))
}

async fn failing_stream(
    _hub: Arc<TestHub>,
    _ctx: HubContext,
) -> HubResult<impl Stream<Item = HubResult<u32>>> {
    Ok(futures::stream::iter(vec![
        Ok(1),
        Err(HubError::internal("producer broke")),
    ]))
}

async fn sum(_hub: Arc<TestHub>, _ctx: HubContext, numbers: UploadStream<i64>) -> HubResult<i64> {
    numbers
        .try_fold(0i64, |acc, n| async move { Ok::<_, HubError>(acc + n) })
        .await
}

/// Like `Sum`, but reads nothing until the gate opens.
async fn gated_sum(hub: Arc<TestHub>, ctx: HubContext, numbers: UploadStream<i64>) -> HubResult<i64> {
    hub.events.gate.notified().await;
    sum(hub, ctx, numbers).await
}

async fn ask_name(_hub: Arc<TestHub>, ctx: HubContext) -> HubResult<String> {
    ctx.clients()
        .caller()
        .invoke::<String>("GetName", vec![], &ctx.connection_aborted())
        .await
        .map_err(|e| HubError::new(e.to_string()))
}

async fn broadcast(_hub: Arc<TestHub>, ctx: HubContext, Arg(message): Arg<String>) -> HubResult<()> {
    ctx.clients()
        .all()
        .send("Receive", vec![json!(message)])
        .await
        .map_err(|e| HubError::internal(e.to_string()))
}

async fn send_others(_hub: Arc<TestHub>, ctx: HubContext, Arg(message): Arg<String>) -> HubResult<()> {
    ctx.clients()
        .others()
        .send("Receive", vec![json!(message)])
        .await
        .map_err(|e| HubError::internal(e.to_string()))
}

async fn join_group(_hub: Arc<TestHub>, ctx: HubContext, Arg(group): Arg<String>) -> HubResult<()> {
    ctx.groups().add_to_connection(ctx.connection_id(), &group);
    Ok(())
}

async fn leave_group(_hub: Arc<TestHub>, ctx: HubContext, Arg(group): Arg<String>) -> HubResult<()> {
    ctx.groups().remove_from_connection(ctx.connection_id(), &group);
    Ok(())
}

async fn send_to_group(
    _hub: Arc<TestHub>,
    ctx: HubContext,
    Arg(group): Arg<String>,
    Arg(message): Arg<String>,
) -> HubResult<()> {
    ctx.clients()
        .group(&group)
        .send("Receive", vec![json!(message)])
        .await
        .map_err(|e| HubError::internal(e.to_string()))
}

async fn send_to_user(
    _hub: Arc<TestHub>,
    ctx: HubContext,
    Arg(user): Arg<String>,
    Arg(message): Arg<String>,
) -> HubResult<()> {
    ctx.clients()
        .user(&user)
        .send("Receive", vec![json!(message)])
        .await
        .map_err(|e| HubError::internal(e.to_string()))
}

async fn whoami(_hub: Arc<TestHub>, ctx: HubContext) -> HubResult<Option<String>> {
    Ok(ctx.user().id.clone())
}

async fn set_item(
    _hub: Arc<TestHub>,
    ctx: HubContext,
    Arg(key): Arg<String>,
    Arg(value): Arg<Value>,
) -> HubResult<()> {
    ctx.set_item(key, value);
    Ok(())
}

async fn get_item(_hub: Arc<TestHub>, ctx: HubContext, Arg(key): Arg<String>) -> HubResult<Option<Value>> {
    Ok(ctx.get_item(&key))
}

async fn abort(_hub: Arc<TestHub>, ctx: HubContext) -> HubResult<()> {
    ctx.abort();
    Ok(())
}

pub fn test_definition() -> HubDefinitionBuilder<TestHub> {
    HubDefinition::builder()
        .method("Echo", echo)
        .method("Add", add)
        .method("Nothing", nothing)
        .method("NullResult", null_result)
        .method("Fail", fail)
        .method("Crash", crash)
        .method("Record", record)
        .method("Block", block)
        .method("Rendezvous", rendezvous)
        .stream_method("Counter", counter)
        .stream_method("Endless", endless)
        .stream_method("FailingStream", failing_stream)
        .method("Sum", sum)
        .method("GatedSum", gated_sum)
        .method("AskName", ask_name)
        .method("Broadcast", broadcast)
        .method("SendOthers", send_others)
        .method("JoinGroup", join_group)
        .method("LeaveGroup", leave_group)
        .method("SendToGroup", send_to_group)
        .method("SendToUser", send_to_user)
        .method("WhoAmI", whoami)
        .method("SetItem", set_item)
        .method("GetItem", get_item)
        .method("Abort", abort)
}

/// Handler over [`test_definition`] with `options`
pub fn handler_with(options: HubOptions) -> (HubConnectionHandler<TestHub>, Arc<Events>) {
    let events = Arc::new(Events::default());
    let hub_events = events.clone();
    let mut services = ServiceCollection::new();
    services.add_singleton(Barrier::new(2));

    let handler = HubConnectionHandler::builder(test_definition().build().unwrap())
        .options(options)
        .services(services.build())
        .hub_factory(move || TestHub {
            events: hub_events.clone(),
            fail_connect: false,
        })
        .build()
        .unwrap();
    (handler, events)
}

/// Handler whose hub refuses every connection in `on_connected`
pub fn refusing_handler(options: HubOptions) -> (HubConnectionHandler<TestHub>, Arc<Events>) {
    let events = Arc::new(Events::default());
    let hub_events = events.clone();
    let handler = HubConnectionHandler::builder(test_definition().build().unwrap())
        .options(options)
        .hub_factory(move || TestHub {
            events: hub_events.clone(),
            fail_connect: true,
        })
        .build()
        .unwrap();
    (handler, events)
}

pub fn handler() -> (HubConnectionHandler<TestHub>, Arc<Events>) {
    handler_with(HubOptions::default())
}

pub fn detailed_options() -> HubOptions {
    HubOptions {
        enable_detailed_errors: true,
        ..HubOptions::default()
    }
}

// =============================================================================
// Test client
// =============================================================================

pub type ServerTask = JoinHandle<Result<(), ConnectionError>>;

/// Start serving `transport` on a background task.
pub fn serve<H: Hub>(handler: &HubConnectionHandler<H>, transport: Transport) -> ServerTask {
    let handler = handler.clone();
    tokio::spawn(async move { handler.run(transport).await })
}

/// Speaks the JSON hub protocol over a [`MemoryClient`].
pub struct TestClient {
    pub transport: MemoryClient,
    buffer: Vec<u8>,
    next_id: u64,
}

impl TestClient {
    pub fn new(transport: MemoryClient) -> Self {
        Self {
            transport,
            buffer: Vec::new(),
            next_id: 0,
        }
    }

    /// Connect a fresh in-memory client and complete the handshake.
    pub async fn connect<H: Hub>(handler: &HubConnectionHandler<H>) -> (TestClient, ServerTask) {
        Self::connect_with(handler, MemoryTransport::new(), 1).await
    }

    pub async fn connect_as<H: Hub>(
        handler: &HubConnectionHandler<H>,
        user: HubUser,
    ) -> (TestClient, ServerTask) {
        Self::connect_with(handler, MemoryTransport::new().with_user(user), 1).await
    }

    pub async fn connect_with<H: Hub>(
        handler: &HubConnectionHandler<H>,
        transport: MemoryTransport,
        version: u32,
    ) -> (TestClient, ServerTask) {
        let (transport, client) = transport.build();
        let task = serve(handler, transport);
        let mut client = TestClient::new(client);
        client.send_handshake("json", version);
        assert_eq!(client.read_handshake().await, Some(None));
        client.wait_ready().await;
        (client, task)
    }

    /// Round-trip one invocation so registration and `on_connected` are done.
    pub async fn wait_ready(&mut self) {
        self.send(&HubMessage::Invocation(InvocationMessage::new(
            "ready",
            "Nothing",
            vec![],
        )));
        let completion = self.expect_completion().await;
        assert_eq!(completion.invocation_id, "ready");
    }

    pub fn send_raw(&self, bytes: impl Into<Vec<u8>>) {
        self.transport.send(bytes).unwrap();
    }

    pub fn send_handshake(&self, protocol: &str, version: u32) {
        self.send_raw(handshake_bytes(protocol, version));
    }

    /// `Some(error)` from the handshake response, `None` if the server closed first
    pub async fn read_handshake(&mut self) -> Option<Option<String>> {
        loop {
            if let Some((response, consumed)) = parse_handshake_response(&self.buffer).unwrap() {
                self.buffer.drain(..consumed);
                return Some(response.error);
            }
            let chunk = self.transport.recv().await?;
            self.buffer.extend_from_slice(&chunk);
        }
    }

    pub fn send(&self, message: &HubMessage) {
        self.send_raw(encode(message));
    }

    pub fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    /// Next message from the server, `None` once it closed the transport
    pub async fn read(&mut self) -> Option<HubMessage> {
        loop {
            if let Some((message, consumed)) = JsonHubProtocol.try_parse(&self.buffer).unwrap() {
                self.buffer.drain(..consumed);
                return Some(message);
            }
            let chunk = self.transport.recv().await?;
            self.buffer.extend_from_slice(&chunk);
        }
    }

    /// Next message that is not a keep-alive ping or a reconnect ack
    pub async fn read_skip_pings(&mut self) -> Option<HubMessage> {
        loop {
            match self.read().await? {
                HubMessage::Ping | HubMessage::Ack { .. } => continue,
                other => return Some(other),
            }
        }
    }

    /// Like [`read_skip_pings`](Self::read_skip_pings), failing after five seconds.
    pub async fn expect(&mut self) -> HubMessage {
        tokio::time::timeout(Duration::from_secs(5), self.read_skip_pings())
            .await
            .expect("timed out waiting for a message")
            .expect("server closed the connection")
    }

    pub async fn expect_completion(&mut self) -> CompletionMessage {
        match self.expect().await {
            HubMessage::Completion(completion) => completion,
            other => panic!("expected a completion, got {:?}", other),
        }
    }

    /// Invoke `target` and wait for its completion.
    pub async fn invoke(&mut self, target: &str, arguments: Vec<Value>) -> CompletionMessage {
        let id = self.next_id();
        self.send(&HubMessage::Invocation(InvocationMessage::new(
            id.clone(),
            target,
            arguments,
        )));
        let completion = self.expect_completion().await;
        assert_eq!(completion.invocation_id, id);
        completion
    }

    /// Start a stream invocation and collect its items and completion.
    pub async fn stream(&mut self, target: &str, arguments: Vec<Value>) -> (Vec<Value>, CompletionMessage) {
        let id = self.next_id();
        self.send(&HubMessage::StreamInvocation(StreamInvocationMessage::new(
            id.clone(),
            target,
            arguments,
        )));
        let mut items = Vec::new();
        loop {
            match self.expect().await {
                HubMessage::StreamItem(item) => {
                    assert_eq!(item.invocation_id, id);
                    items.push(item.item);
                }
                HubMessage::Completion(completion) => {
                    assert_eq!(completion.invocation_id, id);
                    return (items, completion);
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
    }

    /// Expect a server-to-client invocation of `target`.
    pub async fn expect_invocation(&mut self, target: &str) -> InvocationMessage {
        match self.expect().await {
            HubMessage::Invocation(invocation) => {
                assert_eq!(invocation.target, target);
                invocation
            }
            other => panic!("expected an invocation of {}, got {:?}", target, other),
        }
    }

    /// Read until the server closes, returning the Close message if one came.
    pub async fn expect_close(&mut self) -> Option<hubwire::hub::CloseMessage> {
        let mut close = None;
        while let Some(message) = tokio::time::timeout(Duration::from_secs(60), self.read())
            .await
            .expect("timed out waiting for close")
        {
            if let HubMessage::Close(message) = message {
                close = Some(message);
            }
        }
        close
    }
}

pub fn encode(message: &HubMessage) -> Vec<u8> {
    let mut bytes = Vec::new();
    JsonHubProtocol.write(message, &mut bytes).unwrap();
    bytes
}

pub fn handshake_bytes(protocol: &str, version: u32) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(&json!({ "protocol": protocol, "version": version })).unwrap();
    bytes.push(RECORD_SEPARATOR);
    bytes
}
