mod common;

use common::*;
use hubwire::hub::{
    ClientResultError, CompletionMessage, HubMessage, InvocationMessage, MemoryTransport,
};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_hub_method_awaits_client_result() {
    let (handler, _events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    client.send(&HubMessage::Invocation(InvocationMessage::new(
        "ask",
        "AskName",
        vec![],
    )));
    let request = client.expect_invocation("GetName").await;
    let request_id = request.invocation_id.expect("client results carry an ID");

    // The slot is parked while waiting, so the caller can still be served
    let completion = client.invoke("Echo", vec![json!("meanwhile")]).await;
    assert_eq!(completion.result(), Some(&json!("meanwhile")));

    client.send(&HubMessage::Completion(CompletionMessage::with_result(
        request_id,
        json!("Ada"),
    )));
    let completion = client.expect_completion().await;
    assert_eq!(completion.invocation_id, "ask");
    assert_eq!(completion.result(), Some(&json!("Ada")));
}

#[tokio::test]
async fn test_client_error_reaches_hub_method() {
    let (handler, _events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    client.send(&HubMessage::Invocation(InvocationMessage::new(
        "1",
        "AskName",
        vec![],
    )));
    let request = client.expect_invocation("GetName").await;
    client.send(&HubMessage::Completion(CompletionMessage::with_error(
        request.invocation_id.unwrap(),
        "no name here",
    )));

    let completion = client.expect_completion().await;
    assert_eq!(
        completion.error(),
        Some("An unexpected error occurred invoking 'AskName' on the server. HubError: no name here")
    );
}

#[tokio::test]
async fn test_invoke_from_outside_a_hub() {
    let (handler, _events) = handler();
    let transport = MemoryTransport::new().with_connection_id("conn-1");
    let (mut client, _task) = TestClient::connect_with(&handler, transport, 1).await;

    let clients = handler.clients();
    let pending = tokio::spawn(async move {
        clients
            .client("conn-1")
            .invoke::<u32>("Pick", vec![json!([1, 2, 3])], &CancellationToken::new())
            .await
    });

    let request = client.expect_invocation("Pick").await;
    assert_eq!(request.arguments, vec![json!([1, 2, 3])]);
    client.send(&HubMessage::Completion(CompletionMessage::with_result(
        request.invocation_id.unwrap(),
        json!(2),
    )));

    assert_eq!(pending.await.unwrap(), Ok(2));
}

#[tokio::test]
async fn test_invoke_unknown_connection() {
    let (handler, _events) = handler();
    let result = handler
        .clients()
        .client("ghost")
        .invoke::<String>("GetName", vec![], &CancellationToken::new())
        .await;

    let error = result.unwrap_err();
    assert_eq!(error, ClientResultError::NotConnected("ghost".to_string()));
    assert_eq!(error.to_string(), "Connection 'ghost' does not exist.");
}

#[tokio::test]
async fn test_canceled_client_result_notifies_client() {
    let (handler, _events) = handler();
    let transport = MemoryTransport::new().with_connection_id("conn-1");
    let (mut client, _task) = TestClient::connect_with(&handler, transport, 1).await;

    let token = CancellationToken::new();
    let clients = handler.clients();
    let cancel = token.clone();
    let pending = tokio::spawn(async move {
        clients
            .client("conn-1")
            .invoke::<String>("GetName", vec![], &cancel)
            .await
    });

    let request = client.expect_invocation("GetName").await;
    token.cancel();

    let result = pending.await.unwrap();
    assert_eq!(result, Err(ClientResultError::Canceled));
    assert_eq!(
        client.expect().await,
        HubMessage::CancelInvocation {
            invocation_id: request.invocation_id.clone().unwrap()
        }
    );

    // A late answer is discarded and the connection stays up
    client.send(&HubMessage::Completion(CompletionMessage::with_result(
        request.invocation_id.unwrap(),
        json!("late"),
    )));
    let completion = client.invoke("Echo", vec![json!("alive")]).await;
    assert_eq!(completion.result(), Some(&json!("alive")));
}

#[tokio::test]
async fn test_pending_client_result_fails_on_disconnect() {
    let (handler, _events) = handler();
    let transport = MemoryTransport::new().with_connection_id("conn-1");
    let (mut client, task) = TestClient::connect_with(&handler, transport, 1).await;

    let clients = handler.clients();
    let pending = tokio::spawn(async move {
        clients
            .client("conn-1")
            .invoke::<String>("GetName", vec![], &CancellationToken::new())
            .await
    });

    client.expect_invocation("GetName").await;
    client.transport.close();
    task.await.unwrap().unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Err(ClientResultError::ConnectionClosed));
}
