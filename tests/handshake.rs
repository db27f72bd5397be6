mod common;

use common::*;
use hubwire::hub::{ConnectionError, HubMessage, InvocationMessage, MemoryTransport, TransferFormat};
use hubwire::HubOptions;
use serde_json::json;
use std::time::Duration;

async fn rejected_with(transport: MemoryTransport, protocol: &str, version: u32) -> (Option<String>, Result<(), ConnectionError>) {
    let (handler, events) = handler();
    let (transport, client) = transport.build();
    let task = serve(&handler, transport);
    let mut client = TestClient::new(client);
    client.send_handshake(protocol, version);

    let error = client.read_handshake().await.expect("handshake response");
    // The server closes right after the failure response
    assert!(client.read().await.is_none());
    assert!(events.connected.lock().unwrap().is_empty());
    assert!(handler.registry().is_empty());
    (error, task.await.unwrap())
}

#[tokio::test]
async fn test_handshake_succeeds_and_invocation_runs() {
    let (handler, events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    let completion = client.invoke("Echo", vec![json!("hi")]).await;
    assert_eq!(completion.result(), Some(&json!("hi")));
    assert_eq!(events.connected.lock().unwrap().len(), 1);
    assert_eq!(handler.registry().len(), 1);
}

#[tokio::test]
async fn test_unknown_protocol_is_rejected() {
    let (error, result) = rejected_with(MemoryTransport::new(), "messagepack", 1).await;
    assert_eq!(
        error.as_deref(),
        Some("The protocol 'messagepack' is not supported.")
    );
    assert_eq!(
        result,
        Err(ConnectionError::Handshake(
            "The protocol 'messagepack' is not supported.".to_string()
        ))
    );
}

#[tokio::test]
async fn test_unsupported_version_is_rejected() {
    let (error, result) = rejected_with(MemoryTransport::new(), "json", 3).await;
    assert_eq!(
        error.as_deref(),
        Some("The server does not support version 3 of the 'json' protocol.")
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn test_transfer_format_mismatch_is_rejected() {
    let transport = MemoryTransport::new().with_transfer_formats(vec![TransferFormat::Binary]);
    let (error, _) = rejected_with(transport, "json", 1).await;
    assert_eq!(
        error.as_deref(),
        Some("Cannot use the 'json' protocol on the current transport. The transport does not support 'Text' transfer format.")
    );
}

#[tokio::test]
async fn test_protocol_name_is_case_insensitive() {
    let (handler, _events) = handler();
    let (transport, client) = MemoryTransport::pair();
    let _task = serve(&handler, transport);
    let mut client = TestClient::new(client);
    client.send_handshake("JSON", 1);
    assert_eq!(client.read_handshake().await, Some(None));
}

#[tokio::test]
async fn test_handshake_split_across_chunks_with_trailing_message() {
    let (handler, _events) = handler();
    let (transport, client) = MemoryTransport::pair();
    let _task = serve(&handler, transport);
    let mut client = TestClient::new(client);

    let handshake = handshake_bytes("json", 1);
    let (head, tail) = handshake.split_at(5);
    client.send_raw(head.to_vec());

    let mut rest = tail.to_vec();
    rest.extend(encode(&HubMessage::Invocation(InvocationMessage::new(
        "1",
        "Add",
        vec![json!(2), json!(3)],
    ))));
    client.send_raw(rest);

    assert_eq!(client.read_handshake().await, Some(None));
    let completion = client.expect_completion().await;
    assert_eq!(completion.invocation_id, "1");
    assert_eq!(completion.result(), Some(&json!(5)));
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_closes_without_response() {
    let options = HubOptions {
        handshake_timeout: Duration::from_secs(2),
        ..HubOptions::default()
    };
    let (handler, events) = handler_with(options);
    let (transport, client) = MemoryTransport::pair();
    let task = serve(&handler, transport);
    let mut client = TestClient::new(client);

    assert_eq!(client.read_handshake().await, None);
    assert_eq!(
        task.await.unwrap(),
        Err(ConnectionError::Handshake("Handshake was canceled.".to_string()))
    );
    assert!(events.connected.lock().unwrap().is_empty());
    assert!(events.disconnected().is_empty());
}

#[tokio::test]
async fn test_unterminated_handshake_over_size_limit_is_rejected() {
    let options = HubOptions {
        maximum_receive_message_size: Some(64),
        ..HubOptions::default()
    };
    let (handler, events) = handler_with(options);
    let (transport, client) = MemoryTransport::pair();
    let task = serve(&handler, transport);
    let mut client = TestClient::new(client);

    // No record separator ever arrives
    client.send_raw(vec![b' '; 40]);
    client.send_raw(vec![b' '; 40]);

    let error = client.read_handshake().await.expect("handshake response");
    let expected = "The maximum message size of 64B was exceeded. The message size can be configured in HubOptions.";
    assert_eq!(error.as_deref(), Some(expected));
    assert!(client.read().await.is_none());
    assert_eq!(
        task.await.unwrap(),
        Err(ConnectionError::Handshake(expected.to_string()))
    );
    assert!(events.connected.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_transport_closed_before_handshake() {
    let (handler, _events) = handler();
    let (transport, client) = MemoryTransport::pair();
    let task = serve(&handler, transport);
    client.close();

    assert!(matches!(task.await.unwrap(), Err(ConnectionError::Handshake(_))));
}
