mod common;

use common::*;
use hubwire::hub::{
    CompletionMessage, HubMessage, InvocationMessage, StreamInvocationMessage, StreamItemMessage,
};
use hubwire::HubOptions;
use serde_json::json;

fn item(stream_id: &str, value: serde_json::Value) -> HubMessage {
    HubMessage::StreamItem(StreamItemMessage {
        invocation_id: stream_id.to_string(),
        item: value,
    })
}

#[tokio::test]
async fn test_download_stream() {
    let (handler, _events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    let (items, completion) = client.stream("Counter", vec![json!(3)]).await;
    assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
    assert_eq!(completion.error(), None);
    assert_eq!(completion.result(), None);
}

#[tokio::test]
async fn test_empty_download_stream() {
    let (handler, _events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    let (items, completion) = client.stream("Counter", vec![json!(0)]).await;
    assert!(items.is_empty());
    assert_eq!(completion.error(), None);
}

#[tokio::test]
async fn test_cancel_download_stream() {
    let (handler, _events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    client.send(&HubMessage::StreamInvocation(StreamInvocationMessage::new(
        "s",
        "Endless",
        vec![],
    )));
    match client.expect().await {
        HubMessage::StreamItem(item) => assert_eq!(item.invocation_id, "s"),
        other => panic!("expected a stream item, got {:?}", other),
    }

    client.send(&HubMessage::CancelInvocation {
        invocation_id: "s".to_string(),
    });
    let completion = loop {
        match client.expect().await {
            HubMessage::StreamItem(_) => continue,
            HubMessage::Completion(completion) => break completion,
            other => panic!("unexpected message {:?}", other),
        }
    };
    assert_eq!(completion.invocation_id, "s");
    assert_eq!(completion.error(), None);

    // Nothing more arrives for the canceled stream
    let completion = client.invoke("Echo", vec![json!("next")]).await;
    assert_eq!(completion.result(), Some(&json!("next")));
}

#[tokio::test]
async fn test_streaming_does_not_hold_a_slot() {
    let (handler, _events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    client.send(&HubMessage::StreamInvocation(StreamInvocationMessage::new(
        "s",
        "Endless",
        vec![],
    )));
    client.send(&HubMessage::Invocation(InvocationMessage::new(
        "e",
        "Echo",
        vec![json!("alongside")],
    )));

    let completion = loop {
        match client.expect().await {
            HubMessage::StreamItem(_) => continue,
            HubMessage::Completion(completion) => break completion,
            other => panic!("unexpected message {:?}", other),
        }
    };
    assert_eq!(completion.invocation_id, "e");
    assert_eq!(completion.result(), Some(&json!("alongside")));
}

#[tokio::test]
async fn test_duplicate_stream_invocation_id() {
    let (handler, _events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    client.send(&HubMessage::StreamInvocation(StreamInvocationMessage::new(
        "s",
        "Endless",
        vec![],
    )));
    client.send(&HubMessage::StreamInvocation(StreamInvocationMessage::new(
        "s",
        "Counter",
        vec![json!(3)],
    )));

    let rejected = loop {
        match client.expect().await {
            HubMessage::StreamItem(_) => continue,
            HubMessage::Completion(completion) => break completion,
            other => panic!("unexpected message {:?}", other),
        }
    };
    assert_eq!(rejected.invocation_id, "s");
    assert_eq!(rejected.error(), Some("Invocation ID 's' is already in use."));

    // The first stream is untouched
    match client.expect().await {
        HubMessage::StreamItem(item) => assert_eq!(item.invocation_id, "s"),
        other => panic!("expected a stream item, got {:?}", other),
    }

    client.send(&HubMessage::CancelInvocation {
        invocation_id: "s".to_string(),
    });
    let completion = loop {
        match client.expect().await {
            HubMessage::StreamItem(_) => continue,
            HubMessage::Completion(completion) => break completion,
            other => panic!("unexpected message {:?}", other),
        }
    };
    assert_eq!(completion.invocation_id, "s");
    assert_eq!(completion.error(), None);
}

#[tokio::test]
async fn test_stream_producer_error() {
    let (handler, _events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    let (items, completion) = client.stream("FailingStream", vec![]).await;
    assert_eq!(items, vec![json!(1)]);
    assert_eq!(
        completion.error(),
        Some("An error occurred on the server while streaming results.")
    );
}

#[tokio::test]
async fn test_invocation_mode_mismatch() {
    let (handler, _events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    let completion = client.invoke("Counter", vec![json!(1)]).await;
    assert_eq!(
        completion.error(),
        Some("The client attempted to invoke the streaming 'Counter' method with a non-streaming invocation.")
    );

    let (items, completion) = client.stream("Echo", vec![json!("x")]).await;
    assert!(items.is_empty());
    assert_eq!(
        completion.error(),
        Some("The client attempted to invoke the non-streaming 'Echo' method with a streaming invocation.")
    );
}

#[tokio::test]
async fn test_upload_stream() {
    let (handler, _events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    client.send(&HubMessage::Invocation(
        InvocationMessage::new("1", "Sum", vec![]).with_stream_ids(vec!["up".to_string()]),
    ));
    for n in [1, 2, 3] {
        client.send(&item("up", json!(n)));
    }
    client.send(&HubMessage::Completion(CompletionMessage::void("up")));

    let completion = client.expect_completion().await;
    assert_eq!(completion.invocation_id, "1");
    assert_eq!(completion.result(), Some(&json!(6)));

    // Late items for a finished upload are dropped
    client.send(&item("up", json!(100)));
    let completion = client.invoke("Echo", vec![json!("ok")]).await;
    assert_eq!(completion.result(), Some(&json!("ok")));
}

#[tokio::test]
async fn test_upload_stream_count_mismatch() {
    let (handler, _events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    let completion = client.invoke("Sum", vec![]).await;
    assert_eq!(
        completion.error(),
        Some("An unexpected error occurred invoking 'Sum' on the server. HubError: Client sent 0 stream(s), Hub method expects 1.")
    );
}

#[tokio::test]
async fn test_upload_errored_by_client() {
    let (handler, _events) = handler_with(detailed_options());
    let (mut client, _task) = TestClient::connect(&handler).await;

    client.send(&HubMessage::Invocation(
        InvocationMessage::new("1", "Sum", vec![]).with_stream_ids(vec!["up".to_string()]),
    ));
    client.send(&item("up", json!(1)));
    client.send(&HubMessage::Completion(CompletionMessage::with_error("up", "oops")));

    let completion = client.expect_completion().await;
    assert_eq!(
        completion.error(),
        Some("An unexpected error occurred invoking 'Sum' on the server. InternalError: Stream errored by client: 'oops'")
    );
}

#[tokio::test]
async fn test_unread_upload_overflows_without_stalling_connection() {
    let (handler, events) = handler_with(HubOptions {
        stream_buffer_capacity: 2,
        enable_detailed_errors: true,
        ..HubOptions::default()
    });
    let (mut client, _task) = TestClient::connect(&handler).await;

    client.send(&HubMessage::Invocation(
        InvocationMessage::new("g", "GatedSum", vec![]).with_stream_ids(vec!["up".to_string()]),
    ));
    for n in 1..=5 {
        client.send(&item("up", json!(n)));
    }

    // The reader keeps dispatching while nobody reads the upload
    let completion = client.invoke("Echo", vec![json!("still here")]).await;
    assert_eq!(completion.result(), Some(&json!("still here")));

    events.gate.notify_one();
    let completion = client.expect_completion().await;
    assert_eq!(completion.invocation_id, "g");
    assert_eq!(
        completion.error(),
        Some("An unexpected error occurred invoking 'GatedSum' on the server. InvalidDataError: Stream 'up' exceeded its buffer of 2 item(s).")
    );
}

#[tokio::test]
async fn test_reconnect_messages_without_reconnect_are_ignored() {
    let (handler, _events) = handler();
    let (mut client, _task) = TestClient::connect(&handler).await;

    client.send(&HubMessage::Ack { sequence_id: 4 });
    client.send(&HubMessage::Sequence { sequence_id: 1 });

    let completion = client.invoke("Echo", vec![json!("fine")]).await;
    assert_eq!(completion.result(), Some(&json!("fine")));
}
