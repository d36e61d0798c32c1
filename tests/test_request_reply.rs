//! Request/reply behaviour over the in-memory broker


use relaybus::testing::MemoryBroker;
use relaybus::{BusError, HandlerError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{connected_client, connected_client_with_timeout};

#[tokio::test]
async fn test_request_resolves_with_handler_value() {
    let broker = MemoryBroker::new();
    let server = connected_client(&broker, "default").await;
    let caller = connected_client(&broker, "default").await;

    server
        .listen("request.ok", |message: Value| async move {
            Ok(json!({"echo": message["foo"]}))
        })
        .await
        .unwrap();

    let reply: Value = caller
        .request("request.ok", &json!({"foo": "bar"}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"echo": "bar"}));
    assert_eq!(caller.pending_requests().await, 0);
}

#[tokio::test]
async fn test_request_to_own_listener() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "default").await;

    client
        .listen("self.echo", |message| async move { Ok(message) })
        .await
        .unwrap();

    let reply: Value = client.request("self.echo", &json!([1, 2, 3])).await.unwrap();
    assert_eq!(reply, json!([1, 2, 3]));
}

#[tokio::test]
async fn test_null_result_resolves() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "default").await;

    client
        .listen("request.null", |_| async move { Ok(Value::Null) })
        .await
        .unwrap();

    let reply: Value = client.request("request.null", &json!({})).await.unwrap();
    assert_eq!(reply, Value::Null);

    let typed: Option<String> = client.request("request.null", &json!({})).await.unwrap();
    assert_eq!(typed, None);
}

#[tokio::test]
async fn test_handler_error_message_and_correlation_id() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "default").await;

    client
        .listen("request.error", |_| async move {
            Err::<Value, _>(HandlerError::new("X").with_stack("handler.rs:1"))
        })
        .await
        .unwrap();

    let err = client
        .request::<_, Value>("request.error", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::RequestFailed { .. }));
    assert_eq!(err.to_string(), "X");
    assert!(err.correlation_id().is_some_and(|id| !id.is_empty()));
}

#[tokio::test]
async fn test_handler_detail_fallback() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "default").await;

    client
        .listen("request.detail", |_| async move {
            Err::<Value, _>(HandlerError::detail("service error"))
        })
        .await
        .unwrap();

    let err = client
        .request::<_, Value>("request.detail", &json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "service error");
}

#[tokio::test]
async fn test_handler_default_error_message() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "default").await;

    client
        .listen("request.empty", |_| async move {
            Err::<Value, _>(HandlerError::default())
        })
        .await
        .unwrap();

    let err = client
        .request::<_, Value>("request.empty", &json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "request error");
}

#[tokio::test]
async fn test_request_without_listener_times_out() {
    let broker = MemoryBroker::new();
    let client = connected_client_with_timeout(&broker, "default", 100).await;

    let started = tokio::time::Instant::now();
    let err = client
        .request::<_, Value>("request.nobody", &json!({}))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "response timeout");
    assert!(err.correlation_id().is_some());
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(client.pending_requests().await, 0);
}

#[tokio::test]
async fn test_late_reply_is_discarded() {
    let broker = MemoryBroker::new();
    let server = connected_client(&broker, "default").await;
    let caller = connected_client_with_timeout(&broker, "default", 50).await;
    let answered = Arc::new(AtomicUsize::new(0));

    let counter = answered.clone();
    server
        .listen("request.slow", move |_| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("too late"))
            }
        })
        .await
        .unwrap();

    let mut errors = caller.errors();
    let err = caller
        .request::<_, Value>("request.slow", &json!({}))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(answered.load(Ordering::SeqCst), 1);
    assert_eq!(caller.pending_requests().await, 0);
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_password_passes_through_unmodified() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "default").await;

    client
        .listen("request.secret", |_| async move {
            Ok(json!({"user": "alice", "password": "secret1"}))
        })
        .await
        .unwrap();

    let reply: Value = client.request("request.secret", &json!({})).await.unwrap();
    assert_eq!(reply["password"], "secret1");
}

#[tokio::test]
async fn test_concurrent_requests_settle_independently() {
    let broker = MemoryBroker::new();
    let server = connected_client(&broker, "default").await;
    let caller = connected_client(&broker, "default").await;

    server
        .listen("math.double", |message: Value| async move {
            let n = message["n"].as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        })
        .await
        .unwrap();

    let requests = (0..10).map(|n| {
        let caller = caller.clone();
        async move { caller.request::<_, i64>("math.double", &json!({"n": n})).await }
    });
    let results = futures::future::join_all(requests).await;

    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), n as i64 * 2);
    }
    assert_eq!(caller.pending_requests().await, 0);
}

#[tokio::test]
async fn test_invalid_request_json_gets_error_reply() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker, "default").await;

    client
        .listen("request.strict", |message| async move { Ok(message) })
        .await
        .unwrap();

    // A raw publisher that is not a relaybus client
    let (raw, _events) = broker.connect();
    relaybus::Transport::publish(
        &raw,
        "request.strict",
        bytes::Bytes::from_static(b"{broken"),
        Some("_INBOX.raw"),
    )
    .await
    .unwrap();

    assert!(test_helpers::eventually(|| !broker.published_on("_INBOX.raw").is_empty()).await);
    let reply = broker.published_on("_INBOX.raw")[0].json().unwrap();
    assert!(reply[0]["message"].is_string());
    assert!(reply[1].is_null());
}
