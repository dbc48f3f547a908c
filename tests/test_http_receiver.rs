//! HTTP receiver tests over real TCP connections

mod test_helpers;

use hyper::StatusCode;
use msgrelay::receivers::{HttpReceiver, Receiver};
use msgrelay::testing::mocks::{FixedRequestHandler, RecordingItemHandler};
use std::collections::HashMap;
use std::sync::Arc;
use test_helpers::raw_request;
use tokio_util::sync::CancellationToken;

async fn started(
    receiver: HttpReceiver,
    max_concurrent_accepts: usize,
    handler: Arc<RecordingItemHandler>,
) -> HttpReceiver {
    let mut receiver = receiver;
    receiver
        .configure(&HashMap::from([
            ("bind_address".to_string(), "127.0.0.1:0".to_string()),
            (
                "max_concurrent_accepts".to_string(),
                max_concurrent_accepts.to_string(),
            ),
            ("shutdown_grace_ms".to_string(), "200".to_string()),
        ]))
        .unwrap();
    receiver
        .start_receiving(handler, CancellationToken::new())
        .await
        .unwrap();
    receiver
}

#[tokio::test]
async fn test_post_to_submit_path_is_accepted() {
    let items = Arc::new(RecordingItemHandler::new());
    let mut receiver = started(HttpReceiver::new("http"), 4, items.clone()).await;
    let addr = receiver.local_addr().unwrap();

    let (status, body) = raw_request(
        addr,
        "POST",
        "/messages",
        &[("Message-ID", "<order-1@acme>"), ("Content-Type", "application/json")],
        r#"{"order": 1}"#,
    )
    .await;

    assert_eq!(status, 202);
    assert_eq!(body, "<order-1@acme>");
    let received = items.items();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].properties.get("content_type").map(String::as_str), Some("application/json"));
    assert!(received[0].properties.contains_key("peer"));

    receiver.stop_receiving().await.unwrap();
}

#[tokio::test]
async fn test_default_statuses_for_unmatched_requests() {
    let items = Arc::new(RecordingItemHandler::new());
    let mut receiver = started(HttpReceiver::new("http"), 4, items.clone()).await;
    let addr = receiver.local_addr().unwrap();

    let (ping, body) = raw_request(addr, "GET", "/messages", &[], "").await;
    assert_eq!(ping, 200);
    assert_eq!(body, "ok");

    let (unknown_get, _) = raw_request(addr, "GET", "/unknown", &[], "").await;
    assert_eq!(unknown_get, 406);

    let (unknown_post, _) = raw_request(addr, "POST", "/elsewhere", &[], "data").await;
    assert_eq!(unknown_post, 202);

    let (put, _) = raw_request(addr, "PUT", "/messages", &[], "data").await;
    assert_eq!(put, 405);

    let (empty, _) = raw_request(addr, "POST", "/messages", &[], "").await;
    assert_eq!(empty, 400);

    // a longer path sharing the prefix is not the submit path
    let (lookalike, _) = raw_request(addr, "POST", "/messagesXYZ", &[], "data").await;
    assert_eq!(lookalike, 202);

    assert_eq!(items.count(), 0);
    receiver.stop_receiving().await.unwrap();
}

#[tokio::test]
async fn test_item_handler_fault_is_500() {
    let items = Arc::new(RecordingItemHandler::failing());
    let mut receiver = started(HttpReceiver::new("http"), 4, items.clone()).await;
    let addr = receiver.local_addr().unwrap();

    let (status, _) = raw_request(addr, "POST", "/messages", &[], "payload").await;

    assert_eq!(status, 500);
    assert_eq!(items.count(), 1);
    receiver.stop_receiving().await.unwrap();
}

#[tokio::test]
async fn test_extra_handlers_run_after_builtins() {
    let status = Arc::new(FixedRequestHandler::new("status", "/status", StatusCode::OK));
    let shadowed = Arc::new(FixedRequestHandler::new("shadowed", "/messages", StatusCode::IM_A_TEAPOT));
    let receiver = HttpReceiver::new("http")
        .with_get_handler(status.clone())
        .with_get_handler(shadowed.clone());
    let mut receiver = started(receiver, 4, Arc::new(RecordingItemHandler::new())).await;
    let addr = receiver.local_addr().unwrap();

    let (code, body) = raw_request(addr, "GET", "/status", &[], "").await;
    assert_eq!(code, 200);
    assert_eq!(body, "status");

    // the built-in ping handler matches first
    let (code, _) = raw_request(addr, "GET", "/messages", &[], "").await;
    assert_eq!(code, 200);
    assert_eq!(shadowed.calls(), 0);

    receiver.stop_receiving().await.unwrap();
}

#[tokio::test]
async fn test_single_accept_slot_still_serves_concurrent_clients() {
    let items = Arc::new(RecordingItemHandler::new());
    let mut receiver = started(HttpReceiver::new("http"), 1, items.clone()).await;
    let addr = receiver.local_addr().unwrap();

    let requests = (0..5).map(|n| {
        let id = format!("<m-{n}@acme>");
        async move { raw_request(addr, "POST", "/messages", &[("Message-ID", id.as_str())], "x").await }
    });
    let results = futures::future::join_all(requests).await;

    assert!(results.iter().all(|(status, _)| *status == 202));
    assert_eq!(items.count(), 5);
    receiver.stop_receiving().await.unwrap();
}

#[tokio::test]
async fn test_stop_returns_promptly_with_idle_keep_alive_client() {
    let mut receiver = started(HttpReceiver::new("http"), 2, Arc::new(RecordingItemHandler::new())).await;
    let addr = receiver.local_addr().unwrap();

    // connection opened but no request sent
    let _idle = tokio::net::TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let stopped = tokio::time::timeout(std::time::Duration::from_secs(2), receiver.stop_receiving()).await;
    assert!(matches!(stopped, Ok(Ok(()))));
    assert!(!receiver.is_running());

    // the listener is gone after stop
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}
