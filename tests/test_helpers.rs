//! Test helpers and utilities for integration tests

use msgrelay::config::RuntimeConfig;
use msgrelay::pipeline::ProcessingContext;
use msgrelay::receivers::ReceivedItem;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Minimal valid configuration with an HTTP receiver on an ephemeral port
#[allow(dead_code)]
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig::from_toml_str(
        r#"
[runtime]
id = "test-runtime"

[http]
bind_address = "127.0.0.1:0"
"#,
    )
    .expect("test config should parse")
}

/// JSON item with an inbound message id
#[allow(dead_code)]
pub fn json_item(message_id: &str) -> ReceivedItem {
    ReceivedItem::new("test", format!(r#"{{"order": "{message_id}"}}"#).into_bytes())
        .with_message_id(message_id)
}

/// Context for the `receive` pipeline with an inbound id
#[allow(dead_code)]
pub fn inbound_context(message_id: &str) -> ProcessingContext {
    ProcessingContext::new("receive", json!({"n": 1})).with_received_message_id(message_id)
}

/// Send one raw HTTP/1.1 request and return the status code and body
#[allow(dead_code)]
pub async fn raw_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let mut request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    request.push_str(body);

    stream.write_all(request.as_bytes()).await.expect("write");

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response within timeout")
        .expect("read");

    parse_response(&String::from_utf8_lossy(&response))
}

fn parse_response(response: &str) -> (u16, String) {
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

/// Poll `condition` until it holds or `timeout` elapses
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
