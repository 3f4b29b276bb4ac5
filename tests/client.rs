//! End-to-end tests for RequestClient: retry, classification, timeout,
//! cancellation, and request-body shape, against raw TCP mock servers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use quill::cancel::CancelToken;
use quill::client::RequestClient;
use quill::config::Config;
use quill::error::ErrorKind;
use quill::request::Request;

async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn http_response(status: u16, reason: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )
}

fn test_config(port: u16, timeout_ms: u64, max_retries: u32) -> Config {
    Config {
        api_endpoint: format!("http://127.0.0.1:{port}/v1/chat/completions"),
        api_key: "test-key".to_string(),
        model: "test-model".to_string(),
        timeout: Duration::from_millis(timeout_ms),
        max_retries,
        max_concurrent_requests: 3,
        stream_response: false,
    }
}

const PONG_BODY: &str = r#"{"choices":[{"message":{"content":"pong"},"finish_reason":"stop"}],"usage":{"total_tokens":3}}"#;

#[tokio::test]
async fn simple_request_returns_content() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let n = socket.read(&mut buf).await.unwrap();
        let request_text = String::from_utf8_lossy(&buf[..n]).into_owned();

        socket
            .write_all(http_response(200, "OK", PONG_BODY).as_bytes())
            .await
            .unwrap();
        request_text
    });

    let client = RequestClient::new(test_config(port, 5_000, 0));
    let response = client
        .send_request(&Request::new("r1", "ping"))
        .await
        .unwrap();

    assert_eq!(response.content, "pong");
    assert_eq!(response.id, "r1");
    assert_eq!(response.tokens_used, Some(3));
    assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    assert_eq!(client.in_flight(), 0);

    let request_text = server.await.unwrap();
    assert!(request_text.contains("Authorization: Bearer test-key"));
    assert!(request_text.contains(r#""role":"user""#));
}

#[tokio::test]
async fn context_becomes_leading_system_message() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 16384];
        let n = socket.read(&mut buf).await.unwrap();
        let request_text = String::from_utf8_lossy(&buf[..n]).into_owned();

        socket
            .write_all(http_response(200, "OK", PONG_BODY).as_bytes())
            .await
            .unwrap();
        request_text
    });

    let client = RequestClient::new(test_config(port, 5_000, 0));
    let request = Request::new("r1", "summarize").with_context("meeting notes");
    client.send_request(&request).await.unwrap();

    let request_text = server.await.unwrap();
    assert!(request_text.contains(r#""role":"system""#));
    assert!(request_text.contains("Context: meeting notes"));
    // system message must precede the user message
    let system_pos = request_text.find(r#""role":"system""#).unwrap();
    let user_pos = request_text.find(r#""role":"user""#).unwrap();
    assert!(system_pos < user_pos);
    // non-streaming requests must not ask for a stream
    assert!(!request_text.contains(r#""stream":true"#));
}

#[tokio::test]
async fn rate_limit_retries_then_succeeds() {
    let (listener, port) = mock_listener().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let server_calls = calls.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let call = server_calls.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;

            let response = if call == 0 {
                http_response(429, "Too Many Requests", r#"{"error":"slow down"}"#)
            } else {
                http_response(200, "OK", r#"{"choices":[{"message":{"content":"ok"}}]}"#)
            };
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });

    let client = RequestClient::new(test_config(port, 5_000, 2));
    let start = Instant::now();
    let response = client
        .send_request(&Request::new("r1", "ping"))
        .await
        .unwrap();

    assert_eq!(response.content, "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // exactly one backoff of 2^0 = 1s before the second attempt
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn auth_failure_never_retries() {
    let (listener, port) = mock_listener().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let server_calls = calls.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            server_calls.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(http_response(401, "Unauthorized", r#"{"error":"bad key"}"#).as_bytes())
                .await;
        }
    });

    let client = RequestClient::new(test_config(port, 5_000, 3));
    let err = client
        .send_request(&Request::new("r1", "ping"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Auth);
    assert!(!err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn server_errors_exhaust_retry_budget() {
    let (listener, port) = mock_listener().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let server_calls = calls.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            server_calls.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(http_response(500, "Internal Server Error", "oops").as_bytes())
                .await;
        }
    });

    // max_retries = 1 → exactly 2 attempts
    let client = RequestClient::new(test_config(port, 5_000, 1));
    let err = client
        .send_request(&Request::new("r1", "ping"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Api);
    assert!(err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn backoff_doubles_across_retries() {
    let (listener, port) = mock_listener().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let server_calls = calls.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            server_calls.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(http_response(502, "Bad Gateway", "upstream down").as_bytes())
                .await;
        }
    });

    // max_retries = 2 → 3 attempts, sleeping 1s then 2s between them
    let client = RequestClient::new(test_config(port, 5_000, 2));
    let start = Instant::now();
    let err = client
        .send_request(&Request::new("r1", "ping"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Api);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "backoffs too short: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "backoffs too long: {elapsed:?}");
}

#[tokio::test]
async fn stalled_server_classifies_as_timeout() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        // Never respond.
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let client = RequestClient::new(test_config(port, 500, 0));
    let start = Instant::now();
    let err = client
        .send_request(&Request::new("r1", "ping"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_retryable());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(client.in_flight(), 0);

    server.abort();
}

#[tokio::test]
async fn cancel_token_short_circuits_mid_flight() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let token = CancelToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    // Long timeout and retries available — cancellation must win anyway.
    let client = RequestClient::new(test_config(port, 30_000, 3));
    let request = Request::new("r1", "ping").with_cancel_token(token);
    let start = Instant::now();
    let err = client.send_request(&request).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(!err.is_retryable());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(client.in_flight(), 0);

    server.abort();
}

#[tokio::test]
async fn cancel_token_blocks_retry_of_retryable_failure() {
    let (listener, port) = mock_listener().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let server_calls = calls.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            server_calls.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(http_response(503, "Service Unavailable", "down").as_bytes())
                .await;
        }
    });

    // Token is already cancelled: the 503 is retryable, but the loop must
    // fail with cancelled before sleeping for the backoff.
    let token = CancelToken::new();
    token.cancel();

    let client = RequestClient::new(test_config(port, 5_000, 3));
    let request = Request::new("r1", "ping").with_cancel_token(token);
    let err = client.send_request(&request).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(calls.load(Ordering::SeqCst) <= 1);
}

#[tokio::test]
async fn cancel_request_aborts_by_id() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let client = Arc::new(RequestClient::new(test_config(port, 30_000, 0)));

    let sender = client.clone();
    let handle = tokio::spawn(async move { sender.send_request(&Request::new("r7", "ping")).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.in_flight(), 1);
    client.cancel_request("r7");

    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(client.in_flight(), 0);

    server.abort();
}

#[tokio::test]
async fn pre_cancelled_abort_handle_never_dials() {
    let (listener, port) = mock_listener().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let server_calls = calls.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            server_calls.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(http_response(200, "OK", PONG_BODY).as_bytes())
                .await;
        }
    });

    // The queue creates this handle at admission time; a cancel landing
    // before the send future is first polled must still win, without the
    // transport ever dialing out.
    let abort = CancellationToken::new();
    abort.cancel();

    let client = RequestClient::new(test_config(port, 5_000, 3));
    let err = client
        .send_request_with_abort(&Request::new("r1", "ping"), abort)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn cancel_request_unknown_id_is_noop() {
    let client = RequestClient::new(test_config(1, 1_000, 0));
    client.cancel_request("never-seen");
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_connection_reports_success_and_failure() {
    let (listener, port) = mock_listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        let _ = socket
            .write_all(http_response(200, "OK", PONG_BODY).as_bytes())
            .await;
    });

    let client = RequestClient::new(test_config(port, 5_000, 0));
    assert!(client.test_connection().await);

    // Nothing listens on the second port — must yield false, never error.
    let (listener, dead_port) = mock_listener().await;
    drop(listener);
    let client = RequestClient::new(test_config(dead_port, 5_000, 0));
    assert!(!client.test_connection().await);
}
