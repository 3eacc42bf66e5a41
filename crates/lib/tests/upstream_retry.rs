//! Integration tests for the upstream client's retry loop against a stub
//! prediction server that fails a configurable number of times.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lib::config::UpstreamConfig;
use lib::upstream::{ProxyError, UpstreamClient};

#[derive(Clone)]
struct StubState {
    calls: Arc<AtomicUsize>,
    fail_first: usize,
    text_field: bool,
}

async fn prediction(State(state): State<StubState>) -> axum::response::Response {
    let n = state.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if n <= state.fail_first {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    if state.text_field {
        Json(serde_json::json!({"text": format!("reply {n}")})).into_response()
    } else {
        Json(serde_json::json!({"answer": "hi"})).into_response()
    }
}

/// Start a stub upstream; returns its base URL and the call counter.
async fn spawn_upstream(fail_first: usize, text_field: bool) -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/api/v1/prediction/:flow", post(prediction))
        .route("/api/v1/health", get(|| async { StatusCode::OK }))
        .with_state(StubState {
            calls: calls.clone(),
            fail_first,
            text_field,
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub upstream");
    let base = format!("http://{}", listener.local_addr().expect("local_addr"));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (base, calls)
}

fn client(base_url: &str, max_retries: u32) -> UpstreamClient {
    let config = UpstreamConfig {
        base_url: base_url.to_string(),
        flow_id: "flow-1".to_string(),
        timeout_secs: 5,
        max_retries,
        retry_delay_ms: 10,
    };
    UpstreamClient::new(&config).expect("build client")
}

#[tokio::test]
async fn succeeds_on_third_attempt_after_two_failures() {
    let (base, calls) = spawn_upstream(2, true).await;
    let reply = client(&base, 3)
        .forward("hello", "sess-1")
        .await
        .expect("third attempt succeeds");
    assert_eq!(reply, "reply 3");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausts_after_exactly_max_retries() {
    let (base, calls) = spawn_upstream(usize::MAX, true).await;
    let err = client(&base, 3)
        .forward("hello", "sess-1")
        .await
        .expect_err("always-failing upstream");
    match err {
        ProxyError::UpstreamUnavailable { attempts, reason } => {
            assert_eq!(attempts, 3);
            assert!(reason.contains("500"), "reason was: {reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn body_without_text_field_degrades_to_string_form() {
    let (base, _calls) = spawn_upstream(0, false).await;
    let reply = client(&base, 3).forward("hello", "sess-1").await.unwrap();
    assert_eq!(reply, r#"{"answer":"hi"}"#);
}

#[tokio::test]
async fn unreachable_upstream_reports_transport_failure() {
    // Port from a listener that is immediately dropped: nothing is there.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").expect("probe port");
        l.local_addr().expect("local_addr").port()
    };
    let err = client(&format!("http://127.0.0.1:{port}"), 3)
        .forward("hello", "sess-1")
        .await
        .expect_err("nothing listening");
    assert!(matches!(err, ProxyError::UpstreamUnavailable { attempts: 3, .. }));
}

#[tokio::test]
async fn all_attempts_timing_out_reports_timeout() {
    // Stub that never answers within the client's request timeout.
    let app = Router::new().route(
        "/api/v1/prediction/:flow",
        post(|| async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Json(serde_json::json!({"text": "too late"}))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub upstream");
    let base = format!("http://{}", listener.local_addr().expect("local_addr"));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let config = UpstreamConfig {
        base_url: base,
        flow_id: "flow-1".to_string(),
        timeout_secs: 1,
        max_retries: 3,
        retry_delay_ms: 10,
    };
    let err = UpstreamClient::new(&config)
        .expect("build client")
        .forward("hello", "sess-1")
        .await
        .expect_err("every attempt times out");
    assert!(matches!(err, ProxyError::Timeout), "got: {err}");
}

#[tokio::test]
async fn health_probe_reflects_liveness() {
    let (base, _calls) = spawn_upstream(0, true).await;
    assert!(client(&base, 3).health().await);

    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").expect("probe port");
        l.local_addr().expect("local_addr").port()
    };
    assert!(!client(&format!("http://127.0.0.1:{port}"), 3).health().await);
}
