//! Router behavior against a mock Anthropic streaming endpoint: alias
//! resolution, provider detection, timeouts, error mapping, and call-log
//! rows.
//!
//! Every test in this binary disables the provider smoke test and supplies a
//! fake API key through the environment.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use serde_json::json;

use swarmcore::{Core, CoreConfig, CoreError, Provider, RunOptions};

fn set_test_env() {
    // Process-wide, same values in every test of this binary.
    unsafe {
        std::env::set_var("SKIP_SMOKE_TEST", "1");
        std::env::set_var("ANTHROPIC_API_KEY", "test-key");
    }
}

/// Render a complete Messages API SSE stream for one text reply.
fn sse_reply(text: &str, input_tokens: i64, output_tokens: i64) -> String {
    let mut out = String::new();
    let start = json!({"type": "message_start", "message": {"usage": {"input_tokens": input_tokens}}});
    out.push_str(&format!("event: message_start\ndata: {}\n\n", start));
    for chunk in text.as_bytes().chunks(7) {
        let delta = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": String::from_utf8_lossy(chunk)},
        });
        out.push_str(&format!("event: content_block_delta\ndata: {}\n\n", delta));
    }
    let delta = json!({"type": "message_delta", "usage": {"output_tokens": output_tokens}});
    out.push_str(&format!("event: message_delta\ndata: {}\n\n", delta));
    out.push_str("event: message_stop\ndata: {\"type\": \"message_stop\"}\n\n");
    out
}

struct MessagesServer {
    calls: AtomicUsize,
}

async fn spawn_messages_server(reply: &'static str) -> (String, Arc<MessagesServer>) {
    let state = Arc::new(MessagesServer {
        calls: AtomicUsize::new(0),
    });
    let app = Router::new()
        .route(
            "/v1/messages",
            post(move |State(state): State<Arc<MessagesServer>>| async move {
                state.calls.fetch_add(1, Ordering::SeqCst);
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    sse_reply(reply, 12, 5),
                )
            }),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    (format!("http://{}", addr), state)
}

async fn core_against(base: &str, tmp: &tempfile::TempDir) -> Core {
    Core::init(CoreConfig {
        data_dir: tmp.path().join("data"),
        auth_path: tmp.path().join("auth.json"),
        anthropic_base_url: base.to_string(),
        ..CoreConfig::default()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn prefixed_alias_routes_to_anthropic() {
    set_test_env();
    let (base, _state) = spawn_messages_server("Hello there").await;
    let tmp = tempfile::tempdir().unwrap();
    let core = core_against(&base, &tmp).await;

    let response = core
        .run_llm(
            "hi",
            RunOptions {
                model: Some("anthropic/claude-sonnet-4".to_string()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.provider, Provider::Anthropic);
    assert_eq!(response.model, "claude-sonnet-4-5");
    assert_eq!(response.text, "Hello there");
    assert_eq!(response.input_tokens, 12);
    assert_eq!(response.output_tokens, 5);
    core.shutdown().await;
}

#[tokio::test]
async fn successful_calls_are_logged_with_cost() {
    set_test_env();
    let (base, _state) = spawn_messages_server("logged reply").await;
    let tmp = tempfile::tempdir().unwrap();
    let core = core_against(&base, &tmp).await;

    core.run_llm(
        "log me",
        RunOptions {
            model: Some("sonnet-4".to_string()),
            caller: Some("router-test".to_string()),
            ..RunOptions::default()
        },
    )
    .await
    .unwrap();
    core.shutdown().await;

    let conn = core.calllog_db();
    let conn = conn.lock().await;
    let (provider, model, caller, ok, cost): (String, String, String, i64, f64) = conn
        .query_row(
            "SELECT provider, model, caller, ok, cost_estimate FROM llm_calls",
            [],
            |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            },
        )
        .unwrap();
    assert_eq!(provider, "anthropic");
    assert_eq!(model, "claude-sonnet-4-5");
    assert_eq!(caller, "router-test");
    assert_eq!(ok, 1);
    assert!(cost > 0.0);
}

#[tokio::test]
async fn skip_log_leaves_no_row() {
    set_test_env();
    let (base, _state) = spawn_messages_server("quiet").await;
    let tmp = tempfile::tempdir().unwrap();
    let core = core_against(&base, &tmp).await;

    core.run_llm(
        "psst",
        RunOptions {
            model: Some("haiku-4".to_string()),
            skip_log: true,
            ..RunOptions::default()
        },
    )
    .await
    .unwrap();
    core.shutdown().await;

    let conn = core.calllog_db();
    let conn = conn.lock().await;
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM llm_calls", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn slow_provider_times_out_and_is_logged() {
    set_test_env();
    let app = Router::new().route(
        "/v1/messages",
        post(|| async {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                sse_reply("too late", 1, 1),
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let tmp = tempfile::tempdir().unwrap();
    let core = core_against(&format!("http://{}", addr), &tmp).await;
    let err = core
        .run_llm(
            "hurry",
            RunOptions {
                model: Some("claude-haiku-4-5".to_string()),
                timeout_ms: Some(50),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout(50)));
    core.shutdown().await;

    let conn = core.calllog_db();
    let conn = conn.lock().await;
    let (ok, error): (i64, Option<String>) = conn
        .query_row("SELECT ok, error FROM llm_calls", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(ok, 0);
    assert!(error.unwrap().contains("timeout"));
}

#[tokio::test]
async fn provider_http_error_carries_status_and_snippet() {
    set_test_env();
    let app = Router::new().route(
        "/v1/messages",
        post(|| async {
            (StatusCode::UNAUTHORIZED, json!({"error": "bad key"}).to_string()).into_response()
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let tmp = tempfile::tempdir().unwrap();
    let core = core_against(&format!("http://{}", addr), &tmp).await;
    let err = core
        .run_llm(
            "hi",
            RunOptions {
                model: Some("claude-haiku-4-5".to_string()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        CoreError::ProviderHttp { status, body } => {
            assert_eq!(status, 401);
            assert!(body.contains("bad key"));
        }
        other => panic!("expected ProviderHttp, got {:?}", other),
    }
    core.shutdown().await;
}

#[tokio::test]
async fn unknown_model_never_reaches_a_provider() {
    set_test_env();
    let (base, state) = spawn_messages_server("unused").await;
    let tmp = tempfile::tempdir().unwrap();
    let core = core_against(&base, &tmp).await;

    let err = core
        .run_llm(
            "hi",
            RunOptions {
                model: Some("mistral-large".to_string()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UnknownProvider(_)));
    assert_eq!(state.calls.load(Ordering::SeqCst), 0);
    core.shutdown().await;
}

#[tokio::test]
async fn routed_llm_attaches_the_resolved_model() {
    set_test_env();
    let (base, _state) = spawn_messages_server("routed").await;
    let tmp = tempfile::tempdir().unwrap();
    let core = core_against(&base, &tmp).await;

    let response = core
        .routed_llm(
            "hi",
            swarmcore::RoutedOptions {
                strategy: Some(swarmcore::Strategy::Best),
                ..swarmcore::RoutedOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.resolved_model.as_deref(), Some("claude-opus-4-5"));
    assert_eq!(response.text, "routed");
    core.shutdown().await;
}
