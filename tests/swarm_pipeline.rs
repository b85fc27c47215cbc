//! End-to-end decompose/execute pipeline against a scripted mock provider:
//! level ordering, context propagation, transient retry, dependency
//! cascade, and synthesis.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::json;

use swarmcore::{Core, CoreConfig, CoreError, ExecuteOptions, TaskStatus};

fn set_test_env() {
    unsafe {
        std::env::set_var("SKIP_SMOKE_TEST", "1");
        std::env::set_var("ANTHROPIC_API_KEY", "test-key");
    }
}

/// Render a complete Messages API SSE stream for one text reply.
fn sse_reply(text: &str) -> String {
    let mut out = String::new();
    let start = json!({"type": "message_start", "message": {"usage": {"input_tokens": 8}}});
    out.push_str(&format!("event: message_start\ndata: {}\n\n", start));
    let delta = json!({
        "type": "content_block_delta",
        "index": 0,
        "delta": {"type": "text_delta", "text": text},
    });
    out.push_str(&format!("event: content_block_delta\ndata: {}\n\n", delta));
    let usage = json!({"type": "message_delta", "usage": {"output_tokens": 4}});
    out.push_str(&format!("event: message_delta\ndata: {}\n\n", usage));
    out.push_str("event: message_stop\ndata: {\"type\": \"message_stop\"}\n\n");
    out
}

enum Scripted {
    Sse(String),
    Status(u16, &'static str),
}

struct Script {
    responses: Vec<Scripted>,
    calls: AtomicUsize,
    bodies: Mutex<Vec<String>>,
}

async fn scripted_handler(State(script): State<Arc<Script>>, body: String) -> Response {
    let idx = script.calls.fetch_add(1, Ordering::SeqCst);
    script.bodies.lock().unwrap().push(body);
    match script.responses.get(idx) {
        Some(Scripted::Sse(text)) => (
            [(header::CONTENT_TYPE, "text/event-stream")],
            text.clone(),
        )
            .into_response(),
        Some(Scripted::Status(code, msg)) => (
            StatusCode::from_u16(*code).unwrap(),
            msg.to_string(),
        )
            .into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "script exhausted").into_response(),
    }
}

async fn spawn_scripted(responses: Vec<Scripted>) -> (String, Arc<Script>) {
    let script = Arc::new(Script {
        responses,
        calls: AtomicUsize::new(0),
        bodies: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/v1/messages", post(scripted_handler))
        .with_state(script.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    (format!("http://{}", addr), script)
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

fn decomposition_reply() -> String {
    let plan = json!([
        {"description": "Research topic"},
        {"description": "Write summary", "depends_on": [0]},
    ]);
    sse_reply(&plan.to_string())
}

fn fast_opts() -> ExecuteOptions {
    ExecuteOptions {
        caller: Some("pipeline-test".to_string()),
        retry_base_delay_ms: 10,
        ..ExecuteOptions::default()
    }
}

#[tokio::test]
async fn pipeline_retries_transient_errors_and_synthesizes() {
    set_test_env();
    let (base, script) = spawn_scripted(vec![
        Scripted::Sse(decomposition_reply()),
        Scripted::Status(429, "rate limit exceeded"),
        Scripted::Status(429, "rate limit exceeded"),
        Scripted::Sse(sse_reply("R0")),
        Scripted::Sse(sse_reply("R1")),
        Scripted::Sse(sse_reply("SYNTH")),
    ])
    .await;
    let tmp = tempfile::tempdir().unwrap();
    let core = core_against(&base, &tmp).await;

    let report = core
        .execute_decomposed("research and summarize", &fast_opts())
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(report.results, vec![Some("R0".to_string()), Some("R1".to_string())]);
    assert!(report.errors.iter().all(Option::is_none));
    assert_eq!(report.synthesis.as_deref(), Some("SYNTH"));
    // 1 decompose + 3 attempts for subtask 0 + 1 for subtask 1 + 1 synthesis.
    assert_eq!(script.calls.load(Ordering::SeqCst), 6);

    // Dependency context flowed into the second subtask's prompt.
    let bodies = script.bodies.lock().unwrap();
    assert!(bodies[4].contains("Research topic"));
    assert!(bodies[4].contains("R0"));
    assert!(bodies[4].contains("Now: Write summary"));
    // Synthesis saw the labeled results.
    assert!(bodies[5].contains("Synthesize the following subtask results"));
    assert!(bodies[5].contains("[Research topic]: R0"));
    assert!(bodies[5].contains("[Write summary]: R1"));
    drop(bodies);

    let tasks = core.get_swarm_results(&report.swarm_id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Done));
    assert_eq!(tasks[0].result.as_deref(), Some("R0"));
    assert_eq!(tasks[0].agent_id.as_deref(), Some("decomposer-0"));
    assert_eq!(tasks[1].agent_id.as_deref(), Some("decomposer-1"));
    core.shutdown().await;
}

#[tokio::test]
async fn non_transient_failure_cascades_to_dependents() {
    set_test_env();
    let (base, script) = spawn_scripted(vec![
        Scripted::Sse(decomposition_reply()),
        Scripted::Status(401, "unauthorized"),
    ])
    .await;
    let tmp = tempfile::tempdir().unwrap();
    let core = core_against(&base, &tmp).await;

    let report = core
        .execute_decomposed("research and summarize", &fast_opts())
        .await
        .unwrap();

    assert!(!report.success);
    assert!(report.errors[0].as_deref().unwrap().contains("401"));
    assert_eq!(
        report.errors[1].as_deref(),
        Some("Dependency subtask 0 failed")
    );
    assert!(report.synthesis.is_none());
    // No retry for a non-transient error, no call for the dependent.
    assert_eq!(script.calls.load(Ordering::SeqCst), 2);

    let tasks = core.get_swarm_results(&report.swarm_id).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Failed));
    assert!(
        tasks[1]
            .error
            .as_deref()
            .unwrap()
            .contains("Dependency subtask 0 failed")
    );
    core.shutdown().await;
}

#[tokio::test]
async fn unparseable_plan_is_a_decomposition_error() {
    set_test_env();
    let (base, _script) = spawn_scripted(vec![Scripted::Sse(sse_reply(
        "I cannot break this down, sorry.",
    ))])
    .await;
    let tmp = tempfile::tempdir().unwrap();
    let core = core_against(&base, &tmp).await;

    let err = core
        .execute_decomposed("impossible", &fast_opts())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Decomposition(_)));
    core.shutdown().await;
}

#[tokio::test]
async fn synthesis_failure_falls_back_to_raw_results() {
    set_test_env();
    let (base, _script) = spawn_scripted(vec![
        Scripted::Sse(decomposition_reply()),
        Scripted::Sse(sse_reply("R0")),
        Scripted::Sse(sse_reply("R1")),
        Scripted::Status(500, "synthesis exploded"),
    ])
    .await;
    let tmp = tempfile::tempdir().unwrap();
    let core = core_against(&base, &tmp).await;

    let report = core
        .execute_decomposed("research and summarize", &fast_opts())
        .await
        .unwrap();
    assert!(report.success);
    let synthesis = report.synthesis.unwrap();
    assert!(synthesis.contains("[Research topic]: R0"));
    assert!(synthesis.contains("[Write summary]: R1"));
    core.shutdown().await;
}

#[tokio::test]
async fn custom_synthesis_template_is_substituted() {
    set_test_env();
    let (base, script) = spawn_scripted(vec![
        Scripted::Sse(decomposition_reply()),
        Scripted::Sse(sse_reply("R0")),
        Scripted::Sse(sse_reply("R1")),
        Scripted::Sse(sse_reply("custom out")),
    ])
    .await;
    let tmp = tempfile::tempdir().unwrap();
    let core = core_against(&base, &tmp).await;

    let opts = ExecuteOptions {
        synthesis_prompt: Some("Condense into one line:\n{{results}}".to_string()),
        ..fast_opts()
    };
    let report = core
        .execute_decomposed("research and summarize", &opts)
        .await
        .unwrap();
    assert_eq!(report.synthesis.as_deref(), Some("custom out"));
    let bodies = script.bodies.lock().unwrap();
    assert!(bodies[3].contains("Condense into one line:"));
    assert!(bodies[3].contains("[Research topic]: R0"));
    core.shutdown().await;
}
