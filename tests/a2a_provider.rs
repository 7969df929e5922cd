//! A2A JSON-RPC client against a local mock server.

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use codeloop::llm_client::{GenerateRequest, LlmClient, ProviderError};
use codeloop::message::Message;
use codeloop::models::{A2A_GENERIC, ModelRegistry};
use codeloop::providers::A2aClient;

fn request(text: &str) -> GenerateRequest {
    let model = ModelRegistry::builtin()
        .get(A2A_GENERIC)
        .cloned()
        .expect("a2a model registered");
    GenerateRequest {
        model,
        system_prompt: None,
        messages: vec![Message::user("session", text)],
        tools: Vec::new(),
        max_tokens: 256,
    }
}

fn rpc_result(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
}

async fn mount(server: &MockServer, rpc_method: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"jsonrpc": "2.0", "method": rpc_method})))
        .respond_with(response)
        .mount(server)
        .await;
}

fn client(server: &MockServer, poll_interval: Duration) -> A2aClient {
    A2aClient::new(server.uri(), poll_interval).expect("client")
}

#[tokio::test]
async fn completed_task_returns_first_artifact() {
    let server = MockServer::start().await;
    mount(&server, "task_create", rpc_result(json!("test-task-id"))).await;
    mount(
        &server,
        "task_get",
        rpc_result(json!({
            "status": "completed",
            "artifacts": [{"content": "Hello, world!"}]
        })),
    )
    .await;

    let response = client(&server, Duration::from_millis(20))
        .generate(request("say hello"), CancellationToken::new())
        .await
        .expect("generate");
    assert_eq!(response.content, "Hello, world!");
    assert!(response.tool_calls.is_empty());

    let received = server.received_requests().await.expect("recording enabled");
    let create: Value = serde_json::from_slice(&received[0].body).expect("json body");
    assert_eq!(create["method"], "task_create");
    assert_eq!(create["params"]["description"], "say hello");
    let get: Value = serde_json::from_slice(&received[1].body).expect("json body");
    assert_eq!(get["params"]["task_id"], "test-task-id");
}

#[tokio::test]
async fn pending_status_keeps_polling() {
    let server = MockServer::start().await;
    mount(&server, "task_create", rpc_result(json!("t-1"))).await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "task_get"})))
        .respond_with(rpc_result(json!({"status": "working"})))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    mount(
        &server,
        "task_get",
        rpc_result(json!({"status": "completed", "artifacts": [{"content": "done"}]})),
    )
    .await;

    let response = client(&server, Duration::from_millis(10))
        .generate(request("go"), CancellationToken::new())
        .await
        .expect("generate");
    assert_eq!(response.content, "done");
    assert_eq!(server.received_requests().await.expect("requests").len(), 4);
}

#[tokio::test]
async fn failed_task_is_a_backend_error() {
    let server = MockServer::start().await;
    mount(&server, "task_create", rpc_result(json!("t-2"))).await;
    mount(&server, "task_get", rpc_result(json!({"status": "failed"}))).await;

    let err = client(&server, Duration::from_millis(10))
        .generate(request("go"), CancellationToken::new())
        .await
        .expect_err("task failed");
    assert!(matches!(err, ProviderError::Backend { code: None, .. }), "{err:?}");
}

#[tokio::test]
async fn json_rpc_error_is_a_backend_error_with_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "Method not found"}
        })))
        .mount(&server)
        .await;

    let err = client(&server, Duration::from_millis(10))
        .generate(request("go"), CancellationToken::new())
        .await
        .expect_err("rpc error");
    assert_eq!(
        err,
        ProviderError::Backend {
            code: Some(-32601),
            message: "Method not found".to_string(),
        }
    );
}

#[tokio::test]
async fn malformed_bodies_are_protocol_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;
    let err = client(&server, Duration::from_millis(10))
        .generate(request("go"), CancellationToken::new())
        .await
        .expect_err("bad body");
    assert!(matches!(err, ProviderError::Protocol(_)), "{err:?}");

    let server = MockServer::start().await;
    mount(&server, "task_create", rpc_result(json!({"id": 7}))).await;
    let err = client(&server, Duration::from_millis(10))
        .generate(request("go"), CancellationToken::new())
        .await
        .expect_err("non-string task id");
    assert!(matches!(err, ProviderError::Protocol(_)), "{err:?}");
}

#[tokio::test]
async fn http_failure_is_a_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;
    let err = client(&server, Duration::from_millis(10))
        .generate(request("go"), CancellationToken::new())
        .await
        .expect_err("http 503");
    assert!(matches!(err, ProviderError::Transport(_)), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn empty_conversation_is_rejected_before_any_request() {
    let server = MockServer::start().await;
    let mut empty = request("unused");
    empty.messages.clear();
    let err = client(&server, Duration::from_millis(10))
        .generate(empty, CancellationToken::new())
        .await
        .expect_err("no messages");
    assert!(matches!(err, ProviderError::Configuration(_)), "{err:?}");
    assert!(server.received_requests().await.expect("requests").is_empty());
}

#[tokio::test]
async fn cancel_mid_poll_returns_within_one_interval() {
    let server = MockServer::start().await;
    mount(&server, "task_create", rpc_result(json!("slow-task"))).await;
    mount(&server, "task_get", rpc_result(json!({"status": "working"}))).await;

    let client = client(&server, Duration::from_secs(1));
    let cancel = CancellationToken::new();
    let call = tokio::spawn({
        let cancel = cancel.clone();
        async move { client.generate(request("go"), cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let started = Instant::now();
    cancel.cancel();
    let result = call.await.expect("join");
    assert!(started.elapsed() <= Duration::from_millis(1100));
    assert_eq!(result, Err(ProviderError::Cancelled));
}
