//! End-to-end agent runs through the public API.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use codeloop::app::spawn_auto_compaction;
use codeloop::compaction::CompactionConfig;
use codeloop::config::{AgentConfig, AgentRole, Config};
use codeloop::core::{AgentEventStream, AgentServices};
use codeloop::message::Role;
use codeloop::models::{A2A_GENERIC, MOCK_MODEL, Model, ModelRegistry};
use codeloop::permission::{PermissionRequest, PermissionService};
use codeloop::providers::{A2aClient, MockClient};
use codeloop::pubsub::{Broker, Subscription};
use codeloop::session::SessionStore;
use codeloop::tools::ToolRegistryBuilder;
use codeloop::{Agent, AgentError, AgentEvent, AgentEventKind};

struct Fixture {
    agent: Agent,
    sessions: Arc<SessionStore>,
    permissions: PermissionService,
    mock: MockClient,
    workspace: tempfile::TempDir,
}

fn config(workspace: &Path) -> Config {
    Config {
        working_dir: Some(workspace.display().to_string()),
        agents: HashMap::from([(
            AgentRole::Coder.as_str().to_string(),
            AgentConfig {
                model: Some(MOCK_MODEL.to_string()),
                max_tokens: None,
            },
        )]),
        ..Config::default()
    }
}

fn fixture(mock: MockClient) -> Fixture {
    let workspace = tempfile::tempdir().expect("tempdir");
    let sessions = Arc::new(SessionStore::new(Broker::new()));
    let permissions = PermissionService::new(Broker::new());
    let services = AgentServices {
        sessions: Arc::clone(&sessions),
        permissions: permissions.clone(),
        tools: Arc::new(ToolRegistryBuilder::new().with_agent_tools().build()),
        events: Broker::new(),
    };
    let agent = Agent::new(&config(workspace.path()), services).expect("agent");
    agent.install_provider(AgentRole::Coder, Model::mock(), mock.clone().into());
    agent.install_provider(AgentRole::Summarizer, Model::mock(), mock.clone().into());
    Fixture {
        agent,
        sessions,
        permissions,
        mock,
        workspace,
    }
}

async fn collect(stream: AgentEventStream) -> Vec<AgentEvent> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("agent call finished")
}

async fn next_request(requests: &mut Subscription<PermissionRequest>) -> PermissionRequest {
    tokio::time::timeout(Duration::from_secs(5), requests.recv())
        .await
        .expect("permission requested")
        .expect("permission bus open")
        .payload
}

fn done_count(events: &[AgentEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, AgentEvent::Done { .. }))
        .count()
}

#[tokio::test]
async fn simple_prompt_finishes_with_one_done_event() {
    let f = fixture(MockClient::new());
    f.mock.push_text("hello");
    let session = f.sessions.create("");
    let mut bus = f.agent.subscribe();

    let events = collect(f.agent.run(&session.id, "Hello").expect("run")).await;
    assert_eq!(done_count(&events), 1);
    let Some(AgentEvent::Done { kind, message, .. }) = events.last() else {
        panic!("expected done, got {events:?}");
    };
    assert_eq!(*kind, AgentEventKind::Response);
    assert_eq!(message.text(), "hello");
    assert!(!f.agent.is_busy());

    // The bus carries the same events as the returned stream.
    let mut published = Vec::new();
    while let Some(event) = bus.try_recv() {
        published.push(event.payload);
    }
    assert_eq!(published, events);
}

#[tokio::test]
async fn second_run_on_a_busy_session_is_rejected() {
    let f = fixture(MockClient::new().with_delay(Duration::from_secs(5)));
    let session = f.sessions.create("");

    let first = f.agent.run(&session.id, "slow").expect("first run");
    assert!(f.agent.is_session_busy(&session.id));
    match f.agent.run(&session.id, "again") {
        Err(AgentError::Busy { session_id }) => assert_eq!(session_id, session.id),
        Err(other) => panic!("expected busy, got {other:?}"),
        Ok(_) => panic!("second run was accepted"),
    }

    assert!(f.agent.cancel(&session.id));
    let events = collect(first).await;
    assert!(matches!(
        events.last(),
        Some(AgentEvent::Error {
            error: AgentError::Cancelled,
            ..
        })
    ));
    assert!(!f.agent.is_busy());
}

#[tokio::test]
async fn granted_write_runs_and_denied_write_does_not() {
    let f = fixture(MockClient::new());
    let mut requests = f.permissions.subscribe();
    let session = f.sessions.create("");

    f.mock
        .push_tool_call("w1", "write_file", json!({"path": "a.txt", "content": "one"}))
        .push_text("wrote a");
    let run = f.agent.run(&session.id, "write a").expect("run");
    let request = next_request(&mut requests).await;
    assert_eq!(request.tool_name, "write_file");
    assert_eq!(request.session_id, session.id);
    assert!(f.permissions.grant(&request.id));
    let events = collect(run).await;
    assert_eq!(done_count(&events), 1);
    assert_eq!(
        std::fs::read_to_string(f.workspace.path().join("a.txt")).expect("written"),
        "one"
    );

    f.mock
        .push_tool_call("w2", "write_file", json!({"path": "b.txt", "content": "two"}))
        .push_text("could not write b");
    let run = f.agent.run(&session.id, "write b").expect("run");
    let request = next_request(&mut requests).await;
    assert!(f.permissions.deny(&request.id));
    let events = collect(run).await;
    assert_eq!(done_count(&events), 1);
    assert!(!f.workspace.path().join("b.txt").exists());

    let messages = f.sessions.messages(&session.id).expect("messages");
    let denied = messages
        .iter()
        .filter(|message| message.role == Role::Tool)
        .flat_map(|message| message.tool_results_parts())
        .find(|result| result.tool_call_id == "w2")
        .expect("tool result for w2");
    assert!(denied.is_error);
    assert!(denied.content.contains("denied"));
}

#[tokio::test]
async fn session_grant_is_scoped_to_its_session() {
    let f = fixture(MockClient::new());
    let mut requests = f.permissions.subscribe();
    let first = f.sessions.create("");
    let second = f.sessions.create("");

    f.mock
        .push_tool_call("w1", "write_file", json!({"path": "one.txt", "content": "1"}))
        .push_tool_call("w2", "write_file", json!({"path": "two.txt", "content": "2"}))
        .push_text("both written");
    let run = f.agent.run(&first.id, "write twice").expect("run");
    let request = next_request(&mut requests).await;
    assert!(f.permissions.grant_for_session(&request.id));
    collect(run).await;
    assert!(requests.try_recv().is_none(), "second write prompted again");
    assert!(f.workspace.path().join("two.txt").exists());

    f.mock
        .push_tool_call("w3", "write_file", json!({"path": "three.txt", "content": "3"}))
        .push_text("not written");
    let run = f.agent.run(&second.id, "write elsewhere").expect("run");
    let request = next_request(&mut requests).await;
    assert_eq!(request.session_id, second.id);
    assert!(f.permissions.deny(&request.id));
    collect(run).await;
    assert!(!f.workspace.path().join("three.txt").exists());
    assert_eq!(f.permissions.pending_count(), 0);
}

#[tokio::test]
async fn summarize_collapses_history_and_keeps_token_totals() {
    let f = fixture(MockClient::new());
    let session = f.sessions.create("");
    for prompt in ["first question here", "second question here"] {
        collect(f.agent.run(&session.id, prompt).expect("run")).await;
    }
    let before = f.sessions.get(&session.id).expect("session");
    assert_eq!(before.message_count, 4);
    assert!(before.total_tokens() > 0);

    f.mock.push_text("We discussed two questions.");
    let events = collect(f.agent.summarize(&session.id).expect("summarize")).await;
    let Some(AgentEvent::Done { kind, .. }) = events.last() else {
        panic!("expected done, got {events:?}");
    };
    assert_eq!(*kind, AgentEventKind::Summarize);

    let after = f.sessions.get(&session.id).expect("session");
    assert_eq!(after.message_count, 1);
    assert_eq!(after.total_tokens(), before.total_tokens());
    assert_eq!(after.tokens_since_summary(), 0);
    let messages = f.sessions.messages(&session.id).expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text(), "We discussed two questions.");
}

#[tokio::test]
async fn auto_compaction_summarizes_a_full_session() {
    let f = fixture(MockClient::new());
    let mut small = Model::mock();
    small.context_window = 100;
    f.agent
        .install_provider(AgentRole::Coder, small, f.mock.clone().into());
    let mut bus = f.agent.subscribe();
    let watcher = spawn_auto_compaction(
        f.agent.clone(),
        Arc::clone(&f.sessions),
        CompactionConfig::default(),
    );

    let session = f.sessions.create("");
    let long_prompt = "lorem ipsum ".repeat(40);
    collect(f.agent.run(&session.id, long_prompt).expect("run")).await;

    let summarized = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = bus.recv().await {
            if let AgentEvent::Done {
                kind: AgentEventKind::Summarize,
                ..
            } = event.payload
            {
                return true;
            }
        }
        false
    })
    .await
    .expect("summary finished");
    assert!(summarized);
    assert_eq!(f.sessions.get(&session.id).expect("session").message_count, 1);

    f.agent.shutdown();
    tokio::time::timeout(Duration::from_secs(5), watcher)
        .await
        .expect("watcher stopped")
        .expect("watcher join");
}

#[tokio::test]
async fn cancelling_a_polling_provider_returns_within_one_interval() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "task_create"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"jsonrpc": "2.0", "id": 1, "result": "slow-task"}),
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "task_get"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"jsonrpc": "2.0", "id": 2, "result": {"status": "working"}}),
        ))
        .mount(&server)
        .await;

    let f = fixture(MockClient::new());
    let model = ModelRegistry::builtin()
        .get(A2A_GENERIC)
        .cloned()
        .expect("a2a model");
    let client = A2aClient::new(server.uri(), Duration::from_secs(1)).expect("client");
    f.agent
        .install_provider(AgentRole::Coder, model, client.into());
    let session = f.sessions.create("");

    let run = f.agent.run(&session.id, "take your time").expect("run");
    tokio::time::sleep(Duration::from_millis(300)).await;
    let started = Instant::now();
    assert!(f.agent.cancel(&session.id));
    let events = collect(run).await;

    assert!(started.elapsed() <= Duration::from_millis(1100));
    let Some(AgentEvent::Error { error, .. }) = events.last() else {
        panic!("expected cancellation, got {events:?}");
    };
    assert!(error.is_cancelled());
    assert!(!f.agent.is_busy());
}
