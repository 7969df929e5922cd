//! Application wiring: buses, stores, permission broker and engine.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::compaction::{CompactionConfig, should_auto_compact};
use crate::config::{AgentRole, Config};
use crate::core::{Agent, AgentError, AgentEvent, AgentEventKind, AgentEventStream, AgentServices};
use crate::logging::LogMessage;
use crate::permission::{PermissionRequest, PermissionService};
use crate::pubsub::Broker;
use crate::session::{JsonFileStore, Session, SessionStore};
use crate::tools::ToolRegistryBuilder;

/// Everything a front end talks to.
pub struct App {
    pub config: Config,
    pub logs: Broker<LogMessage>,
    pub sessions: Arc<SessionStore>,
    pub permissions: PermissionService,
    pub agent: Agent,
}

impl App {
    /// Build the application with sessions persisted under the data dir.
    pub fn new(config: Config, logs: Broker<LogMessage>) -> Result<Self> {
        let data_dir = config.data_dir();
        let sessions = Arc::new(
            SessionStore::new(Broker::<Session>::new())
                .with_persistence(Arc::new(JsonFileStore::new(&data_dir))),
        );
        let permissions = PermissionService::new(Broker::<PermissionRequest>::new());
        let services = AgentServices {
            sessions: Arc::clone(&sessions),
            permissions: permissions.clone(),
            tools: Arc::new(ToolRegistryBuilder::new().with_agent_tools().build()),
            events: Broker::new(),
        };
        let agent = Agent::new(&config, services).context("Failed to start agent")?;
        tracing::debug!(data_dir = %data_dir.display(), "application ready");
        Ok(Self {
            config,
            logs,
            sessions,
            permissions,
            agent,
        })
    }

    #[must_use]
    pub fn compaction(&self) -> CompactionConfig {
        CompactionConfig::enabled(self.config.auto_compact())
    }

    /// Close every bus so subscribers see end of stream.
    pub fn shutdown(&self) {
        self.agent.shutdown();
        self.logs.shutdown();
    }
}

/// Start a summary of `session_id` if its context is nearly full.
///
/// Returns `None` when no compaction is needed.
pub fn compact_if_needed(
    agent: &Agent,
    sessions: &SessionStore,
    session_id: &str,
    config: CompactionConfig,
) -> Option<Result<AgentEventStream, AgentError>> {
    let session = sessions.get(session_id)?;
    let messages = sessions.messages(session_id).ok()?;
    let model = agent.model(AgentRole::Coder);
    if !should_auto_compact(&session, &messages, &model, config) {
        return None;
    }
    tracing::info!(
        session = %session_id,
        tokens = session.tokens_since_summary(),
        window = model.context_window,
        "context nearly full, summarizing"
    );
    Some(agent.summarize(session_id))
}

/// Watch response completions and summarize sessions that approach the
/// context window. Ends when the agent bus closes.
pub fn spawn_auto_compaction(
    agent: Agent,
    sessions: Arc<SessionStore>,
    config: CompactionConfig,
) -> JoinHandle<()> {
    let mut events = agent.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let AgentEvent::Done {
                kind: AgentEventKind::Response,
                session_id,
                ..
            } = event.payload
            else {
                continue;
            };
            match compact_if_needed(&agent, &sessions, &session_id, config) {
                // Progress and completion are published on the agent bus.
                Some(Ok(_stream)) => {}
                Some(Err(err)) => {
                    tracing::warn!(session = %session_id, error = %err, "auto compaction skipped");
                }
                None => {}
            }
        }
    })
}
