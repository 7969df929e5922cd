//! Agent engine: the conversation loop.
//!
//! `run` drives provider calls and tool execution for one session until the
//! model stops asking for tools; `summarize` replaces a session's history with
//! a single summary message. Both run in a background task and report through
//! [`AgentEvent`]s, published on the agent bus and mirrored on the stream the
//! call returns. At most one of them is in flight per session:
//!
//! - a second call while busy is rejected with [`AgentError::Busy`]
//! - the busy mark is cleared on every exit path before the final event
//! - cancellation is observed at every provider, permission and tool wait

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::compaction::summary_request_messages;
use crate::config::{AgentRole, Config};
use crate::llm_client::{GenerateRequest, LlmClient, ProviderError, ProviderEvent, ProviderResponse};
use crate::message::{ContentPart, Message, Role, ToolCall, ToolResultPart};
use crate::models::{Model, ModelRegistry};
use crate::permission::{CreatePermissionRequest, PermissionError, PermissionService};
use crate::prompts;
use crate::providers::ProviderClient;
use crate::pubsub::{Broker, EventKind, Subscription};
use crate::session::{Session, SessionStore};
use crate::tools::spec::{ApprovalRequirement, ToolContext, ToolError};
use crate::tools::ToolRegistry;

use super::events::{AgentError, AgentEvent, AgentEventKind};

/// Events of one `run` or `summarize` call, ending with `Done` or `Error`.
pub type AgentEventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

const PERMISSION_DENIED: &str = "Permission denied by the user; the tool did not run.";
const CANCELLED_RESULT: &str = "cancelled";

// === Types ===

/// Shared collaborators the engine mutates or reads.
#[derive(Clone)]
pub struct AgentServices {
    pub sessions: Arc<SessionStore>,
    pub permissions: PermissionService,
    pub tools: Arc<ToolRegistry>,
    pub events: Broker<AgentEvent>,
}

/// Model and client currently serving one role.
#[derive(Debug, Clone)]
struct ActiveModel {
    model: Model,
    client: ProviderClient,
    max_tokens: u32,
}

struct AgentInner {
    config: Config,
    workspace: PathBuf,
    max_steps: u32,
    services: AgentServices,
    coder: RwLock<ActiveModel>,
    summarizer: RwLock<ActiveModel>,
    /// Sessions with an execution in flight and their cancellation tokens.
    busy: Mutex<HashMap<String, CancellationToken>>,
    active_session: RwLock<Option<String>>,
}

/// Handle to the engine. Cloning is cheap.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

/// Clears the busy mark for a session when dropped.
struct BusyGuard {
    inner: Arc<AgentInner>,
    session_id: String,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        lock(&self.inner.busy).remove(&self.session_id);
    }
}

/// Sends events to both the bus and the caller's stream.
struct Emitter {
    bus: Broker<AgentEvent>,
    tx: mpsc::UnboundedSender<AgentEvent>,
    kind: AgentEventKind,
    session_id: String,
}

impl Emitter {
    fn emit(&self, event: AgentEvent) {
        // The caller may have dropped its stream; the bus still gets the event.
        let _ = self.tx.send(event.clone());
        self.bus.publish(EventKind::Created, event);
    }

    fn progress(&self, message_id: Option<&str>, text: impl Into<String>) {
        self.emit(AgentEvent::Progress {
            kind: self.kind,
            session_id: self.session_id.clone(),
            message_id: message_id.map(str::to_string),
            text: text.into(),
        });
    }

    fn finish(&self, result: Result<Message, AgentError>) {
        let event = match result {
            Ok(message) => AgentEvent::Done {
                kind: self.kind,
                session_id: self.session_id.clone(),
                message,
            },
            Err(error) => {
                if error.is_cancelled() {
                    tracing::info!(session = %self.session_id, kind = ?self.kind, "stopped");
                } else {
                    tracing::warn!(session = %self.session_id, kind = ?self.kind, error = %error, "agent call failed");
                }
                AgentEvent::Error {
                    kind: self.kind,
                    session_id: self.session_id.clone(),
                    error,
                }
            }
        };
        self.emit(event);
    }
}

// === Agent ===

impl Agent {
    /// Build the engine with the models configured for each role.
    pub fn new(config: &Config, services: AgentServices) -> Result<Self, AgentError> {
        let coder = active_model(config, AgentRole::Coder)?;
        let summarizer = active_model(config, AgentRole::Summarizer)?;
        Ok(Self {
            inner: Arc::new(AgentInner {
                workspace: config.working_dir(),
                max_steps: config.max_steps(),
                config: config.clone(),
                services,
                coder: RwLock::new(coder),
                summarizer: RwLock::new(summarizer),
                busy: Mutex::new(HashMap::new()),
                active_session: RwLock::new(None),
            }),
        })
    }

    /// Serve `role` with an already-built client, bypassing the model
    /// registry and provider settings.
    pub fn install_provider(&self, role: AgentRole, model: Model, client: ProviderClient) {
        let max_tokens = model.default_max_tokens;
        *write(self.inner.slot(role)) = ActiveModel {
            model,
            client,
            max_tokens,
        };
    }

    #[must_use]
    pub fn subscribe(&self) -> Subscription<AgentEvent> {
        self.inner.services.events.subscribe()
    }

    /// Close the agent bus; subscribers see end of stream.
    pub fn shutdown(&self) {
        self.inner.services.events.shutdown();
    }

    #[must_use]
    pub fn model(&self, role: AgentRole) -> Model {
        read(self.inner.slot(role)).model.clone()
    }

    #[must_use]
    pub fn max_steps(&self) -> u32 {
        self.inner.max_steps
    }

    /// True while any session has an execution in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        !lock(&self.inner.busy).is_empty()
    }

    #[must_use]
    pub fn is_session_busy(&self, session_id: &str) -> bool {
        lock(&self.inner.busy).contains_key(session_id)
    }

    /// Signal the in-flight call for `session_id`. Returns false if idle.
    pub fn cancel(&self, session_id: &str) -> bool {
        match lock(&self.inner.busy).get(session_id) {
            Some(token) => {
                tracing::debug!(session = %session_id, "cancelling agent call");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Send `content` as a user message and loop until the model answers
    /// without tool calls.
    pub fn run(
        &self,
        session_id: &str,
        content: impl Into<String>,
    ) -> Result<AgentEventStream, AgentError> {
        let (guard, cancel) = self.acquire(session_id)?;
        if self.inner.services.sessions.get(session_id).is_none() {
            return Err(AgentError::SessionNotFound(session_id.to_string()));
        }
        *write(&self.inner.active_session) = Some(session_id.to_string());

        let active = read(&self.inner.coder).clone();
        let content = content.into();
        let (emitter, stream) = self.emitter(AgentEventKind::Response, session_id);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.run_loop(&emitter, &active, content, &cancel).await;
            drop(guard);
            emitter.finish(result);
        });
        Ok(stream)
    }

    /// Replace the session's history with one summary message.
    pub fn summarize(&self, session_id: &str) -> Result<AgentEventStream, AgentError> {
        let (guard, cancel) = self.acquire(session_id)?;
        let history = self.inner.services.sessions.messages(session_id)?;
        if history.is_empty() {
            return Err(AgentError::NoMessages);
        }

        let active = read(&self.inner.summarizer).clone();
        let (emitter, stream) = self.emitter(AgentEventKind::Summarize, session_id);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner
                .summarize_history(&emitter, &active, history, &cancel)
                .await;
            drop(guard);
            emitter.finish(result);
        });
        Ok(stream)
    }

    /// Point `role` at another registered model.
    pub fn switch_model(&self, role: AgentRole, model_id: &str) -> Result<Model, AgentError> {
        // Holding the busy map keeps a run from starting mid-switch.
        let busy = lock(&self.inner.busy);
        if let Some(session_id) = busy.keys().next() {
            return Err(AgentError::Busy {
                session_id: session_id.clone(),
            });
        }
        let model = ModelRegistry::builtin()
            .get(model_id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownModel(model_id.to_string()))?;
        let client = ProviderClient::for_model(&model, &self.inner.config)?;
        let max_tokens = self
            .inner
            .config
            .agent(role)
            .max_tokens
            .unwrap_or(model.default_max_tokens);
        *write(self.inner.slot(role)) = ActiveModel {
            model: model.clone(),
            client,
            max_tokens,
        };
        drop(busy);
        tracing::info!(role = role.as_str(), model = %model.id, "switched model");
        Ok(model)
    }

    #[must_use]
    pub fn active_session(&self) -> Option<String> {
        read(&self.inner.active_session).clone()
    }

    /// Make `session_id` the active session, loading it if it is not cached.
    pub fn switch_session(&self, session_id: &str) -> Result<Session, AgentError> {
        let busy = lock(&self.inner.busy);
        if let Some(current) = read(&self.inner.active_session).as_deref()
            && busy.contains_key(current)
        {
            return Err(AgentError::Busy {
                session_id: current.to_string(),
            });
        }
        let sessions = &self.inner.services.sessions;
        let session = match sessions.get(session_id) {
            Some(session) => session,
            None => sessions.load(session_id)?,
        };
        *write(&self.inner.active_session) = Some(session.id.clone());
        Ok(session)
    }

    /// Mark `session_id` busy; fails if it already is.
    fn acquire(&self, session_id: &str) -> Result<(BusyGuard, CancellationToken), AgentError> {
        let mut busy = lock(&self.inner.busy);
        if busy.contains_key(session_id) {
            return Err(AgentError::Busy {
                session_id: session_id.to_string(),
            });
        }
        let token = CancellationToken::new();
        busy.insert(session_id.to_string(), token.clone());
        Ok((
            BusyGuard {
                inner: Arc::clone(&self.inner),
                session_id: session_id.to_string(),
            },
            token,
        ))
    }

    fn emitter(&self, kind: AgentEventKind, session_id: &str) -> (Emitter, AgentEventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = Emitter {
            bus: self.inner.services.events.clone(),
            tx,
            kind,
            session_id: session_id.to_string(),
        };
        (emitter, Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

fn active_model(config: &Config, role: AgentRole) -> Result<ActiveModel, AgentError> {
    let settings = config.agent(role);
    let model = ModelRegistry::builtin()
        .get(&settings.model)
        .cloned()
        .ok_or_else(|| AgentError::UnknownModel(settings.model.clone()))?;
    let client = ProviderClient::for_model(&model, config)?;
    Ok(ActiveModel {
        max_tokens: settings.max_tokens.unwrap_or(model.default_max_tokens),
        model,
        client,
    })
}

// === Loops ===

impl AgentInner {
    fn slot(&self, role: AgentRole) -> &RwLock<ActiveModel> {
        match role {
            AgentRole::Coder => &self.coder,
            AgentRole::Summarizer => &self.summarizer,
        }
    }

    async fn run_loop(
        &self,
        emitter: &Emitter,
        active: &ActiveModel,
        content: String,
        cancel: &CancellationToken,
    ) -> Result<Message, AgentError> {
        let session_id = emitter.session_id.as_str();
        let sessions = &self.services.sessions;
        sessions.append(session_id, Message::user(session_id, content))?;

        for step in 1..=self.max_steps {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            tracing::debug!(session = %session_id, step, model = %active.model.id, "provider call");

            let request = GenerateRequest {
                model: active.model.clone(),
                system_prompt: Some(prompts::system_prompt(AgentRole::Coder, &self.workspace)),
                messages: sessions.messages(session_id)?,
                tools: self.services.tools.definitions(),
                max_tokens: active.max_tokens,
            };
            let mut assistant = Message::new(session_id, Role::Assistant, Vec::new());
            let response = self
                .stream_response(emitter, &active.client, request, &assistant.id, cancel)
                .await?;

            assistant.parts = response_parts(&response);
            assistant.finalize(&active.model.id, response.usage);
            sessions.append(session_id, assistant.clone())?;

            if response.tool_calls.is_empty() {
                return Ok(assistant);
            }

            let results = self
                .execute_tool_calls(session_id, &response.tool_calls, cancel)
                .await;
            sessions.append(session_id, Message::tool_results(session_id, results))?;
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
        }
        Err(AgentError::MaxSteps(self.max_steps))
    }

    async fn stream_response(
        &self,
        emitter: &Emitter,
        client: &ProviderClient,
        request: GenerateRequest,
        message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse, AgentError> {
        let mut stream = client.stream(request, cancel.clone());
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AgentError::Cancelled),
                event = stream.next() => event,
            };
            match event {
                Some(ProviderEvent::ContentDelta(text)) => emitter.progress(Some(message_id), text),
                Some(ProviderEvent::ReasoningDelta(_)) => {}
                Some(ProviderEvent::ToolCallStarted { id, name }) => {
                    tracing::debug!(tool = %name, id = %id, "tool call started");
                }
                Some(ProviderEvent::Complete(response)) => return Ok(response),
                Some(ProviderEvent::Error(err)) => return Err(err.into()),
                None => {
                    return Err(AgentError::Provider(ProviderError::Protocol(
                        "stream ended before completion".to_string(),
                    )));
                }
            }
        }
    }

    /// Run every call of one turn in order; calls after a cancellation get a
    /// synthetic result so the history stays well-formed.
    async fn execute_tool_calls(
        &self,
        session_id: &str,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<ToolResultPart> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if cancel.is_cancelled() {
                results.push(ToolResultPart::error(call, CANCELLED_RESULT));
                continue;
            }
            results.push(self.execute_tool(session_id, call, cancel).await);
        }
        results
    }

    async fn execute_tool(
        &self,
        session_id: &str,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> ToolResultPart {
        let Some(tool) = self.services.tools.get(&call.name) else {
            let err = ToolError::not_available(format!("tool '{}' is not registered", call.name));
            return ToolResultPart::error(call, format_tool_error(&err, &call.name));
        };
        if let Err(err) = tool.validate(&call.input) {
            return ToolResultPart::error(call, format_tool_error(&err, &call.name));
        }

        if tool.approval_requirement() == ApprovalRequirement::Required {
            let request = CreatePermissionRequest {
                session_id: session_id.to_string(),
                tool_name: call.name.clone(),
                description: tool.describe(&call.input),
                action: "execute".to_string(),
                params: call.input.clone(),
                path: Some(self.workspace.clone()),
            };
            match self.services.permissions.request(request, cancel).await {
                Ok(decision) if decision.is_granted() => {}
                Ok(_) => {
                    tracing::info!(tool = %call.name, session = %session_id, "tool call denied");
                    return ToolResultPart::error(call, PERMISSION_DENIED);
                }
                Err(PermissionError::Cancelled) => {
                    return ToolResultPart::error(call, CANCELLED_RESULT);
                }
                Err(err) => return ToolResultPart::error(call, err.to_string()),
            }
        }

        let context =
            ToolContext::new(self.workspace.clone(), session_id).with_cancel(cancel.clone());
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ToolError::Cancelled),
            result = tool.execute(call.input.clone(), &context) => result,
        };
        match outcome {
            Ok(result) if result.success => ToolResultPart::success(call, result.content),
            Ok(result) => ToolResultPart::error(call, result.content),
            Err(ToolError::Cancelled) => ToolResultPart::error(call, CANCELLED_RESULT),
            Err(err) => {
                tracing::debug!(tool = %call.name, error = %err, "tool failed");
                ToolResultPart::error(call, format_tool_error(&err, &call.name))
            }
        }
    }

    async fn summarize_history(
        &self,
        emitter: &Emitter,
        active: &ActiveModel,
        history: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<Message, AgentError> {
        let session_id = emitter.session_id.as_str();
        emitter.progress(None, "Starting summarization...");

        let request = GenerateRequest {
            model: active.model.clone(),
            system_prompt: Some(prompts::system_prompt(
                AgentRole::Summarizer,
                &self.workspace,
            )),
            messages: summary_request_messages(session_id, &history),
            tools: Vec::new(),
            max_tokens: active.max_tokens,
        };
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AgentError::Cancelled),
            response = active.client.generate(request, cancel.clone()) => response?,
        };
        let text = response.content.trim();
        if text.is_empty() {
            return Err(AgentError::Provider(ProviderError::Protocol(
                "summary response was empty".to_string(),
            )));
        }
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        emitter.progress(None, "Replacing session history with summary...");
        let mut summary = Message::assistant_text(session_id, text);
        summary.finalize(&active.model.id, response.usage);
        self.services
            .sessions
            .replace_with_summary(session_id, summary.clone())?;
        Ok(summary)
    }
}

fn response_parts(response: &ProviderResponse) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    if let Some(reasoning) = response.reasoning.as_ref().filter(|r| !r.is_empty()) {
        parts.push(ContentPart::Reasoning {
            text: reasoning.clone(),
        });
    }
    if !response.content.is_empty() {
        parts.push(ContentPart::Text {
            text: response.content.clone(),
        });
    }
    parts.extend(response.tool_calls.iter().cloned().map(ContentPart::ToolCall));
    parts.push(ContentPart::Finish {
        reason: response.finish_reason,
    });
    parts
}

fn format_tool_error(err: &ToolError, tool_name: &str) -> String {
    match err {
        ToolError::InvalidInput { message } => {
            format!("Invalid input for tool '{tool_name}': {message}")
        }
        ToolError::MissingField { field } => {
            format!("Tool '{tool_name}' is missing required field '{field}'")
        }
        ToolError::PathEscape { path } => format!(
            "Path escapes workspace: {}. Use a workspace-relative path.",
            path.display()
        ),
        ToolError::ExecutionFailed { message } => message.clone(),
        ToolError::Timeout { millis } => format!(
            "Tool '{tool_name}' timed out after {millis}ms. Try a narrower scope or a longer timeout."
        ),
        ToolError::NotAvailable { message } => {
            format!("Tool '{tool_name}' is not available: {message}")
        }
        ToolError::Cancelled => CANCELLED_RESULT.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
