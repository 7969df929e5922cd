//! Events emitted by the agent engine.
//!
//! Published once per state transition on the agent bus and mirrored on the
//! per-call stream returned by `run` and `summarize`.

use thiserror::Error;

use crate::llm_client::ProviderError;
use crate::message::Message;
use crate::session::SessionError;

/// Which operation an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEventKind {
    Response,
    Summarize,
}

/// Errors surfaced by agent operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    /// Another run or summarize is already in flight.
    #[error("session {session_id} is busy")]
    Busy { session_id: String },
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session has no messages")]
    NoMessages,
    #[error(transparent)]
    Provider(ProviderError),
    #[error("stopped")]
    Cancelled,
    #[error("stopped after {0} steps without a final answer")]
    MaxSteps(u32),
    #[error(transparent)]
    Session(SessionError),
}

impl AgentError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<ProviderError> for AgentError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => Self::Cancelled,
            other => Self::Provider(other),
        }
    }
}

impl From<SessionError> for AgentError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => Self::SessionNotFound(id),
            other => Self::Session(other),
        }
    }
}

/// Agent progress, completion, or failure.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Incremental text. For responses `message_id` names the assistant
    /// message being produced; status updates leave it empty.
    Progress {
        kind: AgentEventKind,
        session_id: String,
        message_id: Option<String>,
        text: String,
    },
    /// Terminal success with the final assistant (or summary) message.
    Done {
        kind: AgentEventKind,
        session_id: String,
        message: Message,
    },
    /// Terminal failure; cancellation arrives here as [`AgentError::Cancelled`].
    Error {
        kind: AgentEventKind,
        session_id: String,
        error: AgentError,
    },
}

impl AgentEvent {
    #[must_use]
    pub fn kind(&self) -> AgentEventKind {
        match self {
            Self::Progress { kind, .. } | Self::Done { kind, .. } | Self::Error { kind, .. } => {
                *kind
            }
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Progress { session_id, .. }
            | Self::Done { session_id, .. }
            | Self::Error { session_id, .. } => session_id,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}
