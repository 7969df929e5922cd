//! Shared error taxonomy across providers, tools, permissions and the engine.
//!
//! Consumers convert any error into an [`ErrorEnvelope`] and render it with
//! [`ErrorEnvelope::status_line`]; cancellation renders as a neutral
//! "stopped" rather than an error banner.

use crate::core::events::AgentError;
use crate::llm_client::ProviderError;
use crate::permission::PermissionError;
use crate::session::SessionError;
use crate::tools::spec::ToolError;

/// Broad category for typed error handling and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Authorization,
    Timeout,
    InvalidInput,
    Parse,
    Backend,
    Tool,
    State,
    Cancelled,
    Internal,
}

/// Severity hint for UI and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Unified envelope used when crossing subsystem boundaries.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        recoverable: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            recoverable,
            code: code.into(),
            message: message.into(),
        }
    }

    fn stopped(code: &str) -> Self {
        Self::new(
            ErrorCategory::Cancelled,
            ErrorSeverity::Info,
            true,
            code,
            "stopped",
        )
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.category == ErrorCategory::Cancelled
    }

    /// One-line status text for a footer or stderr.
    #[must_use]
    pub fn status_line(&self) -> String {
        match self.severity {
            ErrorSeverity::Info => self.message.clone(),
            ErrorSeverity::Warning => format!("warning: {}", self.message),
            ErrorSeverity::Error | ErrorSeverity::Critical => {
                format!("error [{}]: {}", self.code, self.message)
            }
        }
    }
}

impl From<ProviderError> for ErrorEnvelope {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::Transport(message) => Self::new(
                ErrorCategory::Network,
                ErrorSeverity::Error,
                true,
                "provider_transport",
                message,
            ),
            ProviderError::Protocol(message) => Self::new(
                ErrorCategory::Parse,
                ErrorSeverity::Error,
                false,
                "provider_protocol",
                message,
            ),
            ProviderError::Backend { code, message } => Self::new(
                ErrorCategory::Backend,
                ErrorSeverity::Error,
                false,
                code.map_or_else(
                    || "provider_backend".to_string(),
                    |code| format!("provider_backend_{code}"),
                ),
                message,
            ),
            ProviderError::Cancelled => Self::stopped("provider_cancelled"),
            ProviderError::Configuration(message) => Self::new(
                ErrorCategory::InvalidInput,
                ErrorSeverity::Critical,
                false,
                "provider_configuration",
                message,
            ),
        }
    }
}

impl From<ToolError> for ErrorEnvelope {
    fn from(value: ToolError) -> Self {
        match value {
            ToolError::InvalidInput { message } => Self::new(
                ErrorCategory::InvalidInput,
                ErrorSeverity::Error,
                false,
                "tool_invalid_input",
                message,
            ),
            ToolError::MissingField { field } => Self::new(
                ErrorCategory::InvalidInput,
                ErrorSeverity::Error,
                false,
                "tool_missing_field",
                format!("Missing required field: {field}"),
            ),
            ToolError::PathEscape { path } => Self::new(
                ErrorCategory::Authorization,
                ErrorSeverity::Error,
                false,
                "tool_path_escape",
                format!("Path escapes workspace: {}", path.display()),
            ),
            ToolError::ExecutionFailed { message } => Self::new(
                ErrorCategory::Tool,
                ErrorSeverity::Error,
                true,
                "tool_execution_failed",
                message,
            ),
            ToolError::Timeout { millis } => Self::new(
                ErrorCategory::Timeout,
                ErrorSeverity::Warning,
                true,
                "tool_timeout",
                format!("Tool timed out after {millis}ms"),
            ),
            ToolError::NotAvailable { message } => Self::new(
                ErrorCategory::State,
                ErrorSeverity::Error,
                false,
                "tool_not_available",
                message,
            ),
            ToolError::Cancelled => Self::stopped("tool_cancelled"),
        }
    }
}

impl From<PermissionError> for ErrorEnvelope {
    fn from(value: PermissionError) -> Self {
        match value {
            PermissionError::Cancelled => Self::stopped("permission_cancelled"),
            PermissionError::Closed => Self::new(
                ErrorCategory::State,
                ErrorSeverity::Warning,
                true,
                "permission_closed",
                value.to_string(),
            ),
        }
    }
}

impl From<SessionError> for ErrorEnvelope {
    fn from(value: SessionError) -> Self {
        match value {
            SessionError::NotFound(id) => Self::new(
                ErrorCategory::State,
                ErrorSeverity::Error,
                false,
                "session_not_found",
                format!("Session not found: {id}"),
            ),
            SessionError::Persistence(message) => Self::new(
                ErrorCategory::Internal,
                ErrorSeverity::Warning,
                true,
                "session_persistence",
                message,
            ),
        }
    }
}

impl From<AgentError> for ErrorEnvelope {
    fn from(value: AgentError) -> Self {
        match value {
            AgentError::Busy { session_id } => Self::new(
                ErrorCategory::State,
                ErrorSeverity::Warning,
                true,
                "agent_busy",
                format!("Session {session_id} is busy; wait or cancel first"),
            ),
            AgentError::UnknownModel(model) => Self::new(
                ErrorCategory::InvalidInput,
                ErrorSeverity::Error,
                false,
                "agent_unknown_model",
                format!("Unknown model: {model}"),
            ),
            AgentError::SessionNotFound(id) => SessionError::NotFound(id).into(),
            AgentError::NoMessages => Self::new(
                ErrorCategory::State,
                ErrorSeverity::Warning,
                true,
                "agent_no_messages",
                "Nothing to summarize yet",
            ),
            AgentError::Provider(err) => err.into(),
            AgentError::Cancelled => Self::stopped("agent_cancelled"),
            AgentError::MaxSteps(steps) => Self::new(
                ErrorCategory::State,
                ErrorSeverity::Warning,
                true,
                "agent_max_steps",
                format!("Stopped after {steps} steps without a final answer"),
            ),
            AgentError::Session(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cancellation_renders_as_stopped_from_every_layer() {
        let envelopes: Vec<ErrorEnvelope> = vec![
            ProviderError::Cancelled.into(),
            ToolError::Cancelled.into(),
            PermissionError::Cancelled.into(),
            AgentError::Cancelled.into(),
        ];
        for envelope in envelopes {
            assert!(envelope.is_cancelled());
            assert_eq!(envelope.severity, ErrorSeverity::Info);
            assert_eq!(envelope.status_line(), "stopped");
        }
    }

    #[test]
    fn provider_error_kinds_stay_distinct() {
        let transport: ErrorEnvelope = ProviderError::Transport("reset".to_string()).into();
        let protocol: ErrorEnvelope = ProviderError::Protocol("bad json".to_string()).into();
        let backend: ErrorEnvelope = ProviderError::Backend {
            code: Some(-32000),
            message: "task failed".to_string(),
        }
        .into();

        assert_eq!(transport.category, ErrorCategory::Network);
        assert!(transport.recoverable);
        assert_eq!(protocol.category, ErrorCategory::Parse);
        assert!(!protocol.recoverable);
        assert_eq!(backend.category, ErrorCategory::Backend);
        assert_eq!(backend.code, "provider_backend_-32000");
        assert_eq!(
            backend.status_line(),
            "error [provider_backend_-32000]: task failed"
        );
    }

    #[test]
    fn agent_errors_unwrap_their_sources() {
        let envelope: ErrorEnvelope =
            AgentError::Provider(ProviderError::Transport("down".to_string())).into();
        assert_eq!(envelope.code, "provider_transport");

        let busy: ErrorEnvelope = AgentError::Busy {
            session_id: "s1".to_string(),
        }
        .into();
        assert_eq!(busy.severity, ErrorSeverity::Warning);
        assert_eq!(
            busy.status_line(),
            "warning: Session s1 is busy; wait or cancel first"
        );
    }
}
