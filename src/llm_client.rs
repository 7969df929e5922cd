//! Provider capability contract shared by every backend family.
//!
//! A provider turns a conversation into either one complete response
//! (`generate`) or a stream of deltas (`stream`). Every call takes a
//! cancellation token and must return [`ProviderError::Cancelled`] promptly
//! once it fires.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::{FinishReason, Message, TokenUsage, ToolCall};
use crate::models::Model;
use crate::poll::PollCancelled;

/// Coarse error class used for retry and rendering decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Transport,
    Protocol,
    Backend,
    Cancelled,
    Configuration,
}

/// Errors surfaced by provider clients.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// Network or HTTP-level failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The backend answered with a shape we do not understand.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The backend explicitly reported a failure.
    #[error("backend error{}: {message}", code.map(|c| format!(" ({c})")).unwrap_or_default())]
    Backend { code: Option<i64>, message: String },
    #[error("request cancelled")]
    Cancelled,
    #[error("provider configuration error: {0}")]
    Configuration(String),
}

impl ProviderError {
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            code: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::Transport(_) => ProviderErrorKind::Transport,
            Self::Protocol(_) => ProviderErrorKind::Protocol,
            Self::Backend { .. } => ProviderErrorKind::Backend,
            Self::Cancelled => ProviderErrorKind::Cancelled,
            Self::Configuration(_) => ProviderErrorKind::Configuration,
        }
    }

    /// Only transport failures are worth retrying; the core never retries on
    /// its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<PollCancelled> for ProviderError {
    fn from(_: PollCancelled) -> Self {
        Self::Cancelled
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Tool definition exposed to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Everything a provider needs for one call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: Model,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// Complete model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

impl ProviderResponse {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            usage: TokenUsage::default(),
            finish_reason: FinishReason::EndTurn,
        }
    }

    #[must_use]
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        if !tool_calls.is_empty() {
            self.finish_reason = FinishReason::ToolUse;
        }
        self.tool_calls = tool_calls;
        self
    }

    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// Incremental output of a streaming call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    ContentDelta(String),
    ReasoningDelta(String),
    ToolCallStarted { id: String, name: String },
    /// Terminal success; carries the assembled response.
    Complete(ProviderResponse),
    /// Terminal failure.
    Error(ProviderError),
}

pub type ProviderEventStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

/// Capability set implemented once per backend family.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Return the whole response.
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Stream deltas. Families without native streaming emit the `generate`
    /// result as one delta followed by `Complete`.
    fn stream(&self, request: GenerateRequest, cancel: CancellationToken) -> ProviderEventStream
    where
        Self: Clone + Sized + 'static,
    {
        let client = self.clone();
        Box::pin(async_stream::stream! {
            match client.generate(request, cancel).await {
                Ok(response) => {
                    if !response.content.is_empty() {
                        yield ProviderEvent::ContentDelta(response.content.clone());
                    }
                    yield ProviderEvent::Complete(response);
                }
                Err(err) => yield ProviderEvent::Error(err),
            }
        })
    }
}
