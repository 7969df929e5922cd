//! Conversation messages and their typed content parts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// Why a model turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Cancelled,
    PermissionDenied,
    Error,
    Unknown,
}

impl FinishReason {
    /// Map an OpenAI-style `finish_reason` string.
    #[must_use]
    pub fn from_api(value: Option<&str>) -> Self {
        match value {
            Some("stop" | "end_turn") => Self::EndTurn,
            Some("tool_calls" | "tool_use" | "function_call") => Self::ToolUse,
            Some("length" | "max_tokens") => Self::MaxTokens,
            None => Self::EndTurn,
            Some(_) => Self::Unknown,
        }
    }
}

/// A model's request to invoke a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Outcome of a tool call, fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPart {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResultPart {
    #[must_use]
    pub fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    #[must_use]
    pub fn error(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// One typed piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Reasoning { text: String },
    Attachment { path: String, mime_type: String },
    ToolCall(ToolCall),
    ToolResult(ToolResultPart),
    Finish { reason: FinishReason },
}

/// Token accounting reported by a provider for one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Self::default()
        }
    }

    /// Prompt tokens including those served from or written to the cache.
    #[must_use]
    pub fn prompt_total(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.prompt_total() + self.output_tokens
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    /// Model that authored an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    #[must_use]
    pub fn new(session_id: impl Into<String>, role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            parts,
            model: None,
            usage: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn user(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            session_id,
            Role::User,
            vec![ContentPart::Text { text: text.into() }],
        )
    }

    #[must_use]
    pub fn assistant_text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            session_id,
            Role::Assistant,
            vec![ContentPart::Text { text: text.into() }],
        )
    }

    #[must_use]
    pub fn tool_results(session_id: impl Into<String>, results: Vec<ToolResultPart>) -> Self {
        Self::new(
            session_id,
            Role::Tool,
            results.into_iter().map(ContentPart::ToolResult).collect(),
        )
    }

    /// Fix the token counts of an assistant message. Only the first call has
    /// an effect.
    pub fn finalize(&mut self, model: &str, usage: TokenUsage) {
        if self.usage.is_none() {
            self.usage = Some(usage);
            self.model = Some(model.to_string());
        }
    }

    /// Concatenated text parts.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    #[must_use]
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn tool_results_parts(&self) -> Vec<&ToolResultPart> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.parts.iter().find_map(|part| match part {
            ContentPart::Finish { reason } => Some(*reason),
            _ => None,
        })
    }
}
