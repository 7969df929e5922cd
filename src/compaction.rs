//! Context compaction policy for long conversations.
//!
//! The engine only reports usage; consumers decide when to summarize using
//! [`should_auto_compact`] so every front end applies the same rule.

use crate::message::{ContentPart, Message};
use crate::models::Model;
use crate::prompts::SUMMARY_REQUEST;
use crate::session::Session;

/// Fraction of the context window that triggers automatic compaction.
pub const AUTO_COMPACT_RATIO: f64 = 0.95;

/// Configuration for compaction behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionConfig {
    pub enabled: bool,
    pub threshold_ratio: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_ratio: AUTO_COMPACT_RATIO,
        }
    }
}

impl CompactionConfig {
    #[must_use]
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }
}

pub fn estimate_tokens(messages: &[Message]) -> u64 {
    // Rough estimate: ~4 chars per token
    messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .map(|part| match part {
            ContentPart::Text { text } | ContentPart::Reasoning { text } => text.len() / 4,
            ContentPart::ToolCall(call) => serde_json::to_string(&call.input)
                .map(|s| s.len() / 4)
                .unwrap_or(100),
            ContentPart::ToolResult(result) => result.content.len() / 4,
            ContentPart::Attachment { .. } | ContentPart::Finish { .. } => 0,
        })
        .sum::<usize>() as u64
}

/// Tokens occupying the context since the last summary.
///
/// Backends that report no usage fall back to a character estimate.
#[must_use]
pub fn context_tokens(session: &Session, messages: &[Message]) -> u64 {
    session
        .tokens_since_summary()
        .max(estimate_tokens(messages))
}

/// Share of `model`'s context window in use.
#[must_use]
pub fn context_usage_ratio(session: &Session, messages: &[Message], model: &Model) -> f64 {
    if model.context_window == 0 {
        return 0.0;
    }
    context_tokens(session, messages) as f64 / f64::from(model.context_window)
}

pub fn should_auto_compact(
    session: &Session,
    messages: &[Message],
    model: &Model,
    config: CompactionConfig,
) -> bool {
    config.enabled && context_usage_ratio(session, messages, model) >= config.threshold_ratio
}

/// Conversation sent to the summarizer: the history plus a closing request.
#[must_use]
pub fn summary_request_messages(session_id: &str, history: &[Message]) -> Vec<Message> {
    let mut messages = history.to_vec();
    messages.push(Message::user(session_id, SUMMARY_REQUEST));
    messages
}
