//! System prompts for each agent role.

use std::path::Path;

use crate::config::AgentRole;

// Prompt files loaded at compile time
pub const CODER_PROMPT: &str = include_str!("prompts/coder.txt");
pub const SUMMARIZER_PROMPT: &str = include_str!("prompts/summarizer.txt");

/// Final user turn appended when asking for a summary.
pub const SUMMARY_REQUEST: &str = "Provide a detailed but concise summary of our conversation above. \
Focus on information that would be helpful for continuing the conversation, including what we did, \
what we're doing, which files we're working on, and what we're going to do next.";

/// System prompt for `role`, with the workspace path for the coder.
#[must_use]
pub fn system_prompt(role: AgentRole, workspace: &Path) -> String {
    match role {
        AgentRole::Coder => format!(
            "{}\n\nWorkspace: {}",
            CODER_PROMPT.trim(),
            workspace.display()
        ),
        AgentRole::Summarizer => SUMMARIZER_PROMPT.trim().to_string(),
    }
}
