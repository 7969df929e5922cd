//! Tool contract: schema, approval requirement, describe/validate/execute.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Whether a tool may run without asking the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalRequirement {
    Auto,
    Required,
}

/// Errors raised while validating or executing a tool.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("missing required field: {field}")]
    MissingField { field: String },
    #[error("path escapes workspace: {}", path.display())]
    PathEscape { path: PathBuf },
    #[error("execution failed: {message}")]
    ExecutionFailed { message: String },
    #[error("timed out after {millis}ms")]
    Timeout { millis: u64 },
    #[error("tool not available: {message}")]
    NotAvailable { message: String },
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_available(message: impl Into<String>) -> Self {
        Self::NotAvailable {
            message: message.into(),
        }
    }
}

/// Output of a tool run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub success: bool,
}

impl ToolResult {
    #[must_use]
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
        }
    }

    /// A handled failure reported back to the model.
    #[must_use]
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: false,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::success(serde_json::to_string_pretty(value)?))
    }
}

/// Per-call execution context.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workspace: PathBuf,
    pub session_id: String,
    pub cancel: CancellationToken,
}

impl ToolContext {
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            session_id: session_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve `raw` against the workspace, rejecting anything outside it.
    ///
    /// `..` is resolved lexically so paths that do not exist yet still work;
    /// the deepest existing ancestor is then canonicalized so symlinks cannot
    /// lead out of the workspace.
    pub fn resolve_path(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace.join(candidate)
        };
        let normalized = normalize(&joined);
        let root = normalize(&self.workspace);
        let escape = || ToolError::PathEscape {
            path: candidate.to_path_buf(),
        };
        if !normalized.starts_with(&root) {
            return Err(escape());
        }
        // A workspace that does not exist on disk has no links to follow.
        let Ok(real_root) = root.canonicalize() else {
            return Ok(normalized);
        };
        match resolve_existing_prefix(&normalized) {
            Some(real) if real.starts_with(&real_root) => Ok(normalized),
            _ => Err(escape()),
        }
    }
}

/// Canonicalize the deepest ancestor present on disk and re-append the rest.
/// Returns `None` for a dangling symlink.
fn resolve_existing_prefix(path: &Path) -> Option<PathBuf> {
    let existing = path
        .ancestors()
        .find(|ancestor| ancestor.symlink_metadata().is_ok())?;
    let rest = path.strip_prefix(existing).ok()?;
    let real = existing.canonicalize().ok()?;
    Some(real.join(rest))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// A tool the model can call.
#[async_trait]
pub trait ToolSpec: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema of the input object.
    fn input_schema(&self) -> Value;

    fn approval_requirement(&self) -> ApprovalRequirement {
        ApprovalRequirement::Auto
    }

    /// One-line human summary used in permission prompts.
    fn describe(&self, input: &Value) -> String {
        format!("{} {input}", self.name())
    }

    /// Check the input before asking for permission.
    fn validate(&self, _input: &Value) -> Result<(), ToolError> {
        Ok(())
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError>;
}

// === Input helpers ===

pub fn required_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::MissingField {
            field: field.to_string(),
        })
}

#[must_use]
pub fn optional_str<'a>(input: &'a Value, field: &str) -> Option<&'a str> {
    input.get(field).and_then(Value::as_str)
}

#[must_use]
pub fn optional_u64(input: &Value, field: &str, default: u64) -> u64 {
    input.get(field).and_then(Value::as_u64).unwrap_or(default)
}

#[must_use]
pub fn optional_bool(input: &Value, field: &str, default: bool) -> bool {
    input.get(field).and_then(Value::as_bool).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_path_stays_inside_workspace() {
        let ctx = ToolContext::new("/work/repo", "s1");
        assert_eq!(
            ctx.resolve_path("src/../Cargo.toml").expect("inside"),
            PathBuf::from("/work/repo/Cargo.toml")
        );
        assert!(matches!(
            ctx.resolve_path("../secrets"),
            Err(ToolError::PathEscape { .. })
        ));
        assert!(matches!(
            ctx.resolve_path("/etc/passwd"),
            Err(ToolError::PathEscape { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_out_of_the_workspace_are_rejected() {
        use std::os::unix::fs::symlink;

        let workspace = tempfile::tempdir().expect("workspace");
        let outside = tempfile::tempdir().expect("outside");
        std::fs::write(outside.path().join("secret.txt"), "key").expect("seed");
        std::fs::create_dir(workspace.path().join("src")).expect("src");
        symlink(outside.path(), workspace.path().join("escape")).expect("link out");
        symlink(
            workspace.path().join("src"),
            workspace.path().join("alias"),
        )
        .expect("link in");
        symlink(
            outside.path().join("missing.txt"),
            workspace.path().join("dangling"),
        )
        .expect("dangling link");

        let ctx = ToolContext::new(workspace.path(), "s1");
        for raw in ["escape", "escape/secret.txt", "escape/new.txt", "dangling"] {
            assert!(
                matches!(ctx.resolve_path(raw), Err(ToolError::PathEscape { .. })),
                "{raw} resolved"
            );
        }
        assert_eq!(
            ctx.resolve_path("alias/lib.rs").expect("inside"),
            workspace.path().join("alias/lib.rs")
        );
        assert_eq!(
            ctx.resolve_path("new/dir/file.txt").expect("not yet created"),
            workspace.path().join("new/dir/file.txt")
        );
    }

    #[test]
    fn input_helpers_report_missing_fields() {
        let input = json!({"path": "a.txt", "limit": 3, "recursive": true});
        assert_eq!(required_str(&input, "path"), Ok("a.txt"));
        assert_eq!(
            required_str(&input, "pattern"),
            Err(ToolError::MissingField {
                field: "pattern".to_string()
            })
        );
        assert_eq!(optional_u64(&input, "limit", 10), 3);
        assert!(optional_bool(&input, "recursive", false));
        assert_eq!(optional_str(&input, "missing"), None);
    }
}
