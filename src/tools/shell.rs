//! Shell command execution inside the workspace.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::spec::{
    ApprovalRequirement, ToolContext, ToolError, ToolResult, ToolSpec, optional_str,
    optional_u64, required_str,
};

const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const MAX_TIMEOUT_MS: u64 = 600_000;
const MAX_OUTPUT_CHARS: usize = 30_000;

#[derive(Debug, Serialize)]
struct ShellOutput {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

/// Tool for executing shell commands.
pub struct ExecShellTool;

#[async_trait]
impl ToolSpec for ExecShellTool {
    fn name(&self) -> &'static str {
        "exec_shell"
    }

    fn description(&self) -> &'static str {
        "Execute a shell command in the workspace directory. Returns stdout, stderr, and exit code."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Timeout in milliseconds (default: 120000, max: 600000)"
                }
            },
            "required": ["command"]
        })
    }

    fn approval_requirement(&self) -> ApprovalRequirement {
        ApprovalRequirement::Required
    }

    fn describe(&self, input: &Value) -> String {
        format!("Run `{}`", optional_str(input, "command").unwrap_or(""))
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        if required_str(input, "command")?.trim().is_empty() {
            return Err(ToolError::invalid_input("command cannot be empty"));
        }
        Ok(())
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let command = required_str(&input, "command")?;
        let timeout_ms = optional_u64(&input, "timeout_ms", DEFAULT_TIMEOUT_MS).min(MAX_TIMEOUT_MS);

        let mut child = shell_command(command)
            .current_dir(&context.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::execution_failed(format!("Failed to spawn shell: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async {
            let (out, err) = tokio::try_join!(read_pipe(stdout), read_pipe(stderr))?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let collected = tokio::select! {
            biased;
            () = context.cancel.cancelled() => return Err(ToolError::Cancelled),
            () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                return Err(ToolError::Timeout { millis: timeout_ms });
            }
            collected = collect => collected,
        };
        let (status, out, err) = collected
            .map_err(|e| ToolError::execution_failed(format!("Failed to read command output: {e}")))?;

        let output = ShellOutput {
            exit_code: status.code(),
            stdout: truncate(out),
            stderr: truncate(err),
        };
        let mut result =
            ToolResult::json(&output).map_err(|e| ToolError::execution_failed(e.to_string()))?;
        result.success = status.success();
        Ok(result)
    }
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Drain a pipe; invalid UTF-8 is replaced rather than dropped.
async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut bytes).await?;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn truncate(mut text: String) -> String {
    if text.chars().count() > MAX_OUTPUT_CHARS {
        text = text.chars().take(MAX_OUTPUT_CHARS).collect();
        text.push_str("\n[output truncated]");
    }
    text
}
