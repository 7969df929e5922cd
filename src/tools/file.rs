//! Workspace file tools: read, list, write.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};

use super::spec::{
    ApprovalRequirement, ToolContext, ToolError, ToolResult, ToolSpec, optional_bool,
    optional_str, optional_u64, required_str,
};

const MAX_READ_BYTES: usize = 256 * 1024;
const MAX_LIST_ENTRIES: usize = 500;

/// Read a UTF-8 file, optionally a line window of it.
pub struct ReadFileTool;

#[async_trait]
impl ToolSpec for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a text file from the workspace. Supports an optional line offset and limit."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace" },
                "offset": { "type": "integer", "description": "First line to return (0-based)" },
                "limit": { "type": "integer", "description": "Maximum number of lines" }
            },
            "required": ["path"]
        })
    }

    fn describe(&self, input: &Value) -> String {
        format!("Read {}", optional_str(input, "path").unwrap_or("<missing path>"))
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        required_str(input, "path").map(|_| ())
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let raw = required_str(&input, "path")?;
        let path = context.resolve_path(raw)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ToolError::execution_failed(format!("Failed to read {raw}: {e}")))?;
        if bytes.len() > MAX_READ_BYTES {
            return Ok(ToolResult::error(format!(
                "{raw} is {} bytes; read it in windows with offset/limit after narrowing with grep_files",
                bytes.len()
            )));
        }
        let text = String::from_utf8_lossy(&bytes);

        let offset = usize::try_from(optional_u64(&input, "offset", 0)).unwrap_or(usize::MAX);
        let limit = input
            .get("limit")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok());
        if offset == 0 && limit.is_none() {
            return Ok(ToolResult::success(text.into_owned()));
        }
        let window: Vec<&str> = text
            .lines()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(ToolResult::success(window.join("\n")))
    }
}

#[derive(Debug, Serialize)]
struct DirEntry {
    name: String,
    is_dir: bool,
}

/// List one directory level.
pub struct ListDirTool;

#[async_trait]
impl ToolSpec for ListDirTool {
    fn name(&self) -> &'static str {
        "list_dir"
    }

    fn description(&self) -> &'static str {
        "List the entries of a workspace directory."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory relative to the workspace (default: .)" }
            }
        })
    }

    fn describe(&self, input: &Value) -> String {
        format!("List {}", optional_str(input, "path").unwrap_or("."))
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let raw = optional_str(&input, "path").unwrap_or(".");
        let path = context.resolve_path(raw)?;
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| ToolError::execution_failed(format!("Failed to list {raw}: {e}")))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolError::execution_failed(e.to_string()))?
        {
            if entries.len() >= MAX_LIST_ENTRIES {
                break;
            }
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        ToolResult::json(&entries).map_err(|e| ToolError::execution_failed(e.to_string()))
    }
}

/// Create or overwrite a file.
pub struct WriteFileTool;

#[async_trait]
impl ToolSpec for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> &'static str {
        "Write content to a workspace file, creating parent directories as needed."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" },
                "append": { "type": "boolean", "description": "Append instead of overwrite" }
            },
            "required": ["path", "content"]
        })
    }

    fn approval_requirement(&self) -> ApprovalRequirement {
        ApprovalRequirement::Required
    }

    fn describe(&self, input: &Value) -> String {
        let path = optional_str(input, "path").unwrap_or("<missing path>");
        let bytes = optional_str(input, "content").map_or(0, str::len);
        format!("Write {bytes} bytes to {path}")
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        required_str(input, "path")?;
        required_str(input, "content")?;
        Ok(())
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let raw = required_str(&input, "path")?;
        let content = required_str(&input, "content")?;
        let append = optional_bool(&input, "append", false);
        let path = context.resolve_path(raw)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::execution_failed(e.to_string()))?;
        }
        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| ToolError::execution_failed(e.to_string()))?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| ToolError::execution_failed(e.to_string()))?;
        } else {
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| ToolError::execution_failed(format!("Failed to write {raw}: {e}")))?;
        }

        Ok(ToolResult::success(format!(
            "Wrote {} bytes to {raw}",
            content.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn context(dir: &tempfile::TempDir) -> ToolContext {
        ToolContext::new(dir.path(), "s1")
    }

    #[tokio::test]
    async fn write_then_read_with_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir);

        let written = WriteFileTool
            .execute(
                json!({"path": "notes/a.txt", "content": "one\ntwo\nthree\n"}),
                &ctx,
            )
            .await
            .expect("write");
        assert!(written.success);

        let all = ReadFileTool
            .execute(json!({"path": "notes/a.txt"}), &ctx)
            .await
            .expect("read");
        assert_eq!(all.content, "one\ntwo\nthree\n");

        let window = ReadFileTool
            .execute(json!({"path": "notes/a.txt", "offset": 1, "limit": 1}), &ctx)
            .await
            .expect("read window");
        assert_eq!(window.content, "two");
    }

    #[tokio::test]
    async fn append_extends_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&dir);
        std::fs::write(dir.path().join("log.txt"), "a").expect("seed");
        WriteFileTool
            .execute(json!({"path": "log.txt", "content": "b", "append": true}), &ctx)
            .await
            .expect("append");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("log.txt")).expect("read"),
            "ab"
        );
    }

    #[tokio::test]
    async fn list_dir_sorts_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("src")).expect("mkdir");
        std::fs::write(dir.path().join("b.txt"), "").expect("write");
        std::fs::write(dir.path().join("a.txt"), "").expect("write");

        let result = ListDirTool
            .execute(json!({}), &context(&dir))
            .await
            .expect("list");
        let entries: Value = serde_json::from_str(&result.content).expect("json");
        let names: Vec<&str> = entries
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|e| e["name"].as_str())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "src"]);
        assert_eq!(entries[2]["is_dir"], true);
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = WriteFileTool
            .execute(json!({"path": "../outside.txt", "content": "x"}), &context(&dir))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PathEscape { .. }));
    }

    #[test]
    fn write_requires_approval_and_describes_itself() {
        assert_eq!(
            WriteFileTool.approval_requirement(),
            ApprovalRequirement::Required
        );
        assert_eq!(ReadFileTool.approval_requirement(), ApprovalRequirement::Auto);
        assert_eq!(
            WriteFileTool.describe(&json!({"path": "a.rs", "content": "fn main() {}"})),
            "Write 12 bytes to a.rs"
        );
        assert!(WriteFileTool.validate(&json!({"path": "a.rs"})).is_err());
    }
}
