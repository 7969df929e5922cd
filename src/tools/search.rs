//! Regex search across workspace files, honoring ignore files.

use std::path::Path;

use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::spec::{ToolContext, ToolError, ToolResult, ToolSpec, optional_str, optional_u64, required_str};

const DEFAULT_MAX_MATCHES: u64 = 200;

#[derive(Debug, Clone, Serialize, PartialEq)]
struct GrepMatch {
    path: String,
    line: usize,
    text: String,
}

/// Search file contents with a regular expression.
pub struct GrepFilesTool;

#[async_trait]
impl ToolSpec for GrepFilesTool {
    fn name(&self) -> &'static str {
        "grep_files"
    }

    fn description(&self) -> &'static str {
        "Search workspace files for a regular expression. Respects .gitignore. Returns path, line number and line text."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regular expression" },
                "path": { "type": "string", "description": "Directory to search (default: .)" },
                "max_matches": { "type": "integer", "description": "Maximum matches to return (default: 200)" }
            },
            "required": ["pattern"]
        })
    }

    fn describe(&self, input: &Value) -> String {
        format!(
            "Search for /{}/ in {}",
            optional_str(input, "pattern").unwrap_or(""),
            optional_str(input, "path").unwrap_or(".")
        )
    }

    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        let pattern = required_str(input, "pattern")?;
        Regex::new(pattern)
            .map(|_| ())
            .map_err(|e| ToolError::invalid_input(format!("Invalid regex: {e}")))
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let pattern = required_str(&input, "pattern")?;
        let regex =
            Regex::new(pattern).map_err(|e| ToolError::invalid_input(format!("Invalid regex: {e}")))?;
        let root = context.resolve_path(optional_str(&input, "path").unwrap_or("."))?;
        let max = usize::try_from(optional_u64(&input, "max_matches", DEFAULT_MAX_MATCHES))
            .unwrap_or(usize::MAX);
        let workspace = context.workspace.clone();
        let cancel = context.cancel.clone();

        let matches = tokio::task::spawn_blocking(move || {
            search(&root, &workspace, &regex, max, &cancel)
        })
        .await
        .map_err(|e| ToolError::execution_failed(format!("search task failed: {e}")))??;

        if matches.is_empty() {
            return Ok(ToolResult::success("No matches found."));
        }
        ToolResult::json(&matches).map_err(|e| ToolError::execution_failed(e.to_string()))
    }
}

fn search(
    root: &Path,
    workspace: &Path,
    regex: &Regex,
    max: usize,
    cancel: &CancellationToken,
) -> Result<Vec<GrepMatch>, ToolError> {
    let mut matches = Vec::new();
    'walk: for entry in WalkBuilder::new(root).build() {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }
        // Binary or unreadable files are skipped.
        let Ok(contents) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let display = entry
            .path()
            .strip_prefix(workspace)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        for (index, line) in contents.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(GrepMatch {
                    path: display.clone(),
                    line: index + 1,
                    text: line.trim_end().to_string(),
                });
                if matches.len() >= max {
                    break 'walk;
                }
            }
        }
    }
    matches.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn finds_matches_with_line_numbers() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("src")).expect("mkdir");
        std::fs::write(dir.path().join("src/lib.rs"), "fn alpha() {}\nfn beta() {}\n")
            .expect("write");
        std::fs::write(dir.path().join("README.md"), "beta release\n").expect("write");

        let ctx = ToolContext::new(dir.path(), "s1");
        let result = GrepFilesTool
            .execute(json!({"pattern": "beta"}), &ctx)
            .await
            .expect("grep");
        let found: Vec<GrepMatch> = serde_json::from_str::<Vec<Value>>(&result.content)
            .expect("json")
            .into_iter()
            .map(|v| GrepMatch {
                path: v["path"].as_str().unwrap_or_default().to_string(),
                line: v["line"].as_u64().unwrap_or_default() as usize,
                text: v["text"].as_str().unwrap_or_default().to_string(),
            })
            .collect();
        assert_eq!(
            found,
            vec![
                GrepMatch {
                    path: "README.md".into(),
                    line: 1,
                    text: "beta release".into()
                },
                GrepMatch {
                    path: format!("src{}lib.rs", std::path::MAIN_SEPARATOR),
                    line: 2,
                    text: "fn beta() {}".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn reports_no_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.txt"), "nothing here").expect("write");
        let result = GrepFilesTool
            .execute(json!({"pattern": "zzz"}), &ToolContext::new(dir.path(), "s1"))
            .await
            .expect("grep");
        assert_eq!(result.content, "No matches found.");
    }

    #[test]
    fn invalid_regex_fails_validation() {
        assert!(matches!(
            GrepFilesTool.validate(&json!({"pattern": "("})),
            Err(ToolError::InvalidInput { .. })
        ));
    }
}
