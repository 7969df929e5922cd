//! Tool registry and builder.

use std::collections::HashMap;
use std::sync::Arc;

use crate::llm_client::ToolDefinition;

use super::file::{ListDirTool, ReadFileTool, WriteFileTool};
use super::search::GrepFilesTool;
use super::shell::ExecShellTool;
use super::spec::ToolSpec;

/// Tools available to one agent, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn ToolSpec>>,
    order: Vec<&'static str>,
}

impl ToolRegistry {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolSpec>> {
        self.tools.get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.order.clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions in registration order, as sent to providers.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

/// Fluent builder; later registrations replace earlier ones of the same name.
#[derive(Default)]
pub struct ToolRegistryBuilder {
    registry: ToolRegistry,
}

impl ToolRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn ToolSpec>) -> Self {
        let name = tool.name();
        if self.registry.tools.insert(name, tool).is_none() {
            self.registry.order.push(name);
        }
        self
    }

    #[must_use]
    pub fn with_read_only_file_tools(self) -> Self {
        self.with_tool(Arc::new(ReadFileTool))
            .with_tool(Arc::new(ListDirTool))
    }

    #[must_use]
    pub fn with_search_tools(self) -> Self {
        self.with_tool(Arc::new(GrepFilesTool))
    }

    #[must_use]
    pub fn with_write_tools(self) -> Self {
        self.with_tool(Arc::new(WriteFileTool))
    }

    #[must_use]
    pub fn with_shell_tool(self) -> Self {
        self.with_tool(Arc::new(ExecShellTool))
    }

    /// Every built-in tool.
    #[must_use]
    pub fn with_agent_tools(self) -> Self {
        self.with_read_only_file_tools()
            .with_search_tools()
            .with_write_tools()
            .with_shell_tool()
    }

    #[must_use]
    pub fn build(self) -> ToolRegistry {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::spec::ApprovalRequirement;
    use pretty_assertions::assert_eq;

    #[test]
    fn agent_tools_register_in_order() {
        let registry = ToolRegistryBuilder::new().with_agent_tools().build();
        assert_eq!(
            registry.names(),
            vec!["read_file", "list_dir", "grep_files", "write_file", "exec_shell"]
        );
        let definitions = registry.definitions();
        assert_eq!(definitions.len(), 5);
        assert_eq!(definitions[0].input_schema["required"][0], "path");
    }

    #[test]
    fn duplicate_registration_keeps_one_entry() {
        let registry = ToolRegistryBuilder::new()
            .with_shell_tool()
            .with_shell_tool()
            .build();
        assert_eq!(registry.names(), vec!["exec_shell"]);
        let shell = registry.get("exec_shell").expect("registered");
        assert_eq!(shell.approval_requirement(), ApprovalRequirement::Required);
        assert!(registry.get("missing").is_none());
    }
}
