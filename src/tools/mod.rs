//! Tool system modules and re-exports.

// === Modules ===

pub mod file;
pub mod registry;
pub mod search;
pub mod shell;
pub mod spec;

// === Re-exports ===

pub use spec::{ApprovalRequirement, ToolContext, ToolError, ToolResult, ToolSpec};

pub use registry::{ToolRegistry, ToolRegistryBuilder};

pub use file::{ListDirTool, ReadFileTool, WriteFileTool};
pub use search::GrepFilesTool;
pub use shell::ExecShellTool;
