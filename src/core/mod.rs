//! Agent engine and the events it emits.

pub mod engine;
pub mod events;

pub use engine::{Agent, AgentEventStream, AgentServices};
pub use events::{AgentError, AgentEvent, AgentEventKind};
