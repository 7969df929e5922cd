//! Agent orchestration engine for terminal coding assistants.
//!
//! The crate drives a conversation loop against interchangeable model
//! backends ([`providers`]), lets the model call local [`tools`], gates
//! side-effecting calls behind the [`permission`] broker, and reports
//! everything over typed [`pubsub`] buses.

pub mod app;
pub mod compaction;
pub mod config;
pub mod core;
pub mod error_taxonomy;
pub mod llm_client;
pub mod logging;
pub mod message;
pub mod models;
pub mod permission;
pub mod poll;
pub mod pricing;
pub mod prompts;
pub mod providers;
pub mod pubsub;
pub mod session;
pub mod tools;

pub use crate::core::{Agent, AgentError, AgentEvent, AgentEventKind};
