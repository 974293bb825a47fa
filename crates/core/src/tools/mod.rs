//! Tool Execution
//!
//! The session resolves tool calls through a single [`ToolExecutor`]. The
//! [`ToolRegistry`] composes the MCP-backed executor with user-configured
//! function tools and is built explicitly per session, so no registry state
//! is shared between connections.

pub mod function;
pub mod mcp;

pub use function::{FunctionToolConfig, FunctionToolExecutor};
pub use mcp::McpToolExecutor;

use crate::providers::ToolDefinition;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// What the session should do with a tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolAction {
    /// Record the result as a `tool` turn and ask the LLM to continue.
    RequestLlm(String),
    /// Speak the text directly; no further LLM call.
    Respond(String),
    /// The tool handled everything itself.
    NoAction,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool '{0}' is not registered")]
    NotFound(String),

    #[error("tool '{name}' failed: {reason}")]
    Execution { name: String, reason: String },

    #[error("invalid arguments for tool '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },
}

/// Executes tool calls requested by the model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Function definitions advertised to the model.
    fn definitions(&self) -> Vec<ToolDefinition>;

    fn is_registered_tool(&self, name: &str) -> bool;

    /// Runs the tool with its raw JSON `arguments`.
    async fn execute_tool(&self, name: &str, arguments: &str) -> Result<ToolAction, ToolError>;
}

/// Ordered composition of executors; the first one that knows a tool name
/// runs it.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    executors: Vec<Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut seen = std::collections::HashSet::new();
        self.executors
            .iter()
            .flat_map(|e| e.definitions())
            .filter(|d| seen.insert(d.name.clone()))
            .collect()
    }

    fn is_registered_tool(&self, name: &str) -> bool {
        self.executors.iter().any(|e| e.is_registered_tool(name))
    }

    async fn execute_tool(&self, name: &str, arguments: &str) -> Result<ToolAction, ToolError> {
        match self.executors.iter().find(|e| e.is_registered_tool(name)) {
            Some(executor) => executor.execute_tool(name, arguments).await,
            None => Err(ToolError::NotFound(name.to_string())),
        }
    }
}
