//! MCP-backed tool execution over an `rmcp` client connection.

use super::{ToolAction, ToolError, ToolExecutor};
use crate::providers::ToolDefinition;
use anyhow::Result;
use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, RawContent},
    service::{RoleClient, RunningService},
};
use serde_json::{Map, Value};
use tracing::info;

/// Executes tools served by one MCP server.
///
/// The tool list is fetched once at construction; calls go through the live
/// client connection.
pub struct McpToolExecutor {
    client: RunningService<RoleClient, ()>,
    tools: Vec<ToolDefinition>,
}

impl McpToolExecutor {
    pub async fn connect(client: RunningService<RoleClient, ()>) -> Result<Self> {
        let tools = client
            .list_all_tools()
            .await?
            .into_iter()
            .map(|t| {
                Ok(ToolDefinition {
                    name: t.name.to_string(),
                    description: t.description.map(|d| d.to_string()).unwrap_or_default(),
                    parameters: serde_json::to_value(&*t.input_schema)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        info!(count = tools.len(), "Loaded MCP tools");
        Ok(Self { client, tools })
    }
}

#[async_trait]
impl ToolExecutor for McpToolExecutor {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.clone()
    }

    fn is_registered_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    async fn execute_tool(&self, name: &str, arguments: &str) -> Result<ToolAction, ToolError> {
        let arguments = parse_arguments(name, arguments)?;
        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| ToolError::Execution {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let text = result
            .content
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| match c.raw {
                RawContent::Text(t) => Some(t.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error.unwrap_or(false) {
            return Err(ToolError::Execution {
                name: name.to_string(),
                reason: text,
            });
        }
        if text.is_empty() {
            return Ok(ToolAction::NoAction);
        }
        Ok(ToolAction::RequestLlm(text))
    }
}

pub(crate) fn parse_arguments(name: &str, arguments: &str) -> Result<Map<String, Value>, ToolError> {
    if arguments.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(ToolError::InvalidArguments {
            name: name.to_string(),
            reason: format!("expected an object, got {other}"),
        }),
        Err(e) => Err(ToolError::InvalidArguments {
            name: name.to_string(),
            reason: e.to_string(),
        }),
    }
}
