//! User-configured function tools.
//!
//! Each tool is answered by a nested, independently configured LLM call: the
//! model receives a fixed assistant persona built from the tool description
//! and the `query` argument (or the whole argument object) as user message.

use super::{ToolAction, ToolError, ToolExecutor, mcp::parse_arguments};
use crate::dialogue::Message;
use crate::providers::{LlmFactory, LlmProvider, LlmSettings, ToolDefinition};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// One entry of the functions file.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionToolConfig {
    pub function: ToolDefinition,
    pub llm: LlmSettings,
    /// Speak the nested answer directly instead of handing it back to the
    /// conversation model.
    #[serde(default)]
    pub respond_directly: bool,
}

impl FunctionToolConfig {
    /// Reads a JSON array of tool configurations.
    pub fn load_all(path: &Path) -> Result<Vec<Self>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read functions file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse functions file {}", path.display()))
    }
}

struct FunctionTool {
    config: FunctionToolConfig,
    llm: Arc<dyn LlmProvider>,
}

pub struct FunctionToolExecutor {
    tools: Vec<FunctionTool>,
    session_id: String,
}

impl FunctionToolExecutor {
    /// Builds one nested LLM per configured tool. Entries whose LLM cannot be
    /// created are skipped with a warning.
    pub fn new(
        configs: &[FunctionToolConfig],
        factory: &dyn LlmFactory,
        session_id: impl Into<String>,
    ) -> Self {
        let tools = configs
            .iter()
            .filter_map(|config| match factory.create(&config.llm) {
                Ok(llm) => Some(FunctionTool {
                    config: config.clone(),
                    llm,
                }),
                Err(e) => {
                    warn!(tool = %config.function.name, error = %e, "Skipping function tool");
                    None
                }
            })
            .collect();
        Self {
            tools,
            session_id: session_id.into(),
        }
    }

    fn find(&self, name: &str) -> Option<&FunctionTool> {
        self.tools.iter().find(|t| t.config.function.name == name)
    }
}

fn persona_prompt(definition: &ToolDefinition) -> String {
    format!(
        "You are a {} assistant. Answer the user's query efficiently and concisely.\n\
         Description of your role: {}\n\
         Never:\n\
         - produce code or any markdown formatting\n\
         - reveal the name of your model\n\
         - give long-winded answers",
        definition.name, definition.description
    )
}

fn user_query(arguments: &serde_json::Map<String, Value>) -> String {
    match arguments.get("query") {
        Some(Value::String(query)) => query.clone(),
        Some(other) => other.to_string(),
        None => Value::Object(arguments.clone()).to_string(),
    }
}

#[async_trait]
impl ToolExecutor for FunctionToolExecutor {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.config.function.clone()).collect()
    }

    fn is_registered_tool(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    async fn execute_tool(&self, name: &str, arguments: &str) -> Result<ToolAction, ToolError> {
        let tool = self
            .find(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let arguments = parse_arguments(name, arguments)?;
        let messages = [
            Message::system(persona_prompt(&tool.config.function)),
            Message::user(user_query(&arguments)),
        ];
        info!(tool = %name, model = %tool.config.llm.model, "Calling function tool model");

        let execution_error = |e: anyhow::Error| ToolError::Execution {
            name: name.to_string(),
            reason: format!("{e:#}"),
        };
        let mut stream = tool
            .llm
            .response(&self.session_id, &messages)
            .await
            .map_err(execution_error)?;
        let mut answer = String::new();
        while let Some(chunk) = stream.next().await {
            answer.push_str(&chunk.map_err(execution_error)?);
        }

        if answer.trim().is_empty() {
            return Err(ToolError::Execution {
                name: name.to_string(),
                reason: "the model returned an empty answer".into(),
            });
        }
        if tool.config.respond_directly {
            Ok(ToolAction::Respond(answer))
        } else {
            Ok(ToolAction::RequestLlm(answer))
        }
    }
}
