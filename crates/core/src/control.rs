//! Session Control Tools
//!
//! Built-in tools that let the model act on its own session: switch the
//! synthesis voice, end the conversation after the current reply, and read
//! the clock. They are served in-process over MCP so the session treats them
//! exactly like any external MCP tool.

use crate::providers::TtsProvider;
use crate::session::SessionFlags;
use crate::tools::McpToolExecutor;
use rmcp::{
    ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{Instrument, info, warn};

/// Arguments for `change_voice`.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct ChangeVoiceArgs {
    #[schemars(description = "Name of the new voice, e.g. 'alloy', 'nova' or 'onyx'")]
    pub voice: String,
}

/// MCP server exposing the built-in session tools.
pub struct ControlService {
    tts: Arc<dyn TtsProvider>,
    flags: Arc<SessionFlags>,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for ControlService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some("Tools that control the current voice conversation.".into()),
            ..Default::default()
        }
    }
}

#[tool_router]
impl ControlService {
    pub fn new(tts: Arc<dyn TtsProvider>, flags: Arc<SessionFlags>) -> Self {
        Self {
            tts,
            flags,
            tool_router: Self::tool_router(),
        }
    }

    /// Switches the synthesis voice for the rest of the session.
    #[tool(description = "Change the voice used to speak to the user.")]
    pub async fn change_voice(&self, args: Parameters<ChangeVoiceArgs>) -> Result<String, String> {
        let voice = args.0.voice.trim().to_lowercase();
        info!(%voice, "Executing tool 'change_voice'");
        self.tts
            .set_voice(&voice)
            .map(|_| format!("OK. The voice is now '{voice}'."))
            .map_err(|e| format!("Could not change the voice: {e}"))
    }

    /// Marks the session to close once the current reply has been spoken.
    #[tool(
        description = "End the conversation. Call this when the user wants to stop talking; say a short goodbye afterwards."
    )]
    pub async fn end_conversation(&self) -> Result<String, String> {
        info!("Executing tool 'end_conversation'");
        self.flags.mark_close_after_turn();
        Ok("OK. The conversation ends after this reply. Say goodbye briefly.".to_string())
    }

    #[tool(description = "Get the current local date and time.")]
    pub async fn get_current_time(&self) -> Result<String, String> {
        info!("Executing tool 'get_current_time'");
        Ok(chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S (%A)")
            .to_string())
    }
}

impl ControlService {
    /// Serves the tools over an in-memory pipe and returns a connected
    /// executor. The server task ends when the executor is dropped.
    pub async fn connect_in_process(self) -> anyhow::Result<McpToolExecutor> {
        let (server_transport, client_transport) = tokio::io::duplex(4096);
        tokio::spawn(
            async move {
                match self.serve(server_transport).await {
                    Ok(server) => {
                        let _ = server.waiting().await;
                    }
                    Err(e) => warn!(error = %e, "Session tool server failed to start"),
                }
            }
            .instrument(tracing::Span::current()),
        );
        let client = ().serve(client_transport).await?;
        McpToolExecutor::connect(client).await
    }
}
