//! OpenAI-compatible chat provider with streamed function calling.

use crate::dialogue::{Message, Role};
use crate::providers::{
    ChunkStream, LlmChunk, LlmFactory, LlmProvider, LlmSettings, TextStream, ToolDefinition,
};
use crate::tool_call::ToolCallFragment;
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType,
        CreateChatCompletionRequestArgs, CreateChatCompletionStreamResponse, FunctionCall,
        FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

/// An `LlmProvider` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - API key and base URL of the service.
    /// * `model` - Chat model identifier (e.g., "gpt-4o-mini").
    pub fn new(config: OpenAIConfig, model: impl Into<String>) -> Self {
        Self {
            client: Client::with_config(config),
            model: model.into(),
        }
    }

    fn request_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>> {
        messages.iter().map(to_request_message).collect()
    }
}

/// Maps a dialogue turn onto the chat-completions request format.
pub fn to_request_message(message: &Message) -> Result<ChatCompletionRequestMessage> {
    let converted = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(message.content.clone())
            .build()?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(message.content.clone())
            .build()?
            .into(),
        Role::Assistant => {
            let mut args = ChatCompletionRequestAssistantMessageArgs::default();
            if !message.content.is_empty() || message.tool_calls.is_empty() {
                args.content(message.content.clone());
            }
            if !message.tool_calls.is_empty() {
                args.tool_calls(
                    message
                        .tool_calls
                        .iter()
                        .map(|call| ChatCompletionMessageToolCall {
                            id: call.id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: FunctionCall {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect::<Vec<_>>(),
                );
            }
            args.build()?.into()
        }
        Role::Tool => ChatCompletionRequestToolMessageArgs::default()
            .tool_call_id(
                message
                    .tool_call_id
                    .clone()
                    .context("tool turn without a tool_call_id")?,
            )
            .content(message.content.clone())
            .build()?
            .into(),
    };
    Ok(converted)
}

fn to_chat_tool(definition: &ToolDefinition) -> Result<ChatCompletionTool> {
    Ok(ChatCompletionToolArgs::default()
        .function(
            FunctionObjectArgs::default()
                .name(definition.name.clone())
                .description(definition.description.clone())
                .parameters(definition.parameters.clone())
                .build()?,
        )
        .build()?)
}

/// Splits one streamed response into content and tool-call chunks.
fn stream_chunks(response: CreateChatCompletionStreamResponse) -> Vec<LlmChunk> {
    let Some(choice) = response.choices.into_iter().next() else {
        return Vec::new();
    };
    let mut chunks = Vec::new();
    if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
        chunks.push(LlmChunk::Content(content));
    }
    for call in choice.delta.tool_calls.unwrap_or_default() {
        let (name, arguments) = match call.function {
            Some(f) => (f.name, f.arguments),
            None => (None, None),
        };
        chunks.push(LlmChunk::ToolCall(ToolCallFragment {
            index: call.index,
            id: call.id,
            name,
            arguments,
        }));
    }
    chunks
}

#[async_trait]
impl LlmProvider for OpenAICompatibleClient {
    async fn response(&self, session_id: &str, messages: &[Message]) -> Result<TextStream> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::request_messages(messages)?)
            .user(session_id)
            .stream(true)
            .build()?;

        let stream = self.client.chat().create_stream(request).await?;
        Ok(Box::pin(stream.filter_map(|result| async move {
            match result {
                Ok(response) => stream_chunks(response).into_iter().find_map(|c| match c {
                    LlmChunk::Content(text) => Some(Ok(text)),
                    LlmChunk::ToolCall(_) => None,
                }),
                Err(e) => Some(Err(e.into())),
            }
        })))
    }

    async fn response_with_functions(
        &self,
        session_id: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChunkStream> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(Self::request_messages(messages)?)
            .user(session_id)
            .stream(true);
        if !tools.is_empty() {
            args.tools(tools.iter().map(to_chat_tool).collect::<Result<Vec<_>>>()?);
        }
        let request = args.build()?;
        debug!(model = %self.model, tools = tools.len(), "Requesting streamed completion");

        let stream = self.client.chat().create_stream(request).await?;
        Ok(Box::pin(stream.flat_map(|result| {
            let items: Vec<Result<LlmChunk>> = match result {
                Ok(response) => stream_chunks(response).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e.into())],
            };
            futures::stream::iter(items)
        })))
    }
}

/// Creates OpenAI-compatible clients, falling back to a default endpoint and
/// key when the settings leave them out.
pub struct OpenAiLlmFactory {
    default_config: OpenAIConfig,
}

impl OpenAiLlmFactory {
    pub fn new(default_config: OpenAIConfig) -> Self {
        Self { default_config }
    }
}

impl LlmFactory for OpenAiLlmFactory {
    fn create(&self, settings: &LlmSettings) -> Result<std::sync::Arc<dyn LlmProvider>> {
        anyhow::ensure!(!settings.model.is_empty(), "an LLM model name is required");
        let mut config = self.default_config.clone();
        if let Some(base_url) = settings.base_url.as_deref().filter(|s| !s.is_empty()) {
            config = config.with_api_base(base_url);
        }
        if let Some(api_key) = settings.api_key.as_deref().filter(|s| !s.is_empty()) {
            config = config.with_api_key(api_key);
        }
        Ok(std::sync::Arc::new(OpenAICompatibleClient::new(
            config,
            settings.model.clone(),
        )))
    }
}
