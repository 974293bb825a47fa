//! Provider Contracts
//!
//! Narrow capability traits the session uses to reach speech recognition,
//! language models and speech synthesis. Concrete vendors live behind these
//! traits and are chosen by configuration, never by the session itself.

use crate::dialogue::Message;
use crate::tool_call::ToolCallFragment;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Weak};

/// A stream of plain text chunks.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A stream of chunks from a function-calling response.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<LlmChunk>> + Send>>;

/// One element of a function-calling response.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmChunk {
    Content(String),
    ToolCall(ToolCallFragment),
}

/// A function the model may call, in OpenAI function-definition shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments object.
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Receives recognition results. Implemented by the session.
#[async_trait]
pub trait AsrListener: Send + Sync {
    /// Returns `true` to stop listening for the current utterance.
    async fn on_asr_result(&self, text: String) -> bool;
}

/// Streaming speech recognition.
///
/// Implementations may invoke the listener from any task, but must not hold
/// internal locks while doing so: the listener is allowed to call back into
/// [`reset`](Self::reset).
#[async_trait]
pub trait AsrProvider: Send + Sync {
    fn set_listener(&self, listener: Weak<dyn AsrListener>);

    /// Feeds one chunk of 16 kHz mono PCM16 LE audio.
    async fn add_audio(&self, pcm: Bytes) -> Result<()>;

    /// Drops buffered audio and clears the silence counter.
    async fn reset(&self) -> Result<()>;

    /// Consecutive silence detections since the last recognized speech.
    fn silence_count(&self) -> u32;
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn response(&self, session_id: &str, messages: &[Message]) -> Result<TextStream>;

    async fn response_with_functions(
        &self,
        session_id: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChunkStream>;
}

/// Text to speech. Audio is written to a file owned by the caller.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn to_speech(&self, text: &str) -> Result<PathBuf>;

    fn set_voice(&self, voice: &str) -> Result<()>;

    fn voice(&self) -> String;

    /// Stable provider name, used to key cached audio.
    fn name(&self) -> &str;
}

/// Independent LLM settings for a user-configured function tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
}

/// Builds LLM providers for nested, independently configured calls.
pub trait LlmFactory: Send + Sync {
    fn create(&self, settings: &LlmSettings) -> Result<Arc<dyn LlmProvider>>;
}

/// The per-session provider handles.
#[derive(Clone)]
pub struct ProviderSet {
    pub asr: Arc<dyn AsrProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
}
