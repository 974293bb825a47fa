//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the resources every
//! voice session draws from: configuration, the shared chat client, the
//! function-tool definitions and the quick-reply cache.

use crate::config::{Config, ConfigError, load_system_prompt};
use anyhow::Context;
use async_openai::config::OpenAIConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;
use voxrelay_core::asr::WhisperAsr;
use voxrelay_core::llm_client::{OpenAICompatibleClient, OpenAiLlmFactory};
use voxrelay_core::quick_reply::QuickReplyCache;
use voxrelay_core::tools::FunctionToolConfig;
use voxrelay_core::tts::OpenAiSpeech;
use voxrelay_core::{LlmFactory, LlmProvider, ProviderSet, SessionConfig};

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub session_config: SessionConfig,
    pub llm: Arc<dyn LlmProvider>,
    pub llm_factory: Arc<dyn LlmFactory>,
    pub functions: Arc<Vec<FunctionToolConfig>>,
    pub quick_replies: Option<Arc<QuickReplyCache>>,
    active_sessions: Arc<AtomicUsize>,
}

impl AppState {
    /// Builds the shared clients and loads prompt and function files.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let system_prompt = load_system_prompt(&config.prompts_path)?;
        if system_prompt.is_some() {
            info!(path = %config.prompts_path.display(), "Loaded system prompt");
        }

        let functions = match &config.functions_path {
            Some(path) => {
                let functions = FunctionToolConfig::load_all(path)
                    .map_err(|e| ConfigError::Parse(path.clone(), format!("{e:#}")))?;
                info!(count = functions.len(), "Loaded function tools");
                functions
            }
            None => Vec::new(),
        };

        let quick_replies = if config.quick_reply {
            let cache = QuickReplyCache::open(config.quick_reply_dir())
                .context("Failed to open the quick reply cache")?;
            Some(Arc::new(cache))
        } else {
            None
        };

        let chat_config = OpenAIConfig::new()
            .with_api_key(config.chat_api_key())
            .with_api_base(config.provider.api_base());
        let llm: Arc<dyn LlmProvider> = Arc::new(OpenAICompatibleClient::new(
            chat_config.clone(),
            config.chat_model.clone(),
        ));

        Ok(Self {
            session_config: config.session_config(system_prompt),
            config: Arc::new(config),
            llm,
            llm_factory: Arc::new(OpenAiLlmFactory::new(chat_config)),
            functions: Arc::new(functions),
            quick_replies,
            active_sessions: Arc::default(),
        })
    }

    /// Credentials for the speech endpoints, which are always OpenAI.
    fn speech_config(&self) -> OpenAIConfig {
        OpenAIConfig::new().with_api_key(&self.config.openai_api_key)
    }

    /// Fresh recognizer and synthesizer for one session, sharing the chat
    /// client.
    pub fn providers(&self) -> anyhow::Result<ProviderSet> {
        let asr = WhisperAsr::new(self.speech_config(), self.config.asr_model.clone());
        let tts = OpenAiSpeech::new(
            self.speech_config(),
            &self.config.tts_voice,
            &self.config.audio_output_dir,
        )?;
        Ok(ProviderSet {
            asr: Arc::new(asr),
            llm: self.llm.clone(),
            tts: Arc::new(tts),
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Counts a session as active until the returned guard is dropped.
    pub fn track_session(&self) -> ActiveSession {
        self.active_sessions.fetch_add(1, Ordering::AcqRel);
        ActiveSession(self.active_sessions.clone())
    }
}

pub struct ActiveSession(Arc<AtomicUsize>);

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
