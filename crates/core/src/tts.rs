//! OpenAI speech synthesis to audio files.

use crate::providers::TtsProvider;
use anyhow::{Context, Result, bail};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{CreateSpeechRequestArgs, SpeechModel, SpeechResponseFormat, Voice},
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Voices accepted by [`OpenAiSpeech::set_voice`].
pub const VOICES: &[&str] = &["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

fn parse_voice(name: &str) -> Option<Voice> {
    match name {
        "alloy" => Some(Voice::Alloy),
        "echo" => Some(Voice::Echo),
        "fable" => Some(Voice::Fable),
        "onyx" => Some(Voice::Onyx),
        "nova" => Some(Voice::Nova),
        "shimmer" => Some(Voice::Shimmer),
        _ => None,
    }
}

/// Writes one Opus file per synthesized segment into `output_dir`.
pub struct OpenAiSpeech {
    client: Client<OpenAIConfig>,
    voice: RwLock<String>,
    output_dir: PathBuf,
}

impl OpenAiSpeech {
    pub fn new(config: OpenAIConfig, voice: &str, output_dir: impl Into<PathBuf>) -> Result<Self> {
        if parse_voice(voice).is_none() {
            bail!("unknown voice '{voice}', expected one of {}", VOICES.join(", "));
        }
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create audio dir {}", output_dir.display()))?;
        Ok(Self {
            client: Client::with_config(config),
            voice: RwLock::new(voice.to_string()),
            output_dir,
        })
    }
}

#[async_trait]
impl TtsProvider for OpenAiSpeech {
    async fn to_speech(&self, text: &str) -> Result<PathBuf> {
        let voice_name = self.voice();
        let voice = parse_voice(&voice_name).context("voice is no longer valid")?;
        let request = CreateSpeechRequestArgs::default()
            .input(text)
            .voice(voice)
            .model(SpeechModel::Tts1)
            .response_format(SpeechResponseFormat::Opus)
            .build()?;

        let response = self.client.audio().speech(request).await?;
        let path = self.output_dir.join(format!("{}.opus", Uuid::new_v4()));
        response
            .save(&path)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(voice = %voice_name, path = %path.display(), "Synthesized speech");
        Ok(path)
    }

    fn set_voice(&self, voice: &str) -> Result<()> {
        if parse_voice(voice).is_none() {
            bail!("unknown voice '{voice}', expected one of {}", VOICES.join(", "));
        }
        match self.voice.write() {
            Ok(mut current) => *current = voice.to_string(),
            Err(poisoned) => *poisoned.into_inner() = voice.to_string(),
        }
        Ok(())
    }

    fn voice(&self) -> String {
        match self.voice.read() {
            Ok(voice) => voice.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn name(&self) -> &str {
        "openai"
    }
}
