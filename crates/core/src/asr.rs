//! Energy-gated Whisper recognizer.
//!
//! Inbound PCM is split into utterances by a simple energy gate: speech opens
//! an utterance, 700 ms of trailing silence closes it, and the closed
//! utterance is transcribed in the background. Thirty seconds without speech
//! count as one silence detection, reported to the listener as an empty result.

use crate::audio::{self, ASR_SAMPLE_RATE};
use crate::providers::{AsrListener, AsrProvider};
use anyhow::Result;
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{AudioInput, CreateTranscriptionRequestArgs},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, error, warn};

const END_OF_SPEECH_MS: u64 = 700;
const SILENCE_TIMEOUT_MS: u64 = 30_000;
const MAX_UTTERANCE_MS: u64 = 30_000;
const DEFAULT_THRESHOLD: f32 = 0.02;

/// Outcome of feeding audio to the gate.
#[derive(Debug, PartialEq)]
pub enum GateEvent {
    None,
    /// A complete utterance.
    Utterance(Vec<i16>),
    /// The silence timeout elapsed without speech.
    Silence,
}

/// Splits a PCM stream into utterances by signal energy.
#[derive(Debug)]
pub struct EnergyGate {
    threshold: f32,
    speech: Vec<i16>,
    in_speech: bool,
    trailing_ms: u64,
    idle_ms: u64,
}

impl EnergyGate {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            speech: Vec::new(),
            in_speech: false,
            trailing_ms: 0,
            idle_ms: 0,
        }
    }

    pub fn feed(&mut self, samples: &[i16]) -> GateEvent {
        let ms = samples.len() as u64 * 1000 / ASR_SAMPLE_RATE as u64;
        let voiced = audio::rms(samples) >= self.threshold;

        if voiced {
            self.in_speech = true;
            self.trailing_ms = 0;
            self.idle_ms = 0;
            self.speech.extend_from_slice(samples);
        } else if self.in_speech {
            self.speech.extend_from_slice(samples);
            self.trailing_ms += ms;
            if self.trailing_ms >= END_OF_SPEECH_MS {
                return self.close_utterance();
            }
        } else {
            self.idle_ms += ms;
            if self.idle_ms >= SILENCE_TIMEOUT_MS {
                self.idle_ms = 0;
                return GateEvent::Silence;
            }
        }

        if self.speech.len() as u64 * 1000 / ASR_SAMPLE_RATE as u64 >= MAX_UTTERANCE_MS {
            return self.close_utterance();
        }
        GateEvent::None
    }

    pub fn reset(&mut self) {
        self.speech.clear();
        self.in_speech = false;
        self.trailing_ms = 0;
        self.idle_ms = 0;
    }

    fn close_utterance(&mut self) -> GateEvent {
        self.in_speech = false;
        self.trailing_ms = 0;
        GateEvent::Utterance(std::mem::take(&mut self.speech))
    }
}

struct Inner {
    client: Client<OpenAIConfig>,
    model: String,
    gate: Mutex<EnergyGate>,
    listener: RwLock<Option<Weak<dyn AsrListener>>>,
    silence_count: AtomicU32,
    /// Bumped by `reset`; results from an older epoch are dropped.
    epoch: AtomicU64,
    /// Set once the listener asked to stop; cleared by `reset`.
    finished: AtomicBool,
}

pub struct WhisperAsr {
    inner: Arc<Inner>,
}

impl WhisperAsr {
    pub fn new(config: OpenAIConfig, model: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client: Client::with_config(config),
                model: model.into(),
                gate: Mutex::new(EnergyGate::new(DEFAULT_THRESHOLD)),
                listener: RwLock::new(None),
                silence_count: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                finished: AtomicBool::new(false),
            }),
        }
    }
}

impl Inner {
    fn listener(&self) -> Option<Arc<dyn AsrListener>> {
        self.listener.read().ok()?.as_ref()?.upgrade()
    }

    async fn transcribe(&self, pcm: Vec<i16>) -> Result<String> {
        let wav = audio::encode_wav(&pcm, ASR_SAMPLE_RATE)?;
        let request = CreateTranscriptionRequestArgs::default()
            .file(AudioInput::from_vec_u8("utterance.wav".to_string(), wav))
            .model(self.model.clone())
            .build()?;
        let response = self.client.audio().transcribe(request).await?;
        Ok(response.text.trim().to_string())
    }

    /// Delivers `text` unless a reset happened since `epoch` was taken.
    async fn notify(&self, text: String, epoch: u64) {
        if self.epoch.load(Ordering::Acquire) != epoch {
            debug!("Dropping recognition result from before reset");
            return;
        }
        let Some(listener) = self.listener() else {
            return;
        };
        let stop = listener.on_asr_result(text).await;
        if stop && self.epoch.load(Ordering::Acquire) == epoch {
            self.finished.store(true, Ordering::Release);
        }
    }
}

#[async_trait]
impl AsrProvider for WhisperAsr {
    fn set_listener(&self, listener: Weak<dyn AsrListener>) {
        match self.inner.listener.write() {
            Ok(mut slot) => *slot = Some(listener),
            Err(poisoned) => *poisoned.into_inner() = Some(listener),
        }
    }

    async fn add_audio(&self, pcm: Bytes) -> Result<()> {
        if self.inner.finished.load(Ordering::Acquire) {
            return Ok(());
        }
        let samples = audio::pcm16_from_bytes(&pcm);
        let event = match self.inner.gate.lock() {
            Ok(mut gate) => gate.feed(&samples),
            Err(_) => anyhow::bail!("recognizer state poisoned"),
        };
        let epoch = self.inner.epoch.load(Ordering::Acquire);

        match event {
            GateEvent::None => {}
            GateEvent::Utterance(pcm) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    match inner.transcribe(pcm).await {
                        Ok(text) if !text.is_empty() => {
                            inner.silence_count.store(0, Ordering::Release);
                            inner.notify(text, epoch).await;
                        }
                        Ok(_) => debug!("Transcription was empty"),
                        Err(e) => error!(error = %e, "Transcription failed"),
                    }
                });
            }
            GateEvent::Silence => {
                let count = self.inner.silence_count.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(count, "No speech detected");
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.notify(String::new(), epoch).await });
            }
        }
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut gate) = self.inner.gate.lock() {
            gate.reset();
        }
        self.inner.silence_count.store(0, Ordering::Release);
        self.inner.finished.store(false, Ordering::Release);
        Ok(())
    }

    fn silence_count(&self) -> u32 {
        self.inner.silence_count.load(Ordering::Acquire)
    }
}
