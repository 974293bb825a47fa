//! In-memory providers and transport for session tests.

use crate::connection::{Connection, Frame};
use crate::dialogue::Message;
use crate::providers::{
    AsrListener, AsrProvider, ChunkStream, LlmChunk, LlmProvider, TextStream, ToolDefinition,
    TtsProvider,
};
use crate::tool_call::ToolCallFragment;
use crate::tts::VOICES;
use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Polls `condition` until it holds, panicking after three seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct FakeConnection {
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    written: Mutex<Vec<Frame>>,
    closes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl FakeConnection {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn push_json(&self, value: Value) {
        self.push(Frame::Text(value.to_string()));
    }

    pub fn push_audio(&self, audio: &[u8]) {
        self.push(Frame::Binary(Bytes::copy_from_slice(audio)));
    }

    fn push(&self, frame: Frame) {
        if let Some(tx) = self.inbound_tx.lock().unwrap().as_ref() {
            tx.send(frame).unwrap();
        }
    }

    /// Simulates the peer going away.
    pub fn hang_up(&self) {
        self.inbound_tx.lock().unwrap().take();
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Every text frame written so far, parsed.
    pub fn messages(&self) -> Vec<Value> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => serde_json::from_str(text).ok(),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    pub fn messages_of(&self, kind: &str) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|m| m["type"] == kind)
            .collect()
    }

    /// `tts` states in the order they were written.
    pub fn tts_states(&self) -> Vec<String> {
        self.messages_of("tts")
            .iter()
            .map(|m| m["state"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    /// Text of every `sentence_start`, in order.
    pub fn spoken_sentences(&self) -> Vec<String> {
        self.messages_of("tts")
            .iter()
            .filter(|m| m["state"] == "sentence_start")
            .map(|m| m["text"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn stt_texts(&self) -> Vec<String> {
        self.messages_of("stt")
            .iter()
            .map(|m| m["text"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn binary_count(&self) -> usize {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter(|f| matches!(f, Frame::Binary(_)))
            .count()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn write_message(&self, frame: Frame) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("broken pipe");
        }
        self.written.lock().unwrap().push(frame);
        Ok(())
    }

    async fn read_message(&self, stop: &CancellationToken) -> Result<Option<Frame>> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = stop.cancelled() => Ok(None),
            frame = rx.recv() => Ok(frame),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Recognizer driven by the test through [`FakeAsr::emit`].
#[derive(Default)]
pub struct FakeAsr {
    listener: Mutex<Option<Weak<dyn AsrListener>>>,
    silence: AtomicU32,
    resets: AtomicUsize,
    audio: Mutex<Vec<Bytes>>,
}

impl FakeAsr {
    /// Delivers a recognition result and returns the listener's answer.
    pub async fn emit(&self, text: &str) -> bool {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        match listener {
            Some(listener) => listener.on_asr_result(text.to_string()).await,
            None => false,
        }
    }

    pub fn set_silence_count(&self, count: u32) {
        self.silence.store(count, Ordering::SeqCst);
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn audio_bytes(&self) -> usize {
        self.audio.lock().unwrap().iter().map(Bytes::len).sum()
    }
}

#[async_trait]
impl AsrProvider for FakeAsr {
    fn set_listener(&self, listener: Weak<dyn AsrListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    async fn add_audio(&self, pcm: Bytes) -> Result<()> {
        self.audio.lock().unwrap().push(pcm);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.silence.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn silence_count(&self) -> u32 {
        self.silence.load(Ordering::SeqCst)
    }
}

/// One scripted LLM response.
pub enum Script {
    Chunks(Vec<LlmChunk>),
    Fail(String),
}

impl Script {
    /// Plain text streamed word by word.
    pub fn text(reply: &str) -> Self {
        Script::Chunks(
            reply
                .split_inclusive(' ')
                .map(|word| LlmChunk::Content(word.to_string()))
                .collect(),
        )
    }

    /// A structured tool call split over two fragments.
    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Self {
        Script::Chunks(vec![
            LlmChunk::ToolCall(ToolCallFragment {
                id: Some(id.into()),
                name: Some(name.into()),
                ..Default::default()
            }),
            LlmChunk::ToolCall(ToolCallFragment {
                arguments: Some(arguments.into()),
                ..Default::default()
            }),
        ])
    }
}

/// LLM that replays scripts in order and records every request.
#[derive(Default)]
pub struct ScriptedLlm {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<Vec<Message>>>,
    chunk_delay: Mutex<Duration>,
}

impl ScriptedLlm {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        *self.chunk_delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self, messages: &[Message]) -> Result<(Vec<LlmChunk>, Duration)> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::text("OK."));
        match script {
            Script::Chunks(chunks) => Ok((chunks, *self.chunk_delay.lock().unwrap())),
            Script::Fail(reason) => bail!(reason),
        }
    }
}

fn delayed<T: Send + 'static>(
    items: Vec<T>,
    delay: Duration,
) -> impl futures::Stream<Item = Result<T>> + Send {
    futures::stream::iter(items).then(move |item| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(item)
    })
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn response(&self, _session_id: &str, messages: &[Message]) -> Result<TextStream> {
        let (chunks, delay) = self.next(messages)?;
        let text: Vec<String> = chunks
            .into_iter()
            .filter_map(|chunk| match chunk {
                LlmChunk::Content(text) => Some(text),
                LlmChunk::ToolCall(_) => None,
            })
            .collect();
        Ok(Box::pin(delayed(text, delay)))
    }

    async fn response_with_functions(
        &self,
        _session_id: &str,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ChunkStream> {
        let (chunks, delay) = self.next(messages)?;
        Ok(Box::pin(delayed(chunks, delay)))
    }
}

/// Synthesizer writing the segment text into a file under a temp dir.
pub struct FakeTts {
    dir: tempfile::TempDir,
    voice: Mutex<String>,
    spoken: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    fail_on: Mutex<Option<String>>,
    counter: AtomicUsize,
}

impl Default for FakeTts {
    fn default() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            voice: Mutex::new("alloy".into()),
            spoken: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            fail_on: Mutex::new(None),
            counter: AtomicUsize::new(0),
        }
    }
}

impl FakeTts {
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Makes synthesis of exactly `text` fail.
    pub fn fail_on(&self, text: &str) {
        *self.fail_on.lock().unwrap() = Some(text.to_string());
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    /// Audio files still on disk.
    pub fn file_count(&self) -> usize {
        std::fs::read_dir(self.dir.path()).unwrap().count()
    }
}

#[async_trait]
impl TtsProvider for FakeTts {
    async fn to_speech(&self, text: &str) -> Result<PathBuf> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_on.lock().unwrap().as_deref() == Some(text) {
            bail!("synthesis failed for '{text}'");
        }
        self.spoken.lock().unwrap().push(text.to_string());
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.path().join(format!("segment-{n}.wav"));
        tokio::fs::write(&path, text.as_bytes()).await?;
        Ok(path)
    }

    fn set_voice(&self, voice: &str) -> Result<()> {
        if !VOICES.contains(&voice) {
            bail!("unknown voice '{voice}'");
        }
        *self.voice.lock().unwrap() = voice.to_string();
        Ok(())
    }

    fn voice(&self) -> String {
        self.voice.lock().unwrap().clone()
    }

    fn name(&self) -> &str {
        "fake"
    }
}
