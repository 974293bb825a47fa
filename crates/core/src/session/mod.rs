//! Session Orchestrator
//!
//! One [`Session`] per client connection. It owns the connection, the four
//! pipeline queues with their workers, the talk-round counter and the
//! interruption flag, and it drives listen-mode decisions, LLM replies and
//! tool calls through the provider traits.
//!
//! Audio flows `read loop → audio queue → ASR → on_asr_result → turn →
//! synthesis queue → TTS worker → delivery queue → delivery worker →
//! connection`. Chat and control messages take the text queue instead.

mod pipeline;
mod turn;
mod workers;

#[cfg(test)]
mod tests;

pub use pipeline::{DeliveryTask, QUEUE_CAPACITY, SynthesisTask, TaskQueue};

use crate::audio::AudioDecoder;
use crate::connection::{Connection, Frame};
use crate::dialogue::DialogueStore;
use crate::error::{Result, SessionError};
use crate::listen::{ListenDecision, ListenMode, ListenState};
use crate::protocol::{ServerMessage, TtsState};
use crate::providers::{AsrListener, ProviderSet};
use crate::quick_reply::QuickReplyCache;
use crate::tools::ToolExecutor;
use async_trait::async_trait;
use bytes::Bytes;
use pipeline::RoundProgress;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Instruction dispatched in place of a transcript after repeated silence.
pub const SILENCE_PROMPT: &str =
    "The user has not said anything for a long time. Politely end the conversation.";

/// Spoken when a reply could not be produced.
pub const APOLOGY: &str = "Sorry, something went wrong while handling your request.";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant. \
Your answers are spoken aloud, so keep them short and conversational. \
Never use markdown, lists, code blocks or emoji.";

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Flags shared between the session and its built-in tools.
#[derive(Debug, Default)]
pub struct SessionFlags {
    interrupted: AtomicBool,
    close_after_turn: AtomicBool,
}

impl SessionFlags {
    /// Marks the reply in flight as stopped. Synthesis and delivery check
    /// this before every segment.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Close the session once the current reply has been delivered.
    pub fn mark_close_after_turn(&self) {
        self.close_after_turn.store(true, Ordering::Release);
    }

    pub fn close_after_turn(&self) -> bool {
        self.close_after_turn.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub system_prompt: String,
    pub listen_mode: ListenMode,
    /// Turns fed to the LLM besides the system turn; `0` sends everything.
    pub max_history_turns: usize,
    /// Nested tool calls allowed within one talk-round.
    pub max_tool_rounds: usize,
    /// Delete synthesized audio once delivered or drained.
    pub delete_audio: bool,
    pub quick_reply: bool,
    pub quick_reply_words: Vec<String>,
    pub wake_words: Vec<String>,
    pub exit_commands: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            listen_mode: ListenMode::Auto,
            max_history_turns: 20,
            max_tool_rounds: 4,
            delete_audio: true,
            quick_reply: false,
            quick_reply_words: vec!["I'm here!".into(), "Yes?".into(), "Go ahead.".into()],
            wake_words: vec!["你好".into(), "hello".into(), "hi".into()],
            exit_commands: vec!["再见".into(), "拜拜".into(), "goodbye".into(), "bye bye".into()],
        }
    }
}

struct TurnSlot {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

pub struct Session {
    id: String,
    device_id: Option<String>,
    config: SessionConfig,
    providers: ProviderSet,
    tools: Arc<dyn ToolExecutor>,
    quick_replies: Option<Arc<QuickReplyCache>>,
    flags: Arc<SessionFlags>,
    initial_voice: String,
    me: Weak<Session>,

    conn: Arc<dyn Connection>,
    stop: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,

    talk_round: AtomicU64,
    progress: Mutex<RoundProgress>,
    listen: Mutex<ListenState>,
    dialogue: tokio::sync::Mutex<DialogueStore>,
    decoder: Mutex<Option<Box<dyn AudioDecoder>>>,
    turn: Mutex<TurnSlot>,

    audio_in: TaskQueue<Bytes>,
    text_in: TaskQueue<String>,
    synthesis: TaskQueue<SynthesisTask>,
    delivery: TaskQueue<DeliveryTask>,
}

impl Session {
    /// Creates a session bound to `conn` and registers it as the ASR
    /// listener. Replies can be written as soon as this returns, before
    /// [`Session::handle`] starts reading.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        device_id: Option<String>,
        conn: Arc<dyn Connection>,
        config: SessionConfig,
        providers: ProviderSet,
        tools: Arc<dyn ToolExecutor>,
        flags: Arc<SessionFlags>,
        quick_replies: Option<Arc<QuickReplyCache>>,
    ) -> Arc<Self> {
        let stop = CancellationToken::new();
        let mut dialogue = DialogueStore::new();
        dialogue.set_system_message(&config.system_prompt);
        let initial_voice = providers.tts.voice();
        let listen = ListenState::new(config.listen_mode);

        let session = Arc::new_cyclic(|me| Session {
            id: id.into(),
            device_id,
            providers,
            tools,
            quick_replies,
            flags,
            initial_voice,
            me: me.clone(),
            conn,
            turn: Mutex::new(TurnSlot {
                cancel: stop.child_token(),
                task: None,
            }),
            stop,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            talk_round: AtomicU64::new(0),
            progress: Mutex::new(RoundProgress::default()),
            listen: Mutex::new(listen),
            dialogue: tokio::sync::Mutex::new(dialogue),
            decoder: Mutex::new(None),
            audio_in: TaskQueue::new("audio", QUEUE_CAPACITY),
            text_in: TaskQueue::new("text", QUEUE_CAPACITY),
            synthesis: TaskQueue::new("synthesis", QUEUE_CAPACITY),
            delivery: TaskQueue::new("delivery", QUEUE_CAPACITY),
            config,
        });
        let weak: Weak<Session> = Arc::downgrade(&session);
        let listener: Weak<dyn AsrListener> = weak;
        session.providers.asr.set_listener(listener);
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn flags(&self) -> &Arc<SessionFlags> {
        &self.flags
    }

    pub fn listen_mode(&self) -> ListenMode {
        lock(&self.listen).mode()
    }

    pub fn talk_round(&self) -> u64 {
        self.talk_round.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cancelled when the session closes.
    pub fn stop_signal(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Snapshot of the dialogue, system turn included.
    pub async fn history(&self) -> Vec<crate::dialogue::Message> {
        self.dialogue.lock().await.turns().to_vec()
    }

    /// Runs the session until the peer disconnects, a transport error occurs
    /// or the session is closed. The session is always closed and its
    /// workers joined before this returns.
    pub async fn handle(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SessionError::Connection("session is already running".into()));
        }
        let span = tracing::Span::current();
        let workers = [
            tokio::spawn(self.clone().audio_worker().instrument(span.clone())),
            tokio::spawn(self.clone().text_worker().instrument(span.clone())),
            tokio::spawn(self.clone().tts_worker().instrument(span.clone())),
            tokio::spawn(self.clone().delivery_worker().instrument(span)),
        ];
        info!(mode = %self.listen_mode(), "Session started");

        let result = self.read_loop(self.conn.as_ref()).await;
        if let Err(e) = &result {
            error!(error = %e, "Read loop failed, closing session");
        }
        self.close().await;

        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Session worker panicked");
            }
        }
        let last_turn = lock(&self.turn).task.take();
        if let Some(task) = last_turn {
            let _ = task.await;
        }
        info!("Session finished");
        result
    }

    async fn read_loop(&self, conn: &dyn Connection) -> Result<()> {
        loop {
            let frame = match conn.read_message(&self.stop).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => return Err(SessionError::Connection(format!("{e:#}"))),
            };
            let queued = match frame {
                Frame::Text(text) => self.text_in.push(text).await,
                Frame::Binary(audio) => self.audio_in.push(audio).await,
            };
            match queued {
                Ok(()) => {}
                Err(_) if self.stop.is_cancelled() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Stops the reply in flight: sets the interruption flag, drains both
    /// output queues, cancels generation and tells the client playback
    /// stopped. The aborted round never reaches `end_round`, so the
    /// recognizer is re-armed here.
    pub async fn abort(&self) {
        info!(round = self.talk_round(), "Aborting current reply");
        self.stop_server_speak().await;
        self.cancel_turn();
        lock(&self.progress).stop_sent = true;
        if let Err(e) = self.send_tts(TtsState::Stop, None, None).await {
            warn!(error = %e, "Failed to send tts stop");
        }
        self.clear_speak_status().await;
    }

    /// Tears the session down. Safe to call any number of times from any
    /// task; only the first call has an effect.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("Closing session");
        self.stop.cancel();
        self.cancel_turn();
        self.audio_in.close();
        self.text_in.close();
        self.synthesis.close();
        self.delivery.close();

        let decoder = lock(&self.decoder).take();
        if let Some(mut decoder) = decoder {
            decoder.close();
        }
        if let Err(e) = self.providers.tts.set_voice(&self.initial_voice) {
            warn!(error = %e, voice = %self.initial_voice, "Failed to restore initial voice");
        }
        if let Err(e) = self.providers.asr.reset().await {
            warn!(error = %e, "Failed to reset recognizer");
        }
        self.flush("session closed").await;
        if let Err(e) = self.conn.close().await {
            debug!(error = %e, "Connection close failed");
        }
    }

    /// Interrupts playback and drops everything queued for synthesis and
    /// delivery.
    async fn stop_server_speak(&self) {
        debug!("Server stops speaking");
        self.flags.interrupt();
        self.flush("reply interrupted").await;
    }

    async fn flush(&self, reason: &'static str) {
        let dropped = self.synthesis.drain();
        if !dropped.is_empty() {
            info!(count = dropped.len(), reason, "Dropped queued synthesis tasks");
        }
        for task in self.delivery.drain() {
            debug!(round = task.round, index = task.index, reason, "Dropped queued audio");
            if let Some(path) = &task.file_path {
                self.discard_audio(path).await;
            }
        }
    }

    /// Deletes a temp audio file unless it belongs to the quick reply cache
    /// or deletion is disabled.
    async fn discard_audio(&self, path: &Path) {
        if !self.config.delete_audio {
            return;
        }
        if let Some(cache) = &self.quick_replies {
            if cache.is_cached_file(path) {
                return;
            }
        }
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Failed to delete audio file");
        }
    }

    fn cancel_turn(&self) {
        lock(&self.turn).cancel.cancel();
    }

    /// Cancels the previous turn and hands out a token for the next one.
    fn begin_turn(&self) -> CancellationToken {
        let mut slot = lock(&self.turn);
        slot.cancel.cancel();
        slot.cancel = self.stop.child_token();
        slot.cancel.clone()
    }

    /// Re-arms the recognizer once a reply has been fully spoken.
    async fn clear_speak_status(&self) {
        debug!("Clearing speak status");
        if let Err(e) = self.providers.asr.reset().await {
            warn!(error = %e, "Failed to reset recognizer");
        }
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        self.conn
            .write_message(frame)
            .await
            .map_err(|e| SessionError::Connection(format!("{e:#}")))
    }

    async fn send(&self, message: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(message).map_err(anyhow::Error::from)?;
        self.write(Frame::Text(json)).await
    }

    async fn send_tts(&self, state: TtsState, text: Option<String>, index: Option<u32>) -> Result<()> {
        self.send(&ServerMessage::Tts {
            state,
            text,
            index,
            session_id: self.id.clone(),
        })
        .await
    }

    async fn dispatch(&self, text: &str) {
        if let Err(e) = self.handle_chat(text).await {
            self.report(e, "Failed to dispatch utterance").await;
        }
    }

    /// Logs a failed operation. Transport failures end the session.
    async fn report(&self, e: SessionError, what: &'static str) {
        match e {
            SessionError::Connection(_) => {
                error!(error = %e, "{what}, closing session");
                self.close().await;
            }
            SessionError::Closed => debug!("{what}: session is closed"),
            e => warn!(error = %e, "{what}"),
        }
    }
}

#[async_trait]
impl AsrListener for Session {
    async fn on_asr_result(&self, text: String) -> bool {
        if self.is_closed() {
            return true;
        }
        let silence_count = self.providers.asr.silence_count();
        let text = if text.trim().is_empty() { "" } else { text.as_str() };
        let decision = lock(&self.listen).on_asr_result(text, silence_count);
        let mode = self.listen_mode();

        match &decision {
            ListenDecision::Continue | ListenDecision::Cancelled => {}
            ListenDecision::Dispatch(utterance) => {
                info!(%mode, text = %utterance, "Utterance recognized");
                self.dispatch(utterance).await;
            }
            ListenDecision::BargeIn(utterance) => {
                info!(%mode, text = %utterance, "User interrupted the reply");
                self.stop_server_speak().await;
                self.cancel_turn();
                if let Err(e) = self.providers.asr.reset().await {
                    warn!(error = %e, "Failed to reset recognizer");
                }
                self.dispatch(utterance).await;
            }
            ListenDecision::SilenceTimeout => {
                info!(silence_count, "No speech detected twice in a row, ending conversation");
                self.flags.mark_close_after_turn();
                self.dispatch(SILENCE_PROMPT).await;
            }
        }
        decision.stops_listening()
    }
}
