//! The four pipeline workers of a session.

use super::{DeliveryTask, Session, SynthesisTask, lock};
use crate::audio;
use crate::connection::Frame;
use crate::error::{Result, SessionError};
use crate::listen::{ListenDecision, ListenMode};
use crate::protocol::{ClientMessage, ListenCommand, ServerMessage, TtsState};
use crate::text;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl Session {
    /// Forwards inbound audio to the recognizer. Audio is still drained but
    /// ignored once the session is closing after the current reply.
    pub(super) async fn audio_worker(self: Arc<Self>) {
        loop {
            let frame = tokio::select! {
                _ = self.stop.cancelled() => break,
                frame = self.audio_in.pop() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if self.flags.close_after_turn() {
                continue;
            }
            let decoded = {
                let mut decoder = lock(&self.decoder);
                match decoder.as_mut() {
                    Some(decoder) => decoder.decode(&frame),
                    None => Ok(frame.to_vec()),
                }
            };
            match decoded {
                Ok(pcm) if pcm.is_empty() => {}
                Ok(pcm) => {
                    if let Err(e) = self.providers.asr.add_audio(Bytes::from(pcm)).await {
                        error!(error = %e, "Failed to feed audio to the recognizer");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to decode client audio"),
            }
        }
        debug!("Audio worker stopped");
    }

    pub(super) async fn text_worker(self: Arc<Self>) {
        loop {
            let message = tokio::select! {
                _ = self.stop.cancelled() => break,
                message = self.text_in.pop() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Err(e) = self.process_text_message(&message).await {
                self.report(e, "Failed to handle client message").await;
            }
        }
        debug!("Text worker stopped");
    }

    async fn process_text_message(&self, raw: &str) -> Result<()> {
        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring unrecognized client message");
                return Ok(());
            }
        };

        match message {
            ClientMessage::Hello { audio_params, .. } => {
                let params = audio_params.unwrap_or_default();
                info!(
                    format = %params.format,
                    sample_rate = params.sample_rate,
                    channels = params.channels,
                    "Client hello"
                );
                let decoder =
                    audio::decoder_for(&params.format, params.sample_rate, params.channels)?;
                *lock(&self.decoder) = Some(decoder);
                self.send(&ServerMessage::Hello {
                    transport: "websocket".into(),
                    session_id: self.id.clone(),
                    audio_params: params,
                })
                .await
            }
            ClientMessage::Listen { state, mode, text } => {
                self.handle_listen(state, mode, text).await
            }
            ClientMessage::Chat { text } => self.handle_chat(&text).await,
            ClientMessage::Abort { reason } => {
                info!(reason = reason.as_deref().unwrap_or(""), "Client aborted the reply");
                self.abort().await;
                Ok(())
            }
        }
    }

    async fn handle_listen(
        &self,
        state: ListenCommand,
        mode: Option<ListenMode>,
        text: Option<String>,
    ) -> Result<()> {
        match state {
            ListenCommand::Start => {
                let discarded = lock(&self.listen).start(mode);
                info!(mode = %self.listen_mode(), "Client started listening");
                if discarded {
                    self.abort().await;
                }
                Ok(())
            }
            ListenCommand::Stop => {
                let decision = {
                    let mut listen = lock(&self.listen);
                    if let Some(mode) = mode {
                        listen.set_mode(mode);
                    }
                    listen.stop()
                };
                info!(mode = %self.listen_mode(), "Client stopped listening");
                match decision {
                    ListenDecision::Dispatch(utterance) => self.handle_chat(&utterance).await,
                    ListenDecision::Cancelled => {
                        info!("Nothing recognized before stop, cancelling");
                        self.abort().await;
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            ListenCommand::Detect => match text.filter(|t| !t.trim().is_empty()) {
                Some(wake_word) => {
                    info!(text = %wake_word, "Wake word detected on device");
                    self.handle_chat(&wake_word).await
                }
                None => Ok(()),
            },
        }
    }

    /// Synthesizes queued segments in order. Every task yields exactly one
    /// delivery task, with no file when there was nothing to speak.
    pub(super) async fn tts_worker(self: Arc<Self>) {
        loop {
            let task = tokio::select! {
                _ = self.stop.cancelled() => break,
                task = self.synthesis.pop() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            let delivery = self.synthesize(task).await;
            if let Err(e) = self.delivery.push(delivery).await {
                debug!(error = %e, "Delivery queue closed");
                break;
            }
        }
        debug!("TTS worker stopped");
    }

    async fn synthesize(&self, task: SynthesisTask) -> DeliveryTask {
        let mut delivery = DeliveryTask {
            file_path: task.file_path,
            text: task.text,
            round: task.round,
            index: task.index,
        };
        if delivery.file_path.is_some() || delivery.text.is_empty() {
            return delivery;
        }
        if delivery.round != self.talk_round() || self.flags.is_interrupted() {
            debug!(round = delivery.round, index = delivery.index, "Skipping stale segment");
            return delivery;
        }
        if let Some(cached) = self.cached_quick_reply(&delivery.text) {
            debug!(path = %cached.display(), "Using cached quick reply audio");
            delivery.file_path = Some(cached);
            return delivery;
        }

        match self.providers.tts.to_speech(&delivery.text).await {
            Ok(path) => {
                self.cache_quick_reply(&delivery.text, &path).await;
                if self.flags.is_interrupted() {
                    info!(index = delivery.index, "Reply interrupted, dropping synthesized audio");
                    self.discard_audio(&path).await;
                } else {
                    delivery.file_path = Some(path);
                }
            }
            Err(e) => error!(
                round = delivery.round,
                index = delivery.index,
                error = %e,
                "Speech synthesis failed"
            ),
        }
        delivery
    }

    fn is_quick_reply(&self, text: &str) -> bool {
        self.quick_replies.is_some() && text::matches_phrase(text, &self.config.quick_reply_words)
    }

    fn cached_quick_reply(&self, text: &str) -> Option<PathBuf> {
        if !self.is_quick_reply(text) {
            return None;
        }
        let cache = self.quick_replies.as_ref()?;
        cache.find(self.providers.tts.name(), &self.providers.tts.voice(), text)
    }

    async fn cache_quick_reply(&self, text: &str, path: &Path) {
        if !self.is_quick_reply(text) {
            return;
        }
        let Some(cache) = &self.quick_replies else {
            return;
        };
        let tts = &self.providers.tts;
        match cache.save(tts.name(), &tts.voice(), text, path).await {
            Ok(cached) => info!(path = %cached.display(), "Cached quick reply audio"),
            Err(e) => warn!(error = %e, "Failed to cache quick reply audio"),
        }
    }

    /// Writes synthesized segments to the connection in queue order.
    pub(super) async fn delivery_worker(self: Arc<Self>) {
        loop {
            let task = tokio::select! {
                _ = self.stop.cancelled() => break,
                task = self.delivery.pop() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            if let Err(e) = self.deliver(task).await {
                error!(error = %e, "Audio delivery failed, closing session");
                self.close().await;
                break;
            }
        }
        debug!("Delivery worker stopped");
    }

    async fn deliver(&self, task: DeliveryTask) -> Result<()> {
        if task.round != self.talk_round() || self.flags.is_interrupted() {
            debug!(round = task.round, index = task.index, "Dropping stale audio");
            if let Some(path) = &task.file_path {
                self.discard_audio(path).await;
            }
            return Ok(());
        }

        if let Some(path) = &task.file_path {
            let sent = self.send_segment(&task, path).await;
            self.discard_audio(path).await;
            match sent {
                Ok(()) => {}
                Err(e @ SessionError::Connection(_)) => return Err(e),
                Err(e) => error!(index = task.index, error = %e, "Failed to send segment"),
            }
        }
        self.mark_delivered(task.round, task.index).await;
        Ok(())
    }

    async fn send_segment(&self, task: &DeliveryTask, path: &Path) -> Result<()> {
        let audio = tokio::fs::read(path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        debug!(round = task.round, index = task.index, bytes = audio.len(), "Sending segment");
        self.send_tts(TtsState::SentenceStart, Some(task.text.clone()), Some(task.index))
            .await?;
        self.write(Frame::Binary(Bytes::from(audio))).await?;
        self.send_tts(TtsState::SentenceEnd, Some(task.text.clone()), Some(task.index))
            .await
    }

    async fn mark_delivered(&self, round: u64, index: u32) {
        let finished = {
            let mut progress = lock(&self.progress);
            if progress.round != round {
                return;
            }
            if index <= progress.delivered {
                warn!(round, index, delivered = progress.delivered, "Segment delivered out of order");
            }
            progress.delivered = progress.delivered.max(index);
            progress.take_finished()
        };
        if finished {
            self.end_round(round).await;
        }
    }

    /// Sent once the last segment of a round has been delivered.
    pub(super) async fn end_round(&self, round: u64) {
        info!(round, "Reply finished");
        if let Err(e) = self.send_tts(TtsState::Stop, None, None).await {
            warn!(error = %e, "Failed to send tts stop");
        }
        if self.flags.close_after_turn() {
            info!("Closing session after the final reply");
            self.close().await;
        } else {
            self.clear_speak_status().await;
        }
    }
}
