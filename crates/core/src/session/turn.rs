//! Talk-rounds: dispatching an utterance, streaming the LLM reply into
//! speech segments and running the tool-call loop.

use super::{APOLOGY, Session, SynthesisTask, lock};
use crate::dialogue::{Message, Role, ToolCall};
use crate::error::{Result, SessionError};
use crate::protocol::{ServerMessage, TtsState};
use crate::providers::{LlmChunk, ToolDefinition};
use crate::segment::Segmenter;
use crate::text;
use crate::tool_call::{Resolution, ToolCallAccumulator};
use crate::tools::ToolAction;
use futures::StreamExt;
use rand::seq::IndexedRandom;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Marker providers embed in streamed content when the upstream service
/// failed mid-response.
pub const SERVICE_FAILURE_MARKER: &str = "服务响应异常";

/// Longest segment handed to the synthesizer, in bytes.
pub const MAX_SEGMENT_BYTES: usize = 255;

impl Session {
    /// Starts a new talk-round for a complete utterance or chat message.
    ///
    /// Sends the recognized text and `tts start`, then either answers with a
    /// quick reply or spawns the LLM turn. Empty text aborts the reply in
    /// flight and is rejected; an exit command closes the session.
    pub async fn handle_chat(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            warn!("Received empty chat message");
            self.abort().await;
            return Err(SessionError::EmptyInput("chat text"));
        }
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if text::matches_phrase(text, &self.config.exit_commands) {
            info!(text, "Exit command received");
            self.close().await;
            return Ok(());
        }

        let round = self.talk_round.fetch_add(1, Ordering::AcqRel) + 1;
        lock(&self.progress).begin(round);
        let cancel = self.begin_turn();
        self.flags.clear_interrupt();
        info!(round, text, "Starting talk round");

        self.send(&ServerMessage::Stt {
            text: text.to_string(),
            session_id: self.id.clone(),
        })
        .await?;
        self.send_tts(TtsState::Start, None, None).await?;

        if let Some(reply) = self.quick_reply_for(text, round) {
            info!(round, %reply, "Answering wake word with a quick reply");
            self.speak_segment(round, &reply).await?;
            self.finish_round(round).await;
            return Ok(());
        }

        self.dialogue.lock().await.append(Message::user(text));
        let Some(this) = self.me.upgrade() else {
            return Err(SessionError::Closed);
        };
        let task = tokio::spawn(
            async move { this.run_turn(round, cancel).await }.instrument(tracing::Span::current()),
        );
        lock(&self.turn).task = Some(task);
        Ok(())
    }

    fn quick_reply_for(&self, text: &str, round: u64) -> Option<String> {
        if !self.config.quick_reply
            || round != 1
            || !text::is_wake_up_word(text, &self.config.wake_words)
        {
            return None;
        }
        self.config
            .quick_reply_words
            .choose(&mut rand::rng())
            .cloned()
    }

    async fn run_turn(self: Arc<Self>, round: u64, cancel: CancellationToken) {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            outcome = self.respond(round) => outcome,
        };
        self.trim_history().await;
        match outcome {
            Ok(()) => {}
            Err(SessionError::Cancelled) => {
                debug!(round, "Turn cancelled");
                return;
            }
            Err(e) => {
                error!(round, error = %e, "Failed to produce a reply");
                if let Err(e) = self.speak_segment(round, APOLOGY).await {
                    debug!(round, error = %e, "Apology was not queued");
                    if matches!(e, SessionError::Cancelled) {
                        return;
                    }
                }
            }
        }
        self.finish_round(round).await;
    }

    /// Streams replies until the model answers without calling a tool or the
    /// tool-call depth is exhausted.
    async fn respond(&self, round: u64) -> Result<()> {
        let definitions = self.tools.definitions();
        let mut depth = 0;
        loop {
            let messages = self.llm_window().await;
            let Some(call) = self.stream_reply(round, &messages, &definitions).await? else {
                return Ok(());
            };
            if depth >= self.config.max_tool_rounds {
                return Err(SessionError::ToolDepthExceeded(depth));
            }
            depth += 1;
            if !self.run_tool(round, call).await? {
                return Ok(());
            }
        }
    }

    /// Keeps the stored dialogue at twice the LLM window so a long-lived
    /// connection does not grow it without bound.
    async fn trim_history(&self) {
        let keep = self.config.max_history_turns.saturating_mul(2);
        let mut dialogue = self.dialogue.lock().await;
        let before = dialogue.len();
        dialogue.trim_to_recent(keep);
        if dialogue.len() < before {
            debug!(dropped = before - dialogue.len(), "Trimmed dialogue history");
        }
    }

    /// Recent history for the LLM, without tool turns whose assistant call
    /// was trimmed away.
    async fn llm_window(&self) -> Vec<Message> {
        let mut window = self
            .dialogue
            .lock()
            .await
            .recent(self.config.max_history_turns);
        let start = usize::from(window.first().is_some_and(|m| m.role == Role::System));
        let orphans = window[start..]
            .iter()
            .take_while(|m| m.role == Role::Tool)
            .count();
        if orphans > 0 {
            debug!(orphans, "Skipping tool turns without their call");
            window.drain(start..start + orphans);
        }
        window
    }

    /// Runs one LLM call. Speech segments are queued as tokens arrive;
    /// returns the tool call the model requested, if any.
    async fn stream_reply(
        &self,
        round: u64,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Option<ToolCall>> {
        let started = Instant::now();
        let mut stream = self
            .providers
            .llm
            .response_with_functions(&self.id, messages, tools)
            .await?;

        let mut accumulator = ToolCallAccumulator::new();
        let mut segmenter = Segmenter::new();
        let mut reply = String::new();
        let mut first_segment = true;

        while let Some(chunk) = stream.next().await {
            match chunk? {
                LlmChunk::Content(content) => {
                    if content.contains(SERVICE_FAILURE_MARKER) {
                        return Err(SessionError::Provider(anyhow::anyhow!(
                            "LLM service reported a failure: {content}"
                        )));
                    }
                    if !accumulator.push_content(&content) {
                        continue;
                    }
                    reply.push_str(&content);
                    for segment in segmenter.push(&content) {
                        if first_segment {
                            first_segment = false;
                            info!(
                                round,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "First segment ready"
                            );
                        }
                        self.speak_segment(round, &segment).await?;
                    }
                }
                LlmChunk::ToolCall(fragment) => accumulator.push_fragment(&fragment),
            }
        }

        match accumulator.finish() {
            Resolution::Text => {
                if let Some(rest) = segmenter.finish() {
                    self.speak_segment(round, &rest).await?;
                }
                if !reply.trim().is_empty() {
                    self.dialogue.lock().await.append(Message::assistant(reply));
                }
                Ok(None)
            }
            Resolution::Call(call) => {
                if let Some(rest) = segmenter.finish() {
                    debug!(text = %rest, "Dropping text that preceded a tool call");
                }
                Ok(Some(call))
            }
            Resolution::Malformed { reason, content } => {
                warn!(round, %reason, "Abandoning malformed tool call");
                if !reply.trim().is_empty() {
                    if let Some(rest) = segmenter.finish() {
                        self.speak_segment(round, &rest).await?;
                    }
                    self.dialogue.lock().await.append(Message::assistant(reply));
                    return Ok(None);
                }
                if content.is_empty() {
                    return Err(SessionError::MalformedToolCall(reason));
                }
                self.system_speak(round, &content).await?;
                self.dialogue.lock().await.append(Message::assistant(content));
                Ok(None)
            }
        }
    }

    /// Executes a tool call. Returns `true` when the LLM should be asked
    /// again with the result.
    async fn run_tool(&self, round: u64, call: ToolCall) -> Result<bool> {
        info!(round, tool = %call.name, arguments = %call.arguments, "Executing tool call");
        let action = match self.tools.execute_tool(&call.name, &call.arguments).await {
            Ok(action) => action,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool call failed");
                ToolAction::RequestLlm(e.to_string())
            }
        };

        match action {
            ToolAction::RequestLlm(result) => {
                debug!(tool = %call.name, %result, "Tool result goes back to the LLM");
                self.record_tool_call(call, result).await;
                Ok(true)
            }
            ToolAction::Respond(reply) => {
                info!(tool = %call.name, "Tool answered directly");
                self.record_tool_call(call, reply.clone()).await;
                self.system_speak(round, &reply).await?;
                self.dialogue.lock().await.append(Message::assistant(reply));
                Ok(false)
            }
            ToolAction::NoAction => {
                info!(tool = %call.name, "Tool call needs no follow-up");
                Ok(false)
            }
        }
    }

    async fn record_tool_call(&self, call: ToolCall, result: String) {
        let call_id = call.id.clone();
        let mut dialogue = self.dialogue.lock().await;
        dialogue.append(Message::assistant_tool_call(call));
        dialogue.append(Message::tool(call_id, result));
    }

    /// Splits text on punctuation and queues every piece as a segment of the
    /// current round.
    async fn system_speak(&self, round: u64, text: &str) -> Result<()> {
        let parts = text::split_by_punctuation(text);
        if parts.is_empty() {
            return Err(SessionError::EmptyInput("system speech"));
        }
        for part in parts {
            self.speak_segment(round, &part).await?;
        }
        Ok(())
    }

    /// Queues one segment; segments with nothing speakable are skipped.
    async fn speak_segment(&self, round: u64, segment: &str) -> Result<()> {
        let segment = segment.trim();
        if segment.is_empty() {
            return Ok(());
        }
        match self.speak(round, segment).await {
            Ok(index) => {
                debug!(round, index, text = segment, "Queued segment");
                Ok(())
            }
            Err(SessionError::EmptyInput(what)) => {
                debug!(round, what, "Segment has nothing to speak");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Cleans `text` for speech and queues it under the next segment index.
    ///
    /// A segment that cleans down to nothing is still queued as an empty
    /// placeholder so delivery accounting stays in step, and is reported as
    /// [`SessionError::EmptyInput`].
    async fn speak(&self, round: u64, text: &str) -> Result<u32> {
        if self.flags.is_interrupted() {
            return Err(SessionError::Cancelled);
        }
        let mut cleaned = text::clean_for_speech(text);
        if cleaned.len() > MAX_SEGMENT_BYTES {
            warn!(len = cleaned.len(), "Segment too long, truncating");
            cleaned = text::truncate_on_char_boundary(&cleaned, MAX_SEGMENT_BYTES).to_string();
        }

        let index = {
            let mut progress = lock(&self.progress);
            if progress.round != round || progress.final_index.is_some() {
                return Err(SessionError::Cancelled);
            }
            progress.next_index()
        };
        let empty = cleaned.is_empty();
        self.synthesis
            .push(SynthesisTask {
                text: cleaned,
                round,
                index,
                file_path: None,
            })
            .await?;
        if empty {
            return Err(SessionError::EmptyInput("speech text"));
        }
        Ok(index)
    }

    /// Records that generation for `round` is complete. `tts stop` follows
    /// immediately when everything has already been delivered.
    async fn finish_round(&self, round: u64) {
        let finished = {
            let mut progress = lock(&self.progress);
            if progress.round != round {
                return;
            }
            progress.final_index = Some(progress.last_index);
            debug!(round, segments = progress.last_index, "Generation complete");
            progress.take_finished()
        };
        if finished {
            self.end_round(round).await;
        }
    }
}
