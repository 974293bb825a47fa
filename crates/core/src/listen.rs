//! Listen-Mode State Machine
//!
//! Decides, for every ASR result, whether an utterance is complete and
//! whether the reply currently being spoken must be interrupted. The state is
//! pure; the session applies the returned [`ListenDecision`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Consecutive silence detections after which the conversation is wrapped up.
pub const SILENCE_LIMIT: u32 = 2;

/// How the client delimits utterances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// Client pushes-to-talk; text accumulates until `listen stop`.
    Manual,
    /// Every non-empty result is an utterance.
    #[default]
    Auto,
    /// Like `Auto`, and every result interrupts the reply in flight.
    Realtime,
}

impl fmt::Display for ListenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenMode::Manual => write!(f, "manual"),
            ListenMode::Auto => write!(f, "auto"),
            ListenMode::Realtime => write!(f, "realtime"),
        }
    }
}

/// What the session must do with an ASR result or a listen command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenDecision {
    /// Keep listening; nothing to dispatch.
    Continue,
    /// Dispatch a complete utterance.
    Dispatch(String),
    /// Interrupt the reply in flight, reset the recognizer, then dispatch.
    BargeIn(String),
    /// The user stayed silent too long: dispatch the farewell instruction and
    /// close once it has been spoken.
    SilenceTimeout,
    /// A manual-mode stop with nothing recognized; abort the current reply.
    Cancelled,
}

impl ListenDecision {
    /// Whether the recognizer should stop listening for this utterance.
    pub fn stops_listening(&self) -> bool {
        matches!(
            self,
            ListenDecision::Dispatch(_) | ListenDecision::BargeIn(_) | ListenDecision::SilenceTimeout
        )
    }
}

#[derive(Debug, Default)]
pub struct ListenState {
    mode: ListenMode,
    client_stopped: bool,
    buffer: String,
}

impl ListenState {
    pub fn new(mode: ListenMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn mode(&self) -> ListenMode {
        self.mode
    }

    pub fn client_stopped(&self) -> bool {
        self.client_stopped
    }

    /// Applies one recognizer callback.
    pub fn on_asr_result(&mut self, text: &str, silence_count: u32) -> ListenDecision {
        if silence_count >= SILENCE_LIMIT {
            self.buffer.clear();
            return ListenDecision::SilenceTimeout;
        }
        match self.mode {
            ListenMode::Auto if !text.is_empty() => ListenDecision::Dispatch(text.to_string()),
            ListenMode::Realtime if !text.is_empty() => ListenDecision::BargeIn(text.to_string()),
            ListenMode::Auto | ListenMode::Realtime => ListenDecision::Continue,
            ListenMode::Manual => {
                self.buffer.push_str(text);
                self.take_manual_utterance()
            }
        }
    }

    /// `listen start`: the client begins a new utterance.
    ///
    /// Returns `true` when a pending manual buffer was discarded, in which
    /// case the reply in flight should be aborted.
    pub fn start(&mut self, mode: Option<ListenMode>) -> bool {
        if let Some(mode) = mode {
            self.mode = mode;
        }
        self.client_stopped = false;
        let discarded = !self.buffer.is_empty();
        self.buffer.clear();
        discarded
    }

    /// `listen stop`: the client finished talking.
    pub fn stop(&mut self) -> ListenDecision {
        self.client_stopped = true;
        if self.mode != ListenMode::Manual {
            return ListenDecision::Continue;
        }
        match self.take_manual_utterance() {
            ListenDecision::Continue => ListenDecision::Cancelled,
            decision => decision,
        }
    }

    /// Switches mode without touching the stop flag.
    pub fn set_mode(&mut self, mode: ListenMode) {
        if mode != ListenMode::Manual {
            self.buffer.clear();
        }
        self.mode = mode;
    }

    fn take_manual_utterance(&mut self) -> ListenDecision {
        if self.client_stopped && !self.buffer.is_empty() {
            ListenDecision::Dispatch(std::mem::take(&mut self.buffer))
        } else {
            ListenDecision::Continue
        }
    }
}
