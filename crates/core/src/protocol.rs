//! JSON control messages exchanged with the device. Audio travels in binary
//! frames and is not described here.

use crate::listen::ListenMode;
use serde::{Deserialize, Serialize};

/// Audio format negotiated in `hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_frame_duration")]
    pub frame_duration: u32,
}

fn default_format() -> String {
    "pcm".into()
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_channels() -> u16 {
    1
}

fn default_frame_duration() -> u32 {
    60
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: default_format(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_duration: default_frame_duration(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenCommand {
    Start,
    Stop,
    Detect,
}

/// Messages sent by the device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        #[serde(default)]
        version: Option<u32>,
        #[serde(default)]
        transport: Option<String>,
        #[serde(default)]
        audio_params: Option<AudioParams>,
    },
    Listen {
        state: ListenCommand,
        #[serde(default)]
        mode: Option<ListenMode>,
        /// Wake word recognized on the device, sent with `detect`.
        #[serde(default)]
        text: Option<String>,
    },
    Chat {
        text: String,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
    SentenceEnd,
}

/// Messages sent to the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        transport: String,
        session_id: String,
        audio_params: AudioParams,
    },
    /// Recognized text of a dispatched utterance.
    Stt { text: String, session_id: String },
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
        session_id: String,
    },
}
