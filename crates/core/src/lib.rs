//! Per-connection orchestration for a real-time voice assistant.
//!
//! A [`Session`] turns client audio into recognized utterances, streams LLM
//! replies through tool calls and speech synthesis, and delivers the audio
//! back over a [`Connection`] while honouring barge-in and abort requests.

pub mod asr;
pub mod audio;
pub mod connection;
pub mod control;
pub mod dialogue;
pub mod error;
pub mod listen;
pub mod llm_client;
pub mod protocol;
pub mod providers;
pub mod quick_reply;
pub mod segment;
pub mod session;
pub mod text;
pub mod tool_call;
pub mod tools;
pub mod tts;

#[cfg(test)]
mod test_support;

pub use connection::{Connection, Frame};
pub use error::{Result, SessionError};
pub use listen::ListenMode;
pub use providers::{AsrProvider, LlmFactory, LlmProvider, ProviderSet, TtsProvider};
pub use session::{Session, SessionConfig, SessionFlags};
