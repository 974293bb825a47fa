use thiserror::Error;

/// Errors surfaced by a voice session.
///
/// Only `Connection` and `Closed` end a session; everything else is recovered
/// locally, usually by speaking an apology.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("empty input: {0}")]
    EmptyInput(&'static str),

    #[error("provider failure: {0:#}")]
    Provider(#[from] anyhow::Error),

    #[error("malformed tool call: {0}")]
    MalformedToolCall(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("the current turn was cancelled")]
    Cancelled,

    #[error("tool call depth exceeded ({0} rounds)")]
    ToolDepthExceeded(usize),

    #[error("session is closed")]
    Closed,

    #[error("{0} queue is closed")]
    QueueClosed(&'static str),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
