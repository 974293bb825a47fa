//! Dialogue Store
//!
//! An ordered history of conversation turns with an optional pinned system
//! turn. The store feeds every LLM call of a session and is mutated by it:
//! user utterances, assistant replies and tool results are appended as the
//! talk-round progresses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The author of a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A function call requested by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: String,
}

/// One turn of the dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Set on `assistant` turns that request tool execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `tool` turns; references the call this turn answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// An assistant turn carrying a pending tool call.
    pub fn assistant_tool_call(call: ToolCall) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: vec![call],
            tool_call_id: None,
        }
    }

    /// The result of executing the tool call identified by `call_id`.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// Ordered turn history. At most one `system` turn exists, always at index 0.
#[derive(Debug, Clone, Default)]
pub struct DialogueStore {
    turns: Vec<Message>,
}

impl DialogueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pinned system turn, replacing the existing one in place.
    /// An empty prompt is ignored.
    pub fn set_system_message(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.turns.first_mut() {
            Some(first) if first.role == Role::System => first.content = text.to_string(),
            _ => self.turns.insert(0, Message::system(text)),
        }
    }

    /// Appends a turn. System turns are routed through `set_system_message`
    /// so the single-system-turn invariant holds.
    pub fn append(&mut self, turn: Message) {
        if turn.role == Role::System {
            self.set_system_message(&turn.content);
            return;
        }
        self.turns.push(turn);
    }

    /// The system turn (if any) followed by the last `max_turns` turns.
    ///
    /// When `max_turns` is zero or the history is not longer than `max_turns`
    /// the full history is returned.
    pub fn recent(&self, max_turns: usize) -> Vec<Message> {
        if max_turns == 0 || self.turns.len() <= max_turns {
            return self.turns.clone();
        }
        let tail = &self.turns[self.turns.len() - max_turns..];
        match self.system_turn() {
            Some(system) => std::iter::once(system.clone())
                .chain(tail.iter().cloned())
                .collect(),
            None => tail.to_vec(),
        }
    }

    /// Destructive form of [`recent`](Self::recent).
    pub fn trim_to_recent(&mut self, max_turns: usize) {
        if max_turns == 0 || self.turns.len() <= max_turns {
            return;
        }
        let cut = self.turns.len() - max_turns;
        if self.system_turn().is_some() {
            // `cut >= 1` here, so the system turn itself is never in the tail.
            self.turns.drain(1..cut.max(1));
        } else {
            self.turns.drain(..cut);
        }
    }

    pub fn turns(&self) -> &[Message] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Drops everything except the system turn.
    pub fn clear(&mut self) {
        self.turns.retain(|t| t.role == Role::System);
    }

    /// Serializes the history to JSON, optionally without the system turn.
    pub fn serialize(&self, keep_system: bool) -> serde_json::Result<String> {
        let turns = match self.system_turn() {
            Some(_) if !keep_system => &self.turns[1..],
            _ => &self.turns[..],
        };
        serde_json::to_string(turns)
    }

    /// Replaces the history with a snapshot produced by [`serialize`](Self::serialize).
    ///
    /// System turns found after index 0 are folded into the pinned one.
    pub fn deserialize(&mut self, json: &str) -> serde_json::Result<()> {
        let turns: Vec<Message> = serde_json::from_str(json)?;
        let system = self.system_turn().cloned();
        self.turns.clear();
        if let Some(system) = system {
            self.turns.push(system);
        }
        for turn in turns {
            self.append(turn);
        }
        Ok(())
    }

    fn system_turn(&self) -> Option<&Message> {
        self.turns.first().filter(|t| t.role == Role::System)
    }
}
