//! Tool-Call Accumulator
//!
//! Collects streamed function-call fragments and plain content from one LLM
//! response and resolves them into a single executable call once the stream
//! ends.

use crate::dialogue::ToolCall;
use crate::text;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Content marker some models emit instead of a structured tool call.
pub const TOOL_CALL_OPEN: &str = "<tool_call>";
const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// One partial tool call as streamed by the model. Every field may be absent
/// or empty in any given chunk. `index` tells parallel calls apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Outcome of a finished response.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// No tool call was requested; the content was plain speech.
    Text,
    /// A complete call ready for execution.
    Call(ToolCall),
    /// A tool call was signalled but could not be reconstructed.
    Malformed {
        reason: String,
        /// Plain content with tool markers removed, possibly empty.
        content: String,
    },
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    content: String,
    calls: BTreeMap<u32, PartialCall>,
    active: bool,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a content chunk. Returns `true` when the chunk is user-facing
    /// speech, `false` once a tool call has been signalled.
    pub fn push_content(&mut self, chunk: &str) -> bool {
        self.content.push_str(chunk);
        if !self.active && self.content.trim_start().starts_with(TOOL_CALL_OPEN) {
            self.active = true;
        }
        !self.active
    }

    /// Merges a structured fragment into the call with the same index. Names
    /// are never overwritten by empty values; arguments are concatenated.
    pub fn push_fragment(&mut self, fragment: &ToolCallFragment) {
        self.active = true;
        let call = self.calls.entry(fragment.index).or_default();
        if let Some(id) = fragment.id.as_deref().filter(|s| !s.is_empty()) {
            call.id = id.to_string();
        }
        if let Some(name) = fragment.name.as_deref().filter(|s| !s.is_empty()) {
            call.name = name.to_string();
        }
        if let Some(arguments) = fragment.arguments.as_deref() {
            call.arguments.push_str(arguments);
        }
    }

    pub fn is_tool_call(&self) -> bool {
        self.active
    }

    /// All content received so far, markers included.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Resolves the accumulated state into a call.
    ///
    /// Only the lowest-index call is executed when the model asked for
    /// several. Without an explicit call id the call is recovered from the
    /// first JSON object found in the plain content and a fresh id is
    /// synthesized.
    pub fn finish(mut self) -> Resolution {
        if !self.active {
            return Resolution::Text;
        }
        let speakable = self.speakable_content();

        let first = self.calls.pop_first().map(|(_, call)| call);
        if !self.calls.is_empty() {
            let ignored: Vec<&str> = self.calls.values().map(|c| c.name.as_str()).collect();
            warn!(?ignored, "Model requested parallel tool calls, running only the first");
        }
        let (id, name, arguments) = match first.filter(|call| !call.id.is_empty()) {
            Some(call) => (call.id, call.name, call.arguments),
            None => {
                match recover_from_content(&self.content) {
                    Some((name, arguments)) => (synthesize_call_id(), name, arguments),
                    None => {
                        return Resolution::Malformed {
                            reason: "no tool call id and no JSON call in content".into(),
                            content: speakable,
                        };
                    }
                }
            }
        };

        if name.is_empty() {
            return Resolution::Malformed {
                reason: "tool call without a function name".into(),
                content: speakable,
            };
        }
        let arguments = if arguments.trim().is_empty() {
            "{}".to_string()
        } else {
            arguments
        };
        if let Err(e) = serde_json::from_str::<Value>(&arguments) {
            return Resolution::Malformed {
                reason: format!("arguments for '{name}' are not valid JSON: {e}"),
                content: speakable,
            };
        }
        Resolution::Call(ToolCall {
            id,
            name,
            arguments,
        })
    }

    fn speakable_content(&self) -> String {
        let stripped = self
            .content
            .replace(TOOL_CALL_OPEN, "")
            .replace(TOOL_CALL_CLOSE, "");
        // A leftover JSON call is never speech.
        match text::extract_json_object(&stripped) {
            Some(_) => String::new(),
            None => stripped.trim().to_string(),
        }
    }
}

fn recover_from_content(content: &str) -> Option<(String, String)> {
    let object = text::extract_json_object(content)?;
    let name = object.get("name")?.as_str()?.to_string();
    let arguments = match object.get("arguments") {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(raw)) => raw.clone(),
        Some(other) => other.to_string(),
    };
    Some((name, arguments))
}

fn synthesize_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}
