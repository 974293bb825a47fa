//! Text helpers shared by the speech path: cleanup before synthesis,
//! phrase matching for wake words, exit commands and quick replies, and JSON
//! recovery from free-form model output.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static SPLIT_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.,!?;。！？；：]+").unwrap());

static MARKDOWN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(!\[.*?\]\(.*?\)|\[(.*?)\]\(.*?\)|\*\*|__|\*|~~|`{1,3}|#{1,6}\s|^>\s|\|)")
        .unwrap()
});

static ALL_PUNCTUATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"[.,!?;:，。！？、；：“”‘’"'「」『』（）()【】\[\]{}《》〈〉—–\-_~·…‖|\\/*&^%$#@+=<>]"#,
    )
    .unwrap()
});

/// Strips emoji and pictographic symbols, including joiners and variation
/// selectors that only make sense next to them.
pub fn remove_emoji(text: &str) -> String {
    text.chars().filter(|c| !is_emoji(*c)).collect()
}

fn is_emoji(c: char) -> bool {
    matches!(c as u32,
        0x1F000..=0x1FAFF // pictographs, regional indicators, emoticons and the rest
        | 0x2600..=0x27BF // misc symbols and dingbats
        | 0x2B00..=0x2BFF // arrows and stars
        | 0xFE00..=0xFE0F // variation selectors
        | 0x200D // zero width joiner
        | 0x20E3 // combining keycap
        | 0xE0020..=0xE007F // tags
    )
}

/// Removes markdown emphasis, headings, code fences, table pipes and images.
/// Link syntax is reduced to its label.
pub fn remove_markdown(text: &str) -> String {
    text.lines()
        .map(|line| {
            MARKDOWN
                .replace_all(line, |caps: &regex::Captures| {
                    caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default()
                })
                .into_owned()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Emoji plus markdown removal, trimmed. This is what reaches the synthesizer.
pub fn clean_for_speech(text: &str) -> String {
    remove_markdown(&remove_emoji(text)).trim().to_string()
}

pub fn remove_punctuation(text: &str) -> String {
    ALL_PUNCTUATION.replace_all(text, "").into_owned()
}

/// Splits on sentence punctuation, dropping blank pieces.
pub fn split_by_punctuation(text: &str) -> Vec<String> {
    SPLIT_PUNCTUATION
        .split(text)
        .filter(|part| !part.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Cuts `text` to at most `max_bytes` without splitting a character.
pub fn truncate_on_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Lowercased, punctuation-free, whitespace-collapsed form used for phrase
/// comparisons.
pub fn normalize(text: &str) -> String {
    remove_punctuation(&remove_emoji(text))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// True when `text` equals one of `phrases` after normalization.
pub fn matches_phrase(text: &str, phrases: &[String]) -> bool {
    let text = normalize(text);
    !text.is_empty() && phrases.iter().any(|p| normalize(p) == text)
}

/// True when `text` starts with one of the wake prefixes and carries more
/// content after it, e.g. "你好小智".
pub fn is_wake_up_word(text: &str, prefixes: &[String]) -> bool {
    let text = normalize(text);
    prefixes.iter().any(|prefix| {
        let prefix = normalize(prefix);
        if prefix.is_empty() {
            return false;
        }
        let Some(rest) = text.strip_prefix(&prefix) else {
            return false;
        };
        // Latin prefixes must end on a word boundary: "hi" is not "hint".
        let glued = prefix.ends_with(|c: char| c.is_ascii_alphanumeric())
            && rest.starts_with(|c: char| c.is_alphanumeric());
        !glued && !rest.trim().is_empty()
    })
}

/// Extracts the first balanced `{...}` object from `input` and parses it.
///
/// Braces are matched by depth counting starting from the first `{`, so
/// leading chatter and trailing text are ignored.
pub fn extract_json_object(input: &str) -> Option<Map<String, Value>> {
    let start = input.find('{')?;
    let mut depth = 0usize;
    let mut end = None;
    for (offset, byte) in input.as_bytes()[start..].iter().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + offset);
                    break;
                }
            }
            _ => {}
        }
    }
    let candidate = &input[start..=end?];
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
