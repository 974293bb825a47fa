//! Segmentation Engine
//!
//! Decides where a growing LLM reply can be cut into a speakable fragment.
//! Cuts prefer strong sentence punctuation and fall back to weaker boundaries
//! only as the unconsumed text grows, so the first words reach the speaker
//! quickly without producing pathologically short fragments.

const STRONG: &[&str] = &["。", "？", "！", "；", ".", "?", "!", ";"];
const MEDIUM: &[&str] = &["，", "：", ",", ":"];
const LIGHT: &[&str] = &["、", "）", ")", "】", "]", "》", ">", "`", "'"];

const MEDIUM_THRESHOLD: usize = 30;
const LIGHT_THRESHOLD: usize = 50;
const SPACE_THRESHOLD: usize = 80;
const FORCE_THRESHOLD: usize = 100;
const FORCE_CUT: usize = 80;

/// Cuts the longest speakable prefix of `text`.
///
/// Returns the segment and the number of bytes consumed; `("", 0)` means the
/// caller must keep accumulating. All lengths are byte lengths and every cut
/// falls on a char boundary.
pub fn cut_segment(text: &str) -> (&str, usize) {
    let len = text.len();
    if len == 0 {
        return ("", 0);
    }

    if let Some(end) = last_match_end(text, STRONG, 2.min(len - 1)) {
        return (&text[..end], end);
    }

    let min_weak = 8.min(len / 2);
    if len > MEDIUM_THRESHOLD {
        if let Some(end) = last_match_end(text, MEDIUM, min_weak) {
            return (&text[..end], end);
        }
    }
    if len > LIGHT_THRESHOLD {
        if let Some(end) = last_match_end(text, LIGHT, min_weak) {
            return (&text[..end], end);
        }
    }
    if len > SPACE_THRESHOLD {
        // The space itself stays with the next segment.
        if let Some(pos) = text.rfind(' ').filter(|&pos| pos >= min_weak && pos > 0) {
            return (&text[..pos], pos);
        }
    }
    if len > FORCE_THRESHOLD {
        let cut = floor_char_boundary(text, FORCE_CUT);
        if cut > 0 {
            return (&text[..cut], cut);
        }
    }
    ("", 0)
}

/// End offset (exclusive) of the right-most punctuation match that starts at
/// or after `min_start`.
fn last_match_end(text: &str, marks: &[&str], min_start: usize) -> Option<usize> {
    marks
        .iter()
        .filter_map(|mark| {
            text.rmatch_indices(mark)
                .find(|(start, _)| *start >= min_start)
                .map(|(start, m)| start + m.len())
        })
        .max()
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Streaming wrapper around [`cut_segment`].
///
/// Tokens are pushed as they arrive; every speakable segment is returned in
/// order. [`finish`](Self::finish) yields whatever was left unconsumed.
#[derive(Debug, Default)]
pub struct Segmenter {
    buffer: String,
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);
        let mut segments = Vec::new();
        loop {
            let (segment, consumed) = cut_segment(&self.buffer);
            if consumed == 0 {
                break;
            }
            segments.push(segment.to_string());
            self.buffer.drain(..consumed);
        }
        segments
    }

    /// Returns the unconsumed remainder, if any, and resets the buffer.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }
}
