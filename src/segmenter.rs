//! Byte-bounded text chunking.
//!
//! The service rejects WebSocket messages over 64 KiB, so long inputs are
//! split into chunks that fit once wrapped in the request envelope. The
//! envelope itself is not known here; the caller passes the byte budget.

use crate::error::{Result, TTSError};

/// Smallest accepted budget: one code point always fits.
pub const MIN_BUDGET_BYTES: usize = 4;

/// Replace control characters that XML 1.0 does not allow with spaces.
///
/// Tab, line feed and carriage return are kept.
pub fn remove_incompatible_characters(text: &str) -> String {
    text.chars()
        .map(|c| match c as u32 {
            0..=8 | 11..=12 | 14..=31 => ' ',
            _ => c,
        })
        .collect()
}

/// Split `text` into chunks of at most `budget` UTF-8 bytes.
///
/// The text is normalized with [`remove_incompatible_characters`] first.
pub fn segment(text: &str, budget: usize) -> Result<TextSegmenter> {
    TextSegmenter::new(remove_incompatible_characters(text), budget)
}

/// Lazy iterator over the chunks of one input text.
#[derive(Debug, Clone)]
pub struct TextSegmenter {
    text: String,
    cursor: usize,
    budget: usize,
}

impl TextSegmenter {
    /// Chunk already-normalized text.
    pub fn new(text: String, budget: usize) -> Result<Self> {
        if budget < MIN_BUDGET_BYTES {
            return Err(TTSError::Configuration(format!(
                "Chunk budget of {} bytes is below the minimum of {}",
                budget, MIN_BUDGET_BYTES
            )));
        }
        Ok(Self {
            text,
            cursor: 0,
            budget,
        })
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    fn split_point(&self, rest: &str) -> usize {
        let window = floor_char_boundary(rest, self.budget);
        let head = &rest[..window];

        let preferred = head
            .rfind('\n')
            .map(|i| i + 1)
            .or_else(|| {
                head.char_indices()
                    .rev()
                    .find(|(_, c)| c.is_whitespace())
                    .map(|(i, c)| i + c.len_utf8())
            })
            .unwrap_or(window);

        match avoid_entity_split(rest, preferred) {
            0 => match avoid_entity_split(rest, window) {
                // the entity is longer than the whole window
                0 => window,
                split => split,
            },
            split => split,
        }
    }
}

impl Iterator for TextSegmenter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let rest = &self.text[self.cursor..];
        if rest.is_empty() {
            return None;
        }
        if rest.len() <= self.budget {
            self.cursor = self.text.len();
            return Some(rest.to_string());
        }

        let split = self.split_point(rest);
        let chunk = rest[..split].to_string();
        self.cursor += split;
        Some(chunk)
    }
}

/// Largest char boundary in `s` that is `<= index`.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Move `split` back so it does not cut an `&...;` entity in half.
///
/// Returns 0 when the only option would be an empty chunk.
fn avoid_entity_split(text: &str, mut split: usize) -> usize {
    while split > 0 {
        let head = &text[..split];
        let Some(amp) = head.rfind('&') else {
            break;
        };
        if head[amp..].contains(';') {
            break;
        }
        split = amp;
    }
    split
}
