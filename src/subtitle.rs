//! SRT subtitle generation from word-boundary events.

use crate::error::{Result, TTSError};
use crate::TTSEvent;
use once_cell::sync::Lazy;
use regex::Regex;

static LATIN_THEN_CJK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z])([\x{4e00}-\x{9fff}])").expect("valid regex"));
static CJK_THEN_LATIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\x{4e00}-\x{9fff}])([A-Za-z])").expect("valid regex"));
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static SPACE_BEFORE_PUNCTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r" ([,.!?，。！？、])").expect("valid regex"));
static SPACE_AFTER_PUNCTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([,.!?，。！？、]) ").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleConfig {
    pub words_per_cue: usize,
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self { words_per_cue: 10 }
    }
}

/// Cue timing in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CueTimestamp {
    pub start: u64,
    pub duration: u64,
    pub end: u64,
}

impl CueTimestamp {
    /// `None` when `start + duration` does not fit in a `u64`.
    pub fn new(start: u64, duration: u64) -> Option<Self> {
        start.checked_add(duration).map(|end| Self {
            start,
            duration,
            end,
        })
    }

    fn spanning(start: u64, end: u64) -> Self {
        Self {
            start,
            duration: end.saturating_sub(start),
            end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleCue {
    pub index: usize,
    pub timestamp: CueTimestamp,
    pub text: String,
}

/// Accumulates cues and renders them as SubRip text.
#[derive(Debug, Default)]
pub struct SubRipBuilder {
    cues: Vec<SubtitleCue>,
}

impl SubRipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cues(&self) -> &[SubtitleCue] {
        &self.cues
    }

    /// Append a cue for a word-boundary event (hundred-nanosecond units).
    pub fn add_cue(&mut self, event: &TTSEvent) -> Result<()> {
        let TTSEvent::WordBoundary {
            offset,
            duration,
            text,
        } = event
        else {
            return Err(TTSError::Usage(
                "Invalid event type, expected a word boundary".to_string(),
            ));
        };

        let timestamp = CueTimestamp::new(offset / 10, duration / 10).ok_or_else(|| {
            TTSError::UnexpectedResponse(format!(
                "Cue at {} with duration {} overflows the timeline",
                offset, duration
            ))
        })?;
        self.cues.push(SubtitleCue {
            index: self.cues.len() + 1,
            timestamp,
            text: normalize_text(text),
        });
        Ok(())
    }

    /// Merge neighbouring cues while the merged cue stays within
    /// `words_per_cue` words.
    pub fn merge_cues(&mut self, words_per_cue: usize) -> Result<()> {
        if words_per_cue == 0 {
            return Err(TTSError::Usage(
                "Invalid number of words to merge, expected > 0".to_string(),
            ));
        }
        if self.cues.is_empty() {
            return Ok(());
        }

        self.sort();
        let mut cues = std::mem::take(&mut self.cues).into_iter();
        let mut merged = Vec::new();

        let Some(mut current) = cues.next() else {
            return Ok(());
        };
        let mut current_words = count_words(&current.text);

        for cue in cues {
            let next_words = count_words(&cue.text);
            if current_words + next_words > words_per_cue {
                merged.push(current);
                current = cue;
                current_words = next_words;
                continue;
            }

            current.text = normalize_text(&join_text(&current.text, &cue.text));
            current.timestamp = CueTimestamp::spanning(current.timestamp.start, cue.timestamp.end);
            current_words = count_words(&current.text);
        }
        merged.push(current);

        for (i, cue) in merged.iter_mut().enumerate() {
            cue.index = i + 1;
        }
        self.cues = merged;
        Ok(())
    }

    pub fn generate(&mut self) -> String {
        self.sort();
        self.cues
            .iter()
            .map(|cue| {
                format!(
                    "{}\n{} --> {}\n{}",
                    cue.index,
                    format_timestamp(cue.timestamp.start),
                    format_timestamp(cue.timestamp.end),
                    cue.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn reset(&mut self) {
        self.cues.clear();
    }

    fn sort(&mut self) {
        self.cues.sort_by_key(|cue| cue.timestamp.start);
    }
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// CJK ideographs count one word each; any other whitespace-delimited run
/// counts as one word.
pub fn count_words(text: &str) -> usize {
    let mut words = 0;
    let mut in_word = false;
    for c in text.chars() {
        if is_cjk(c) {
            words += 1;
            in_word = false;
        } else if c.is_whitespace() {
            in_word = false;
        } else if !in_word {
            words += 1;
            in_word = true;
        }
    }
    words
}

/// Normalize spacing between Latin and CJK text and around punctuation.
pub fn normalize_text(text: &str) -> String {
    let text = LATIN_THEN_CJK.replace_all(text, "$1 $2");
    let text = CJK_THEN_LATIN.replace_all(&text, "$1 $2");
    let text = WHITESPACE_RUN.replace_all(&text, " ");
    let text = SPACE_BEFORE_PUNCTUATION.replace_all(&text, "$1");
    let text = SPACE_AFTER_PUNCTUATION.replace_all(&text, "$1");
    text.trim().to_string()
}

/// Word-boundary texts carry no separators; keep Latin words apart.
fn join_text(left: &str, right: &str) -> String {
    let glue = match (left.chars().last(), right.chars().next()) {
        (Some(l), Some(r)) if !is_cjk(l) && !is_cjk(r) => " ",
        _ => "",
    };
    format!("{}{}{}", left, glue, right)
}

/// `HH:MM:SS,mmm`, truncating microseconds.
fn format_timestamp(micros: u64) -> String {
    let total_ms = micros / 1000;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let seconds = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, seconds, millis)
}
