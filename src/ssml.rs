//! Request markup for the read-aloud service.
//!
//! The session treats markup as opaque: a [`MarkupProvider`] escapes the
//! caller's text, renders one chunk into a request body and reports how many
//! bytes of text fit in one WebSocket message.

use crate::error::{Result, TTSError};
use crate::frame::{date_string, encode_request_frame};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

/// Largest WebSocket message the service accepts.
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Slack left for the parts of the frame that vary between requests.
const MESSAGE_SIZE_SLACK: usize = 50;

pub const DEFAULT_VOICE: &str = "en-US-EmmaMultilingualNeural";

static SHORT_VOICE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z]{2,})-([A-Z]{2,})-(.+Neural)$").expect("valid regex")
});
static FULL_VOICE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Microsoft Server Speech Text to Speech Voice \(.+,.+\)$").expect("valid regex")
});
static PERCENT_ADJUSTMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]\d+%$").expect("valid regex"));
static HERTZ_ADJUSTMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]\d+Hz$").expect("valid regex"));

/// Voice and prosody settings for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceConfig {
    pub voice: String,
    pub rate: String,
    pub volume: String,
    pub pitch: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice: DEFAULT_VOICE.to_string(),
            rate: "+0%".to_string(),
            volume: "+0%".to_string(),
            pitch: "+0Hz".to_string(),
        }
    }
}

impl VoiceConfig {
    pub fn with_voice(voice: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
            ..Default::default()
        }
    }

    /// Validate the prosody values and expand a short voice name
    /// (`en-US-EmmaMultilingualNeural`) into the service's full form.
    pub fn validated(mut self) -> Result<Self> {
        self.voice = full_voice_name(&self.voice)?;

        for (name, value) in [("rate", &self.rate), ("volume", &self.volume)] {
            if !PERCENT_ADJUSTMENT.is_match(value) {
                return Err(TTSError::Configuration(format!(
                    "Invalid {} '{}', expected a signed percentage like +0%",
                    name, value
                )));
            }
        }
        if !HERTZ_ADJUSTMENT.is_match(&self.pitch) {
            return Err(TTSError::Configuration(format!(
                "Invalid pitch '{}', expected a signed frequency like +0Hz",
                self.pitch
            )));
        }
        Ok(self)
    }
}

fn full_voice_name(voice: &str) -> Result<String> {
    let voice = voice.trim();
    if FULL_VOICE_NAME.is_match(voice) {
        return Ok(voice.to_string());
    }
    if let Some(caps) = SHORT_VOICE_NAME.captures(voice) {
        let mut region = caps[2].to_string();
        let mut name = &caps[3];
        // zh-CN-liaoning-XiaobeiNeural: the sub-region belongs to the locale
        if let Some((sub_region, rest)) = name.split_once('-') {
            region = format!("{}-{}", region, sub_region);
            name = rest;
        }
        return Ok(format!(
            "Microsoft Server Speech Text to Speech Voice ({}-{}, {})",
            &caps[1], region, name
        ));
    }
    Err(TTSError::Configuration(format!("Invalid voice '{}'", voice)))
}

/// Produces request bodies for chunks of text.
pub trait MarkupProvider: Send + Sync {
    /// Transform caller text before segmentation (e.g. escaping).
    fn prepare_text(&self, text: &str) -> String {
        text.to_string()
    }

    /// Render one chunk into the body of an `ssml` request frame.
    fn render(&self, config: &VoiceConfig, chunk: &str) -> String;

    /// Byte budget for a chunk under `config`.
    fn max_chunk_bytes(&self, config: &VoiceConfig) -> usize;
}

/// Default SSML envelope used by the Edge browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SsmlMarkup;

impl MarkupProvider for SsmlMarkup {
    fn prepare_text(&self, text: &str) -> String {
        escape_xml(text)
    }

    fn render(&self, config: &VoiceConfig, chunk: &str) -> String {
        format!(
            "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xml:lang='en-US'>\
             <voice name='{}'><prosody pitch='{}' rate='{}' volume='{}'>{}</prosody></voice></speak>",
            config.voice, config.pitch, config.rate, config.volume, chunk
        )
    }

    fn max_chunk_bytes(&self, config: &VoiceConfig) -> usize {
        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let envelope = encode_request_frame(
            &request_id,
            &date_string(Utc::now()),
            &self.render(config, ""),
        );
        MAX_MESSAGE_SIZE.saturating_sub(envelope.len() + MESSAGE_SIZE_SLACK)
    }
}

pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
