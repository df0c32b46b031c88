//! Wire framing for the read-aloud protocol.
//!
//! Text frames: `Key:Value\r\n` header lines, a blank line, then the body.
//! Binary frames: `[header_len: u16 BE][headers: header_len bytes][body]`.

use crate::error::{Result, TTSError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";

pub const PATH_SPEECH_CONFIG: &str = "speech.config";
pub const PATH_SSML: &str = "ssml";
pub const PATH_AUDIO_METADATA: &str = "audio.metadata";
pub const PATH_TURN_START: &str = "turn.start";
pub const PATH_TURN_END: &str = "turn.end";
pub const PATH_RESPONSE: &str = "response";
pub const PATH_AUDIO: &str = "audio";

pub const AUDIO_MIME_TYPE: &str = "audio/mpeg";
pub const OUTPUT_FORMAT: &str = "audio-24khz-48kbitrate-mono-mp3";

/// Parsed header block of a frame. Keys are unique; later duplicates win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn path(&self) -> Option<&str> {
        self.get("Path")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }

    fn parse(block: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| TTSError::MalformedFrame("Header block is not UTF-8".to_string()))?;

        let mut headers = HashMap::new();
        for line in text.split("\r\n").filter(|line| !line.is_empty()) {
            let (key, value) = line.split_once(':').ok_or_else(|| {
                TTSError::MalformedFrame(format!("Header line without ':': {:?}", line))
            })?;
            headers.insert(key.to_string(), value.to_string());
        }
        Ok(Self(headers))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFrame {
    pub headers: Headers,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    pub headers: Headers,
    pub body: Vec<u8>,
}

pub fn decode_text_frame(raw: &str) -> Result<TextFrame> {
    let bytes = raw.as_bytes();
    let header_end = find_pattern(bytes, HEADER_DELIMITER).ok_or_else(|| {
        TTSError::MalformedFrame("Text frame has no header delimiter".to_string())
    })?;

    let headers = Headers::parse(&bytes[..header_end])?;
    let body = raw[header_end + HEADER_DELIMITER.len()..].to_string();
    Ok(TextFrame { headers, body })
}

pub fn decode_binary_frame(raw: &[u8]) -> Result<BinaryFrame> {
    if raw.len() < 2 {
        return Err(TTSError::MalformedFrame(format!(
            "Binary frame too short: {} bytes",
            raw.len()
        )));
    }

    let header_len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    if header_len > raw.len() - 2 {
        return Err(TTSError::MalformedFrame(format!(
            "Header length {} exceeds frame length {}",
            header_len,
            raw.len()
        )));
    }

    let headers = Headers::parse(&raw[2..2 + header_len])?;
    let body = raw[2 + header_len..].to_vec();
    Ok(BinaryFrame { headers, body })
}

/// Serialize a binary frame; used by tests and mock servers.
pub fn encode_binary_frame(headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut block = String::new();
    for (key, value) in headers {
        block.push_str(&format!("{}:{}\r\n", key, value));
    }
    let mut frame = Vec::with_capacity(2 + block.len() + body.len());
    frame.extend_from_slice(&(block.len() as u16).to_be_bytes());
    frame.extend_from_slice(block.as_bytes());
    frame.extend_from_slice(body);
    frame
}

/// `speech.config` frame enabling word boundaries and MP3 output.
pub fn encode_config_frame(timestamp: &str) -> String {
    format!(
        "X-Timestamp:{}\r\n\
         Content-Type:application/json; charset=utf-8\r\n\
         Path:{}\r\n\r\n\
         {{\"context\":{{\"synthesis\":{{\"audio\":{{\"metadataoptions\":{{\
         \"sentenceBoundaryEnabled\":\"false\",\"wordBoundaryEnabled\":\"true\"}},\
         \"outputFormat\":\"{}\"}}}}}}}}\r\n",
        timestamp, PATH_SPEECH_CONFIG, OUTPUT_FORMAT
    )
}

/// `ssml` request frame carrying one chunk's markup.
pub fn encode_request_frame(request_id: &str, timestamp: &str, markup: &str) -> String {
    // The trailing `Z` after the timestamp is what the Edge browser sends.
    format!(
        "X-RequestId:{}\r\n\
         Content-Type:application/ssml+xml\r\n\
         X-Timestamp:{}Z\r\n\
         Path:{}\r\n\r\n\
         {}",
        request_id, timestamp, PATH_SSML, markup
    )
}

/// JavaScript `Date.toString()` style timestamp used in `X-Timestamp`.
pub fn date_string(now: DateTime<Utc>) -> String {
    now.format("%a %b %d %Y %H:%M:%S GMT+0000 (Coordinated Universal Time)")
        .to_string()
}

fn find_pattern(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
