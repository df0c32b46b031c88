//! One chunk's connect → configure → request → receive → disconnect cycle.

use crate::drm::TokenGenerator;
use crate::error::{Result, TTSError};
use crate::frame::{
    self, date_string, decode_binary_frame, decode_text_frame, encode_config_frame,
    encode_request_frame, AUDIO_MIME_TYPE,
};
use crate::retry::RetryController;
use crate::transport::{ConnectRequest, Connector, Transport, WireMessage};
use crate::TTSEvent;
use chrono::Utc;
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;
use strum::Display;
use url::Url;

/// Silence the service inserts between two turns, in hundred-nanosecond units.
pub const TURN_GAP_TICKS: u64 = 8_750_000;

/// Offsets carried from one chunk to the next (hundred-nanosecond units).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeline {
    pub offset_compensation: u64,
    pub last_duration_offset: u64,
    pub total_offset: u64,
}

impl Timeline {
    /// Place a raw server offset on the continuous timeline.
    fn compensate(&self, raw_offset: u64) -> Result<u64> {
        raw_offset
            .checked_add(self.offset_compensation)
            .ok_or_else(|| offset_overflow(raw_offset))
    }

    fn record_word(&mut self, offset: u64, duration: u64) -> Result<()> {
        self.last_duration_offset = offset
            .checked_add(duration)
            .ok_or_else(|| offset_overflow(offset))?;
        Ok(())
    }

    fn end_turn(&mut self) -> Result<()> {
        self.offset_compensation = self
            .last_duration_offset
            .checked_add(TURN_GAP_TICKS)
            .ok_or_else(|| offset_overflow(self.last_duration_offset))?;
        self.total_offset = self.last_duration_offset;
        Ok(())
    }
}

fn offset_overflow(offset: u64) -> TTSError {
    TTSError::UnexpectedResponse(format!("Word boundary offset {} overflows the timeline", offset))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Configuring,
    Requesting,
    Receiving,
    TurnEnded,
    Disconnected,
    Failed,
}

/// A decoded inbound message, before offsets are compensated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Audio(Vec<u8>),
    WordBoundaries(Vec<WordBoundary>),
    TurnEnd,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordBoundary {
    pub offset: u64,
    pub duration: u64,
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct MetadataEnvelope {
    #[serde(rename = "Metadata")]
    metadata: Vec<MetadataEntry>,
}

#[derive(Debug, Deserialize)]
struct MetadataEntry {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Data", default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WordBoundaryData {
    #[serde(rename = "Offset")]
    offset: u64,
    #[serde(rename = "Duration")]
    duration: u64,
    text: WordBoundaryText,
}

#[derive(Debug, Deserialize)]
struct WordBoundaryText {
    #[serde(rename = "Text")]
    text: String,
}

/// Decode and classify one inbound message.
pub fn classify(message: &WireMessage) -> Result<Inbound> {
    match message {
        WireMessage::Text(raw) => classify_text(raw),
        WireMessage::Binary(raw) => classify_binary(raw),
    }
}

fn classify_text(raw: &str) -> Result<Inbound> {
    let parsed = decode_text_frame(raw)?;
    match parsed.headers.path() {
        Some(frame::PATH_AUDIO_METADATA) => parse_metadata(&parsed.body).map(Inbound::WordBoundaries),
        Some(frame::PATH_TURN_END) => Ok(Inbound::TurnEnd),
        Some(frame::PATH_RESPONSE) | Some(frame::PATH_TURN_START) => Ok(Inbound::Ignored),
        other => Err(TTSError::UnknownResponse(format!(
            "Unknown path received: {:?}",
            other
        ))),
    }
}

fn classify_binary(raw: &[u8]) -> Result<Inbound> {
    let parsed = decode_binary_frame(raw)?;
    if parsed.headers.path() != Some(frame::PATH_AUDIO) {
        return Err(TTSError::UnexpectedResponse(format!(
            "Unexpected binary message path: {:?}",
            parsed.headers.path()
        )));
    }

    match (parsed.headers.content_type(), parsed.body.is_empty()) {
        (Some(AUDIO_MIME_TYPE), false) => Ok(Inbound::Audio(parsed.body)),
        (Some(AUDIO_MIME_TYPE), true) => Err(TTSError::UnexpectedResponse(
            "Empty audio data received".to_string(),
        )),
        (None, true) => Ok(Inbound::Ignored),
        (None, false) => Err(TTSError::UnexpectedResponse(
            "Binary message with no Content-Type but with data".to_string(),
        )),
        (Some(other), _) => Err(TTSError::UnexpectedResponse(format!(
            "Unexpected Content-Type: {}",
            other
        ))),
    }
}

fn parse_metadata(body: &str) -> Result<Vec<WordBoundary>> {
    let envelope: MetadataEnvelope = serde_json::from_str(body)?;
    let mut words = Vec::new();
    for entry in envelope.metadata {
        match entry.kind.as_str() {
            "WordBoundary" => {
                let data: WordBoundaryData = serde_json::from_value(entry.data)?;
                words.push(WordBoundary {
                    offset: data.offset,
                    duration: data.duration,
                    text: data.text.text,
                });
            }
            "SessionEnd" => {}
            other => {
                return Err(TTSError::UnknownResponse(format!(
                    "Unknown metadata type: {}",
                    other
                )))
            }
        }
    }
    Ok(words)
}

/// Shared, per-client connection settings borrowed by each chunk session.
#[derive(Clone, Copy)]
pub struct SessionContext<'a> {
    pub connector: &'a dyn Connector,
    pub tokens: &'a TokenGenerator,
    pub endpoint: &'a Url,
    pub gec_version: &'a str,
    pub retry: &'a RetryController,
    pub connect_timeout: Duration,
    pub receive_timeout: Option<Duration>,
}

impl SessionContext<'_> {
    fn connect_request(&self) -> ConnectRequest {
        ConnectRequest::new(
            self.endpoint,
            self.tokens.trusted_client_token(),
            &self.tokens.generate_token(),
            self.gec_version,
        )
    }

    async fn connect_once(&self) -> Result<Box<dyn Transport>> {
        let request = self.connect_request();
        match tokio::time::timeout(self.connect_timeout, self.connector.connect(&request)).await {
            Ok(result) => result,
            Err(_) => Err(TTSError::transport("Connection timeout")),
        }
    }

    /// Connect with retries. A 403 is not retried here.
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        self.retry
            .execute_when(|| self.connect_once(), |e: &TTSError| !e.is_auth_failure())
            .await
    }

    /// Connect, correcting the clock skew once if the handshake is refused
    /// with 403.
    async fn connect_with_skew_correction(&self) -> Result<Box<dyn Transport>> {
        match self.connect().await {
            Err(TTSError::Transport(failure)) if failure.status == Some(403) => {
                log::warn!("🔐 Handshake rejected with 403, correcting clock skew");
                self.tokens.correct_skew(&failure)?;
                self.connect().await
            }
            other => other,
        }
    }
}

/// The lifecycle of one chunk.
pub struct ChunkSession {
    transport: Option<Box<dyn Transport>>,
    phase: SessionPhase,
    timeline: Timeline,
    pending: VecDeque<TTSEvent>,
    audio_received: bool,
    receive_timeout: Option<Duration>,
}

impl ChunkSession {
    /// Connect and send the configuration and request frames for `markup`.
    pub async fn open(ctx: &SessionContext<'_>, markup: &str, timeline: Timeline) -> Result<Self> {
        let mut session = Self {
            transport: None,
            phase: SessionPhase::Idle,
            timeline,
            pending: VecDeque::new(),
            audio_received: false,
            receive_timeout: ctx.receive_timeout,
        };

        session.transition(SessionPhase::Connecting);
        match ctx.connect_with_skew_correction().await {
            Ok(transport) => session.transport = Some(transport),
            Err(e) => {
                session.transition(SessionPhase::Failed);
                return Err(e);
            }
        }

        if let Err(e) = session.send_requests(markup).await {
            session.fail().await;
            return Err(e);
        }
        session.transition(SessionPhase::Receiving);
        Ok(session)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn timeline(&self) -> Timeline {
        self.timeline
    }

    async fn send_requests(&mut self, markup: &str) -> Result<()> {
        self.transition(SessionPhase::Configuring);
        let config = encode_config_frame(&date_string(Utc::now()));
        self.send(WireMessage::Text(config)).await?;

        self.transition(SessionPhase::Requesting);
        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let request = encode_request_frame(&request_id, &date_string(Utc::now()), markup);
        self.send(WireMessage::Text(request)).await
    }

    async fn send(&mut self, message: WireMessage) -> Result<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.send(message).await,
            None => Err(TTSError::transport("Not connected")),
        }
    }

    async fn recv(&mut self) -> Result<Option<WireMessage>> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| TTSError::transport("Not connected"))?;
        match self.receive_timeout {
            Some(limit) => tokio::time::timeout(limit, transport.recv())
                .await
                .map_err(|_| TTSError::transport("Timed out waiting for the server"))?,
            None => transport.recv().await,
        }
    }

    /// Next event for the caller, or `None` once the turn has ended.
    ///
    /// On error the transport is closed before returning.
    pub async fn next_event(&mut self) -> Result<Option<TTSEvent>> {
        match self.advance().await {
            Ok(event) => Ok(event),
            Err(e) => {
                self.fail().await;
                Err(e)
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<TTSEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.phase != SessionPhase::Receiving {
                return Ok(None);
            }

            let Some(message) = self.recv().await? else {
                log::debug!("🔌 Connection closed before turn.end");
                self.transition(SessionPhase::Disconnected);
                return self.end_of_chunk();
            };

            match classify(&message)? {
                Inbound::Audio(bytes) => {
                    self.audio_received = true;
                    return Ok(Some(TTSEvent::Audio(bytes)));
                }
                Inbound::WordBoundaries(words) => {
                    for word in words {
                        let offset = self.timeline.compensate(word.offset)?;
                        self.timeline.record_word(offset, word.duration)?;
                        self.pending.push_back(TTSEvent::WordBoundary {
                            offset,
                            duration: word.duration,
                            text: word.text,
                        });
                    }
                }
                Inbound::TurnEnd => {
                    self.timeline.end_turn()?;
                    self.transition(SessionPhase::TurnEnded);
                    return self.end_of_chunk();
                }
                Inbound::Ignored => {}
            }
        }
    }

    fn end_of_chunk(&self) -> Result<Option<TTSEvent>> {
        if self.audio_received {
            Ok(None)
        } else {
            Err(TTSError::NoAudioReceived)
        }
    }

    /// Close the transport and hand back the updated timeline.
    pub async fn finish(mut self) -> Timeline {
        self.close().await;
        self.timeline
    }

    async fn fail(&mut self) {
        self.transition(SessionPhase::Failed);
        self.close().await;
    }

    async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                log::warn!("⚠️ Failed to close transport: {}", e);
            }
        }
        if self.phase != SessionPhase::Failed {
            self.transition(SessionPhase::Disconnected);
        }
    }

    fn transition(&mut self, next: SessionPhase) {
        if self.phase != next {
            log::debug!("🔄 Session {} -> {}", self.phase, next);
            self.phase = next;
        }
    }
}

impl Drop for ChunkSession {
    fn drop(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        log::debug!("🔌 Session dropped mid-chunk, closing transport");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.close().await {
                        log::debug!("Close after drop failed: {}", e);
                    }
                });
            }
            // No runtime to close on; dropping the transport drops the socket
            Err(_) => drop(transport),
        }
    }
}
