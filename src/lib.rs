pub mod communicate;
pub mod config;
pub mod drm;
pub mod error;
pub mod frame;
pub mod retry;
pub mod segmenter;
pub mod session;
pub mod ssml;
pub mod subtitle;
pub mod transport;

pub use communicate::{Communicate, CommunicateBuilder, CommunicateConfig};
pub use config::{SettingsError, TtsSettings};
pub use drm::TokenGenerator;
pub use error::{Result, TTSError, TransportFailure};
pub use retry::{RetryController, RetryEvent, RetryObserver, RetryPolicy};
pub use ssml::{MarkupProvider, SsmlMarkup, VoiceConfig};
pub use subtitle::{SubRipBuilder, SubtitleConfig};
pub use transport::{ConnectRequest, Connector, Transport, WebSocketConnector, WireMessage};

/// Output of a synthesis stream. Offsets and durations are in
/// hundred-nanosecond units on the client's continuous timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TTSEvent {
    /// A non-empty piece of MP3 audio.
    Audio(Vec<u8>),
    WordBoundary {
        offset: u64,
        duration: u64,
        text: String,
    },
}
