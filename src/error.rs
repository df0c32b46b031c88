use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub type Result<T> = std::result::Result<T, TTSError>;

/// Failure to open, use or close the transport.
///
/// Handshake rejections keep the HTTP status and the server `Date` header so
/// that an authentication failure can be turned into a clock-skew correction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportFailure {
    pub message: String,
    pub status: Option<u16>,
    pub server_date: Option<String>,
}

impl TransportFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            server_date: None,
        }
    }

    pub fn rejected(status: u16, server_date: Option<String>) -> Self {
        Self {
            message: format!("handshake rejected with HTTP {}", status),
            status: Some(status),
            server_date,
        }
    }

    pub fn from_response<T>(response: &http::Response<T>) -> Self {
        let server_date = response
            .headers()
            .get(http::header::DATE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Self::rejected(response.status().as_u16(), server_date)
    }
}

#[derive(Error, Debug)]
pub enum TTSError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(TransportFailure),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Unknown response: {0}")]
    UnknownResponse(String),

    #[error("No audio was received for the chunk")]
    NoAudioReceived,

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Invalid metadata JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl TTSError {
    pub fn transport(message: impl Into<String>) -> Self {
        TTSError::Transport(TransportFailure::new(message))
    }

    /// Stable machine-readable code for the error category.
    pub fn code(&self) -> &'static str {
        match self {
            TTSError::Configuration(_) => "CONFIGURATION_ERROR",
            TTSError::Transport(_) => "TRANSPORT_ERROR",
            TTSError::MalformedFrame(_) => "MALFORMED_FRAME",
            TTSError::UnexpectedResponse(_) | TTSError::Json(_) => "UNEXPECTED_RESPONSE",
            TTSError::UnknownResponse(_) => "UNKNOWN_RESPONSE",
            TTSError::NoAudioReceived => "NO_AUDIO_RECEIVED",
            TTSError::Usage(_) => "USAGE_ERROR",
        }
    }

    /// True when the server refused the handshake with HTTP 403.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, TTSError::Transport(failure) if failure.status == Some(403))
    }
}

impl From<tungstenite::Error> for TTSError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                TTSError::Transport(TransportFailure::from_response(&response))
            }
            other => TTSError::transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = vec![
            TTSError::Configuration("x".into()),
            TTSError::transport("x"),
            TTSError::MalformedFrame("x".into()),
            TTSError::UnexpectedResponse("x".into()),
            TTSError::UnknownResponse("x".into()),
            TTSError::NoAudioReceived,
            TTSError::Usage("x".into()),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_auth_failure_detection() {
        let forbidden = TTSError::Transport(TransportFailure::rejected(
            403,
            Some("Wed, 14 Oct 2026 10:00:00 GMT".to_string()),
        ));
        assert!(forbidden.is_auth_failure());
        assert!(!TTSError::Transport(TransportFailure::rejected(500, None)).is_auth_failure());
        assert!(!TTSError::transport("Connection timeout").is_auth_failure());
    }

    #[test]
    fn test_transport_failure_display() {
        let failure = TransportFailure::rejected(403, None);
        assert_eq!(failure.to_string(), "handshake rejected with HTTP 403");
        assert_eq!(
            TTSError::Transport(failure).to_string(),
            "Transport error: handshake rejected with HTTP 403"
        );
    }

    #[test]
    fn test_http_rejection_keeps_date_header() {
        let response = http::Response::builder()
            .status(403)
            .header("Date", "Wed, 14 Oct 2026 10:00:00 GMT")
            .body(())
            .unwrap();
        let failure = TransportFailure::from_response(&response);
        assert_eq!(failure.status, Some(403));
        assert_eq!(
            failure.server_date.as_deref(),
            Some("Wed, 14 Oct 2026 10:00:00 GMT")
        );
    }
}
