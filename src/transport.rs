//! Message transport for a single chunk session.
//!
//! The session only needs "send a message", "await the next message" and
//! "close"; [`Connector`] opens a [`Transport`] from a [`ConnectRequest`].
//! [`WebSocketConnector`] is the production implementation on top of
//! tokio-tungstenite.

use crate::error::{Result, TTSError};
use futures_util::{SinkExt, StreamExt};
use http::{HeaderName, HeaderValue};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

pub const DEFAULT_ENDPOINT: &str =
    "wss://speech.platform.bing.com/consumer/speech/synthesize/readaloud/edge/v1";

pub const SEC_MS_GEC_VERSION: &str = "1-130.0.2849.68";

const CHROMIUM_MAJOR_VERSION: &str = "130";

/// Headers sent with every handshake, in order.
pub fn handshake_headers() -> Vec<(String, String)> {
    let major = CHROMIUM_MAJOR_VERSION;
    vec![
        ("Pragma".to_string(), "no-cache".to_string()),
        ("Cache-Control".to_string(), "no-cache".to_string()),
        (
            "Origin".to_string(),
            "chrome-extension://jdiccldimpdaibmpdkjnbmckianbfold".to_string(),
        ),
        (
            "User-Agent".to_string(),
            format!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/{major}.0.0.0 Safari/537.36 Edg/{major}.0.0.0"
            ),
        ),
        (
            "Accept-Encoding".to_string(),
            "gzip, deflate, br".to_string(),
        ),
        ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
        (
            "Sec-WebSocket-Extensions".to_string(),
            "permessage-deflate".to_string(),
        ),
        ("Sec-WebSocket-Protocol".to_string(), "synthesize".to_string()),
    ]
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Everything needed to open one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub connection_id: String,
}

impl ConnectRequest {
    /// Build the handshake for `endpoint` with a freshly generated token.
    pub fn new(
        endpoint: &Url,
        trusted_client_token: &str,
        sec_ms_gec: &str,
        gec_version: &str,
    ) -> Self {
        let connection_id = uuid::Uuid::new_v4().simple().to_string();
        let mut url = endpoint.clone();
        url.query_pairs_mut()
            .append_pair("TrustedClientToken", trusted_client_token)
            .append_pair("Sec-MS-GEC", sec_ms_gec)
            .append_pair("Sec-MS-GEC-Version", gec_version)
            .append_pair("ConnectionId", &connection_id);

        Self {
            url,
            headers: handshake_headers(),
            connection_id,
        }
    }

    pub fn query(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// An open, bidirectional message channel.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: WireMessage) -> Result<()>;

    /// Next inbound message, or `None` once the peer has closed.
    async fn recv(&mut self) -> Result<Option<WireMessage>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens transports.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>>;
}

/// Connects with tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>> {
        let mut ws_request = request.url.as_str().into_client_request()?;
        for (key, value) in &request.headers {
            // tungstenite has no permessage-deflate support; offering it would
            // let the server send compressed frames we cannot read.
            if key.eq_ignore_ascii_case("Sec-WebSocket-Extensions") {
                continue;
            }
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                TTSError::Configuration(format!("Invalid header name {}: {}", key, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                TTSError::Configuration(format!("Invalid header value for {}: {}", key, e))
            })?;
            ws_request.headers_mut().insert(name, value);
        }

        log::debug!(
            "🔌 Opening WebSocket (ConnectionId={})",
            request.connection_id
        );
        let (stream, response) = connect_async(ws_request).await?;
        log::debug!("🔌 Handshake complete: HTTP {}", response.status());

        Ok(Box::new(WebSocketTransport { stream }))
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: WireMessage) -> Result<()> {
        let message = match message {
            WireMessage::Text(text) => Message::Text(text.into()),
            WireMessage::Binary(bytes) => Message::Binary(bytes.into()),
        };
        self.stream.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<WireMessage>> {
        loop {
            let message = match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(message)) => message,
                Some(Err(tungstenite::Error::ConnectionClosed))
                | Some(Err(tungstenite::Error::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            };

            match message {
                Message::Text(text) => return Ok(Some(WireMessage::Text(text.to_string()))),
                Message::Binary(bytes) => return Ok(Some(WireMessage::Binary(bytes.as_slice().to_vec()))),
                Message::Close(frame) => {
                    log::debug!("🔌 Server closed the connection: {:?}", frame);
                    return Ok(None);
                }
                // Pings are answered by tungstenite on the next read
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
