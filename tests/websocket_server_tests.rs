use edge_tts_stream::frame::encode_binary_frame;
use edge_tts_stream::retry::RetryPolicy;
use edge_tts_stream::{
    Communicate, CommunicateConfig, SubtitleConfig, TTSError, TTSEvent, TokenGenerator,
};
use futures_util::{pin_mut, SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

enum Plan {
    Reject { date: String },
    Speak { word: &'static str, audio: Vec<u8> },
}

#[derive(Debug, Clone, Default)]
struct Handshake {
    query: HashMap<String, String>,
    protocol: Option<String>,
    origin: Option<String>,
    received: Vec<String>,
}

async fn start_server(plans: Vec<Plan>) -> (String, Arc<Mutex<Vec<Handshake>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!(
        "ws://{}/consumer/speech/synthesize/readaloud/edge/v1",
        listener.local_addr().unwrap()
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);

    tokio::spawn(async move {
        for plan in plans {
            let (socket, _) = listener.accept().await.unwrap();
            let handshake = Arc::new(Mutex::new(Handshake::default()));
            let captured = Arc::clone(&handshake);
            let reject_date = match &plan {
                Plan::Reject { date } => Some(date.clone()),
                Plan::Speak { .. } => None,
            };

            let callback = move |request: &Request, mut response: Response| {
                let mut hs = captured.lock().unwrap();
                hs.query = url::form_urlencoded::parse(request.uri().query().unwrap_or("").as_bytes())
                    .into_owned()
                    .collect();
                hs.protocol = header(request, "Sec-WebSocket-Protocol");
                hs.origin = header(request, "Origin");

                if let Some(date) = reject_date {
                    let rejection: ErrorResponse = http::Response::builder()
                        .status(403)
                        .header("Date", date)
                        .body(None)
                        .unwrap();
                    return Err(rejection);
                }
                response.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    http::HeaderValue::from_static("synthesize"),
                );
                Ok(response)
            };

            let accepted = tokio_tungstenite::accept_hdr_async(socket, callback).await;
            let Plan::Speak { word, audio } = plan else {
                recorded.lock().unwrap().push(handshake.lock().unwrap().clone());
                continue;
            };
            let mut ws = accepted.unwrap();

            let mut received = Vec::new();
            while received.len() < 2 {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => received.push(text.to_string()),
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }

            let metadata = format!(
                r#"{{"Metadata":[{{"Type":"WordBoundary","Data":{{"Offset":0,"Duration":5000000,"text":{{"Text":"{}","Length":{},"BoundaryType":"WordBoundary"}}}}}}]}}"#,
                word,
                word.len()
            );
            let frames = vec![
                Message::Text(text_frame("turn.start", "{}").into()),
                Message::Text(text_frame("audio.metadata", &metadata).into()),
                Message::Binary(
                    encode_binary_frame(&[("Path", "audio"), ("Content-Type", "audio/mpeg")], &audio)
                        .into(),
                ),
                Message::Text(text_frame("turn.end", "{}").into()),
            ];
            for frame in frames {
                ws.send(frame).await.unwrap();
            }

            // Drain until the client closes
            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    break;
                }
            }

            let mut hs = handshake.lock().unwrap().clone();
            hs.received = received;
            recorded.lock().unwrap().push(hs);
        }
    });

    (endpoint, seen)
}

fn header(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn text_frame(path: &str, body: &str) -> String {
    format!(
        "X-RequestId:0123456789abcdef\r\nContent-Type:application/json; charset=utf-8\r\nPath:{}\r\n\r\n{}",
        path, body
    )
}

fn config() -> CommunicateConfig {
    CommunicateConfig {
        connect_timeout: Duration::from_secs(5),
        receive_timeout: Some(Duration::from_secs(5)),
        retry: RetryPolicy {
            max_retries: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
        },
        subtitle: Some(SubtitleConfig::default()),
    }
}

async fn run(communicate: &mut Communicate) -> Result<Vec<TTSEvent>, TTSError> {
    let stream = communicate.stream()?;
    pin_mut!(stream);
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event?);
    }
    Ok(events)
}

async fn wait_for_handshakes(seen: &Arc<Mutex<Vec<Handshake>>>, count: usize) -> Vec<Handshake> {
    for _ in 0..200 {
        if seen.lock().unwrap().len() >= count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    seen.lock().unwrap().clone()
}

#[test_log::test(tokio::test)]
async fn test_synthesis_over_websocket() {
    let (endpoint, seen) = start_server(vec![Plan::Speak {
        word: "Hello",
        audio: vec![0xff, 0xf3, 0x44],
    }])
    .await;

    let mut communicate = Communicate::builder("Hello")
        .config(config())
        .endpoint(endpoint)
        .build()
        .unwrap();

    let events = run(&mut communicate).await.unwrap();
    assert_eq!(
        events,
        vec![
            TTSEvent::WordBoundary {
                offset: 0,
                duration: 5_000_000,
                text: "Hello".to_string()
            },
            TTSEvent::Audio(vec![0xff, 0xf3, 0x44]),
        ]
    );
    assert_eq!(
        communicate.subtitles().unwrap(),
        "1\n00:00:00,000 --> 00:00:00,500\nHello"
    );

    let handshakes = wait_for_handshakes(&seen, 1).await;
    let handshake = &handshakes[0];
    assert_eq!(handshake.protocol.as_deref(), Some("synthesize"));
    assert_eq!(
        handshake.origin.as_deref(),
        Some("chrome-extension://jdiccldimpdaibmpdkjnbmckianbfold")
    );
    assert_eq!(
        handshake.query.get("TrustedClientToken").map(String::as_str),
        Some("6A5AA1D4EAFF4E9FB37E23D68491D6F4")
    );
    assert_eq!(handshake.query["Sec-MS-GEC"].len(), 64);
    assert_eq!(handshake.query["Sec-MS-GEC-Version"], "1-130.0.2849.68");
    assert_eq!(handshake.query["ConnectionId"].len(), 32);

    assert_eq!(handshake.received.len(), 2);
    assert!(handshake.received[0].contains("Path:speech.config"));
    assert!(handshake.received[1].contains("Path:ssml"));
    assert!(handshake.received[1].contains(">Hello</prosody>"));
}

#[test_log::test(tokio::test)]
async fn test_forbidden_handshake_retries_with_corrected_token() {
    let server_time = chrono::Utc::now() + chrono::Duration::minutes(10);
    let (endpoint, seen) = start_server(vec![
        Plan::Reject {
            date: server_time.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        },
        Plan::Speak {
            word: "Again",
            audio: vec![1, 2, 3],
        },
    ])
    .await;

    let tokens = Arc::new(TokenGenerator::default());
    let mut communicate = Communicate::builder("Again")
        .config(config())
        .endpoint(endpoint)
        .token_generator(tokens.clone())
        .build()
        .unwrap();

    let events = run(&mut communicate).await.unwrap();
    assert_eq!(events.len(), 2);
    assert!((tokens.clock_skew_seconds() - 600.0).abs() < 5.0);

    let handshakes = wait_for_handshakes(&seen, 2).await;
    assert_eq!(handshakes.len(), 2);
    assert_ne!(
        handshakes[0].query["Sec-MS-GEC"],
        handshakes[1].query["Sec-MS-GEC"]
    );
}
