//! Gemini Live connector, sender half, and inbound event stream.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{self, BoxStream, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::wire::{self, ServerMessage};
use crate::{ApiKey, LiveConnector, LiveError, LiveEvent, LiveSender, LiveSession, LiveSetup};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) const GEMINI_LIVE_BASE: &str = "wss://generativelanguage.googleapis.com";

/// Opens Gemini Live sessions.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    base_url: String,
    connect_timeout: Duration,
    setup_timeout: Duration,
}

impl Default for GeminiLiveConnector {
    fn default() -> Self {
        Self {
            base_url: GEMINI_LIVE_BASE.to_string(),
            connect_timeout: Duration::from_secs(10),
            setup_timeout: Duration::from_secs(10),
        }
    }
}

impl GeminiLiveConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the service origin, e.g. `ws://127.0.0.1:9000`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// How long to wait for `setupComplete` after sending `setup`.
    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub(crate) fn endpoint_url(&self, api_version: &str) -> String {
        format!(
            "{}/ws/google.ai.generativelanguage.{}.GenerativeService.BidiGenerateContent",
            self.base_url, api_version
        )
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(&self, api_key: &ApiKey, setup: &LiveSetup) -> Result<LiveSession, LiveError> {
        let url = self.endpoint_url(&setup.api_version);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| LiveError::Connect(e.to_string()))?;
        let key = HeaderValue::from_str(api_key.expose())
            .map_err(|_| LiveError::Connect("api key is not a valid header value".into()))?;
        request.headers_mut().insert("x-goog-api-key", key);

        debug!(model = %setup.model, api_version = %setup.api_version, "Gemini Live connect");

        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| LiveError::Timeout)?
            .map_err(|e| LiveError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(wire::setup_message(setup)?.into()))
            .await
            .map_err(|e| LiveError::Handshake(e.to_string()))?;

        tokio::time::timeout(self.setup_timeout, await_setup_complete(&mut stream))
            .await
            .map_err(|_| LiveError::Timeout)??;

        info!(model = %setup.model, "Gemini Live session established");

        Ok(LiveSession {
            sender: Box::new(GeminiSender {
                sink,
                closed: false,
            }),
            events: event_stream(stream),
        })
    }
}

async fn await_setup_complete(stream: &mut SplitStream<WsStream>) -> Result<(), LiveError> {
    while let Some(msg) = stream.next().await {
        let parsed = match msg.map_err(|e| LiveError::Handshake(e.to_string()))? {
            Message::Text(text) => ServerMessage::parse(text.as_bytes())?,
            Message::Binary(data) => ServerMessage::parse(&data)?,
            Message::Close(frame) => {
                return Err(LiveError::Handshake(format!(
                    "closed during setup: {}",
                    describe_close(frame.as_ref())
                )));
            }
            _ => continue,
        };
        if parsed.is_setup_complete() {
            return Ok(());
        }
        debug!("ignoring server message before setupComplete");
    }
    Err(LiveError::Handshake(
        "connection ended before setupComplete".into(),
    ))
}

fn describe_close(frame: Option<&CloseFrame>) -> String {
    match frame {
        Some(f) => format!("{} {}", u16::from(f.code), f.reason.as_str()),
        None => "no close frame".to_string(),
    }
}

/// Lazily decode server frames into events. Ends on close.
fn event_stream(stream: SplitStream<WsStream>) -> BoxStream<'static, Result<LiveEvent, LiveError>> {
    stream
        .take_while(|msg| {
            let open = match msg {
                Ok(Message::Close(frame)) => {
                    debug!(close = %describe_close(frame.as_ref()), "Gemini Live closed");
                    false
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    false
                }
                _ => true,
            };
            future::ready(open)
        })
        .flat_map(|msg| stream::iter(decode_frame(msg)))
        .boxed()
}

fn decode_frame(msg: Result<Message, tungstenite::Error>) -> Vec<Result<LiveEvent, LiveError>> {
    let parsed = match msg {
        Ok(Message::Text(text)) => ServerMessage::parse(text.as_bytes()),
        Ok(Message::Binary(data)) => ServerMessage::parse(&data),
        Ok(_) => return Vec::new(),
        Err(e) => return vec![Err(LiveError::Receive(e.to_string()))],
    };

    let parsed = match parsed {
        Ok(p) => p,
        Err(e) => return vec![Err(e)],
    };

    if parsed.is_go_away() {
        warn!("Gemini Live server announced shutdown");
    }
    if parsed.is_interrupted() {
        debug!("model turn interrupted");
    }

    match parsed.into_events() {
        Ok(events) => events.into_iter().map(Ok).collect(),
        Err(e) => vec![Err(e)],
    }
}

struct GeminiSender {
    sink: SplitSink<WsStream, Message>,
    closed: bool,
}

impl GeminiSender {
    async fn send_json(&mut self, json: String) -> Result<(), LiveError> {
        if self.closed {
            return Err(LiveError::Closed);
        }
        self.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| LiveError::Send(e.to_string()))
    }
}

#[async_trait]
impl LiveSender for GeminiSender {
    async fn send_audio(&mut self, frame: &[u8]) -> Result<(), LiveError> {
        self.send_json(wire::audio_message(frame)?).await
    }

    async fn send_text(&mut self, text: &str, end_of_turn: bool) -> Result<(), LiveError> {
        self.send_json(wire::text_message(text, end_of_turn)?).await
    }

    async fn close(&mut self) -> Result<(), LiveError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(LiveError::Send(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn key() -> ApiKey {
        ApiKey::new("test-key").unwrap()
    }

    #[test]
    fn endpoint_url_pins_api_version() {
        let connector = GeminiLiveConnector::new();
        assert_eq!(
            connector.endpoint_url("v1alpha"),
            "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent"
        );

        let connector = GeminiLiveConnector::new().with_base_url("ws://127.0.0.1:9/");
        assert!(connector
            .endpoint_url("v1beta")
            .starts_with("ws://127.0.0.1:9/ws/google.ai.generativelanguage.v1beta."));
    }

    #[tokio::test]
    async fn handshake_send_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = oneshot::channel::<(String, String)>();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let key = req
                    .headers()
                    .get("x-goog-api-key")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let _ = seen_tx.send((req.uri().path().to_string(), key));
                Ok(resp)
            })
            .await
            .unwrap();

            let setup = ws.next().await.unwrap().unwrap().into_text().unwrap();
            let setup: serde_json::Value = serde_json::from_str(setup.as_str()).unwrap();
            assert_eq!(setup["setup"]["model"], "models/gemini-2.0-flash-exp");
            ws.send(Message::Text(r#"{"setupComplete":{}}"#.into()))
                .await
                .unwrap();

            let mut received = Vec::new();
            for _ in 0..2 {
                let text = ws.next().await.unwrap().unwrap().into_text().unwrap();
                received.push(serde_json::from_str::<serde_json::Value>(text.as_str()).unwrap());
            }

            let reply = format!(
                r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm","data":"{}"}}}}]}},"turnComplete":true}}}}"#,
                STANDARD.encode([9u8, 8, 7])
            );
            ws.send(Message::Binary(reply.into_bytes().into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
            received
        });

        let connector = GeminiLiveConnector::new().with_base_url(format!("ws://{addr}"));
        let mut session = connector
            .connect(&key(), &LiveSetup::new("gemini-2.0-flash-exp"))
            .await
            .unwrap();

        let (path, header) = seen_rx.await.unwrap();
        assert!(path.ends_with("v1alpha.GenerativeService.BidiGenerateContent"));
        assert_eq!(header, "test-key");

        session.sender.send_text("instruction", true).await.unwrap();
        session.sender.send_audio(&[1, 2]).await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = session.events.next().await {
            events.push(event.unwrap());
        }
        assert_eq!(events, vec![LiveEvent::Audio(vec![9, 8, 7]), LiveEvent::TurnComplete]);

        let received = server.await.unwrap();
        assert_eq!(received[0]["clientContent"]["turnComplete"], true);
        assert_eq!(
            received[1]["realtimeInput"]["mediaChunks"][0]["mimeType"],
            "audio/pcm"
        );

        let _ = session.sender.close().await;
        assert!(matches!(
            session.sender.send_audio(&[3]).await,
            Err(LiveError::Closed)
        ));
    }

    #[tokio::test]
    async fn setup_timeout_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let connector = GeminiLiveConnector::new()
            .with_base_url(format!("ws://{addr}"))
            .with_setup_timeout(Duration::from_millis(100));
        let result = connector
            .connect(&key(), &LiveSetup::new("gemini-2.0-flash-exp"))
            .await;
        assert!(matches!(result, Err(LiveError::Timeout)));

        server.abort();
    }

    #[tokio::test]
    async fn close_during_setup_is_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _setup = ws.next().await;
            let _ = ws.close(None).await;
        });

        let connector = GeminiLiveConnector::new().with_base_url(format!("ws://{addr}"));
        let result = connector
            .connect(&key(), &LiveSetup::new("bogus-model"))
            .await;
        assert!(matches!(result, Err(LiveError::Handshake(_))));
    }

    #[tokio::test]
    async fn unreachable_service_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = GeminiLiveConnector::new().with_base_url(format!("ws://{addr}"));
        let result = connector
            .connect(&key(), &LiveSetup::new("gemini-2.0-flash-exp"))
            .await;
        assert!(matches!(result, Err(LiveError::Connect(_))));
    }
}
