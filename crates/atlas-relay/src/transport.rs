//! Client-facing WebSocket transport, split into reader and writer halves.

use std::io;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::debug;

use crate::error::RelayError;
use crate::protocol::CloseOutcome;

/// Reading half of a client connection.
#[async_trait]
pub trait ClientReader: Send {
    /// Next audio frame, or `None` once the client has disconnected.
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, RelayError>;
}

/// Writing half of a client connection.
#[async_trait]
pub trait ClientWriter: Send {
    /// Fails with `RelayError::ClientGone` if the peer has already left.
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), RelayError>;

    async fn close(&mut self, outcome: &CloseOutcome) -> Result<(), RelayError>;
}

/// An accepted client connection.
pub struct ClientTransport {
    pub reader: Box<dyn ClientReader>,
    pub writer: Box<dyn ClientWriter>,
}

/// Complete the WebSocket handshake, rejecting any path but `path` with 404.
pub async fn accept<S>(stream: S, path: &str) -> Result<ClientTransport, tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let expected = path.to_string();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == expected {
            Ok(resp)
        } else {
            debug!(path = %req.uri().path(), "rejecting upgrade on unknown path");
            let mut err = ErrorResponse::new(Some("not found".to_string()));
            *err.status_mut() = StatusCode::NOT_FOUND;
            Err(err)
        }
    };

    let ws = accept_hdr_async(stream, callback).await?;
    let (sink, stream) = ws.split();
    Ok(ClientTransport {
        reader: Box::new(stream),
        writer: Box::new(sink),
    })
}

/// The peer left, with or without a close handshake.
fn is_disconnect(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        tungstenite::Error::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

#[async_trait]
impl<S> ClientReader for SplitStream<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        loop {
            match self.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Vec::from(data))),
                Some(Ok(Message::Text(_))) => {
                    debug!("ignoring text frame from client");
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Ping/pong are answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) if is_disconnect(&e) => return Ok(None),
                Some(Err(e)) => return Err(RelayError::Transport(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl<S> ClientWriter for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), RelayError> {
        match self.send(Message::Binary(frame.into())).await {
            Ok(()) => Ok(()),
            Err(e) if is_disconnect(&e) => {
                debug!(error = %e, "client gone while writing");
                Err(RelayError::ClientGone)
            }
            Err(e) => Err(RelayError::Transport(e.to_string())),
        }
    }

    async fn close(&mut self, outcome: &CloseOutcome) -> Result<(), RelayError> {
        let frame = CloseFrame {
            code: CloseCode::from(outcome.code()),
            reason: outcome.reason().into(),
        };
        match self.send(Message::Close(Some(frame))).await {
            Ok(()) => Ok(()),
            Err(e) if is_disconnect(&e) => Ok(()),
            Err(e) => Err(RelayError::Transport(e.to_string())),
        }
    }
}
