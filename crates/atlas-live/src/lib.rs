//! Upstream streaming client for Atlas.
//!
//! Opens one bidirectional Gemini Live session per relay and exposes it as
//! a sender half plus a lazy stream of inbound events:
//! - `LiveSender` for outgoing audio and text turns
//! - `LiveSession::events` for model audio, transcripts and turn boundaries
//! - `LiveConnector` as the seam relays use to open sessions

pub mod gemini;
pub mod setup;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub use gemini::GeminiLiveConnector;
pub use setup::{ApiKey, LiveSetup, Modality};

/// MIME label attached to every audio frame sent upstream.
pub const AUDIO_MIME_TYPE: &str = "audio/pcm";

/// One event produced by the upstream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    /// Raw PCM audio produced by the model.
    Audio(Vec<u8>),
    /// Text or transcript produced alongside the audio.
    Text(String),
    /// The model finished its turn.
    TurnComplete,
}

/// Outgoing half of an upstream session.
#[async_trait]
pub trait LiveSender: Send {
    /// Send one audio frame tagged `audio/pcm`. Never finishes the turn.
    /// Fails with `LiveError::Closed` after `close`.
    async fn send_audio(&mut self, frame: &[u8]) -> Result<(), LiveError>;

    /// Send a text turn, optionally marking the end of the caller's turn.
    async fn send_text(&mut self, text: &str, end_of_turn: bool) -> Result<(), LiveError>;

    /// Close the session. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), LiveError>;
}

/// An open upstream session, split by direction.
pub struct LiveSession {
    pub sender: Box<dyn LiveSender>,
    /// Ends when the upstream closes. Dropping it cancels any pending read.
    pub events: BoxStream<'static, Result<LiveEvent, LiveError>>,
}

/// Opens upstream sessions.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self, api_key: &ApiKey, setup: &LiveSetup) -> Result<LiveSession, LiveError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("connect error: {0}")]
    Connect(String),
    #[error("handshake error: {0}")]
    Handshake(String),
    #[error("send error: {0}")]
    Send(String),
    #[error("receive error: {0}")]
    Receive(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("session closed")]
    Closed,
    #[error("timeout")]
    Timeout,
}
