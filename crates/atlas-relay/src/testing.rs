//! Channel-backed fakes for the client transport and upstream session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use atlas_live::{ApiKey, LiveConnector, LiveError, LiveEvent, LiveSender, LiveSession, LiveSetup};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::RelayError;
use crate::protocol::CloseOutcome;
use crate::transport::{ClientReader, ClientTransport, ClientWriter};

#[derive(Debug)]
pub(crate) enum ClientInput {
    Frame(Vec<u8>),
    Fail(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClientOutput {
    Frame(Vec<u8>),
    Closed(u16, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UpstreamCall {
    Audio(Vec<u8>),
    Text(String, bool),
    Close,
}

struct FakeReader(UnboundedReceiver<ClientInput>);

#[async_trait]
impl ClientReader for FakeReader {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        match self.0.recv().await {
            Some(ClientInput::Frame(frame)) => Ok(Some(frame)),
            Some(ClientInput::Fail(msg)) => Err(RelayError::Transport(msg)),
            None => Ok(None),
        }
    }
}

struct FakeWriter(UnboundedSender<ClientOutput>);

#[async_trait]
impl ClientWriter for FakeWriter {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), RelayError> {
        self.0
            .send(ClientOutput::Frame(frame))
            .map_err(|_| RelayError::ClientGone)
    }

    async fn close(&mut self, outcome: &CloseOutcome) -> Result<(), RelayError> {
        let _ = self
            .0
            .send(ClientOutput::Closed(outcome.code(), outcome.reason()));
        Ok(())
    }
}

/// Client transport driven by `ClientInput`s; everything written comes out
/// as `ClientOutput`s. Dropping the input sender reads as a disconnect;
/// dropping the output receiver makes writes fail with `ClientGone`.
pub(crate) fn fake_client() -> (
    ClientTransport,
    UnboundedSender<ClientInput>,
    UnboundedReceiver<ClientOutput>,
) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let transport = ClientTransport {
        reader: Box::new(FakeReader(in_rx)),
        writer: Box::new(FakeWriter(out_tx)),
    };
    (transport, in_tx, out_rx)
}

type EventTx = UnboundedSender<Result<LiveEvent, LiveError>>;

struct FakeSender {
    calls: UnboundedSender<UpstreamCall>,
    echo: Option<EventTx>,
    fail_sends: bool,
    closed: bool,
}

#[async_trait]
impl LiveSender for FakeSender {
    async fn send_audio(&mut self, frame: &[u8]) -> Result<(), LiveError> {
        if self.closed {
            return Err(LiveError::Closed);
        }
        if self.fail_sends {
            return Err(LiveError::Send("rejected".into()));
        }
        let _ = self.calls.send(UpstreamCall::Audio(frame.to_vec()));
        if let Some(echo) = &self.echo {
            let _ = echo.send(Ok(LiveEvent::Audio(frame.to_vec())));
        }
        Ok(())
    }

    async fn send_text(&mut self, text: &str, end_of_turn: bool) -> Result<(), LiveError> {
        if self.closed {
            return Err(LiveError::Closed);
        }
        if self.fail_sends {
            return Err(LiveError::Send("rejected".into()));
        }
        let _ = self
            .calls
            .send(UpstreamCall::Text(text.to_string(), end_of_turn));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LiveError> {
        if !self.closed {
            self.closed = true;
            let _ = self.calls.send(UpstreamCall::Close);
        }
        Ok(())
    }
}

fn event_stream(
    rx: UnboundedReceiver<Result<LiveEvent, LiveError>>,
) -> BoxStream<'static, Result<LiveEvent, LiveError>> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed()
}

/// Upstream whose events are pushed by the test. Dropping `events` ends
/// the event stream.
pub(crate) struct FakeUpstream {
    pub session: LiveSession,
    pub calls: UnboundedReceiver<UpstreamCall>,
    pub events: EventTx,
}

fn build_upstream(fail_sends: bool) -> FakeUpstream {
    let (calls_tx, calls) = mpsc::unbounded_channel();
    let (events, events_rx) = mpsc::unbounded_channel();
    FakeUpstream {
        session: LiveSession {
            sender: Box::new(FakeSender {
                calls: calls_tx,
                echo: None,
                fail_sends,
                closed: false,
            }),
            events: event_stream(events_rx),
        },
        calls,
        events,
    }
}

pub(crate) fn fake_upstream() -> FakeUpstream {
    build_upstream(false)
}

/// Upstream that rejects every write.
pub(crate) fn failing_upstream() -> FakeUpstream {
    build_upstream(true)
}

/// Upstream that answers every audio frame with the same bytes.
pub(crate) fn echo_upstream() -> (LiveSession, UnboundedReceiver<UpstreamCall>) {
    let (calls_tx, calls) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = LiveSession {
        sender: Box::new(FakeSender {
            calls: calls_tx,
            echo: Some(events_tx),
            fail_sends: false,
            closed: false,
        }),
        events: event_stream(events_rx),
    };
    (session, calls)
}

/// Connector handing out one prepared session, or failing every attempt.
pub(crate) struct FakeConnector {
    connects: AtomicUsize,
    session: Mutex<Option<LiveSession>>,
    delay: Duration,
}

impl FakeConnector {
    pub(crate) fn with_session(session: LiveSession) -> Self {
        Self {
            connects: AtomicUsize::new(0),
            session: Mutex::new(Some(session)),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn refusing() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            session: Mutex::new(None),
            delay: Duration::ZERO,
        }
    }

    /// Every connect takes `delay` before it resolves.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(&self, _api_key: &ApiKey, _setup: &LiveSetup) -> Result<LiveSession, LiveError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.session
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| LiveError::Connect("connection refused".into()))
    }
}

/// Everything currently queued on `rx`.
pub(crate) fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}
