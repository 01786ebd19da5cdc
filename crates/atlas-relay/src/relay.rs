//! Relay session: two forwarding loops raced against each other and an
//! idle watchdog. The first to finish ends the session.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use atlas_live::{LiveError, LiveEvent, LiveSender, LiveSession};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::protocol::CloseOutcome;
use crate::transport::{ClientReader, ClientTransport, ClientWriter};

/// Upper bound on each close handshake during teardown.
const CLOSE_GRACE: Duration = Duration::from_secs(5);
/// Client frames held while the upstream session is still opening.
const BACKLOG_LIMIT: usize = 256;

/// Lifecycle of one relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    Bootstrapped,
    Relaying,
    Closing,
    Closed,
}

impl RelayState {
    pub fn can_advance_to(self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (Init, Bootstrapped)
                | (Init, Closing)
                | (Bootstrapped, Relaying)
                | (Bootstrapped, Closing)
                | (Relaying, Closing)
                | (Closing, Closed)
        )
    }
}

/// Which contender ended the relay without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    ClientDisconnected,
    UpstreamEnded,
    Idle,
}

/// One client connection paired with at most one upstream session.
pub struct RelaySession {
    reader: Box<dyn ClientReader>,
    writer: Box<dyn ClientWriter>,
    idle_timeout: Duration,
    state: RelayState,
    backlog: VecDeque<Vec<u8>>,
}

impl RelaySession {
    pub fn new(transport: ClientTransport, idle_timeout: Duration) -> Self {
        Self {
            reader: transport.reader,
            writer: transport.writer,
            idle_timeout,
            state: RelayState::Init,
            backlog: VecDeque::new(),
        }
    }

    fn advance(&mut self, next: RelayState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid relay transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "relay state");
        self.state = next;
    }

    /// Drive `open` while watching the client. Frames that arrive in the
    /// meantime are queued and forwarded first once relaying starts.
    /// `Ok(None)` means the client left first; `open` is dropped unfinished.
    pub async fn await_upstream<F>(&mut self, open: F) -> Result<Option<LiveSession>, RelayError>
    where
        F: Future<Output = Result<LiveSession, RelayError>>,
    {
        tokio::pin!(open);
        loop {
            let frame = tokio::select! {
                biased;
                res = &mut open => return res.map(Some),
                frame = self.reader.next_frame(), if self.backlog.len() < BACKLOG_LIMIT => frame,
            };
            match frame {
                Ok(Some(frame)) => self.backlog.push_back(frame),
                Ok(None) | Err(RelayError::ClientGone) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Close the client without ever relaying, e.g. when bootstrap fails.
    pub async fn abort(self, err: RelayError) -> CloseOutcome {
        match &err {
            RelayError::MissingCredential => warn!("no API key configured, refusing session"),
            other => warn!(error = %other, "session bootstrap failed"),
        }
        self.close_early(CloseOutcome::from_error(&err)).await
    }

    /// The client left before the upstream session was ready.
    pub async fn abandon(self) -> CloseOutcome {
        info!("client disconnected during bootstrap");
        self.close_early(CloseOutcome::Normal).await
    }

    async fn close_early(mut self, outcome: CloseOutcome) -> CloseOutcome {
        self.advance(RelayState::Closing);
        self.close_client(&outcome).await;
        self.advance(RelayState::Closed);
        outcome
    }

    /// Relay until either side ends, then tear both down.
    pub async fn run(mut self, upstream: LiveSession) -> CloseOutcome {
        self.advance(RelayState::Bootstrapped);
        let LiveSession {
            mut sender,
            mut events,
        } = upstream;

        self.advance(RelayState::Relaying);
        let (activity, idle_rx) = watch::channel(());

        let backlog = std::mem::take(&mut self.backlog);
        let finished = {
            let inbound = inbound_loop(backlog, self.reader.as_mut(), sender.as_mut(), &activity);
            let outbound = outbound_loop(&mut events, self.writer.as_mut(), &activity);
            let idle = idle_watchdog(idle_rx, self.idle_timeout);

            // Losing futures are dropped here, cancelling their pending reads.
            tokio::select! {
                res = inbound => res.map(|()| Finish::ClientDisconnected),
                res = outbound => res.map(|()| Finish::UpstreamEnded),
                () = idle => Ok(Finish::Idle),
            }
        };

        let outcome = match finished {
            Ok(Finish::ClientDisconnected) | Err(RelayError::ClientGone) => {
                info!("client disconnected");
                CloseOutcome::Normal
            }
            Ok(Finish::UpstreamEnded) => {
                info!("upstream session ended");
                CloseOutcome::Normal
            }
            Ok(Finish::Idle) => {
                info!(timeout_secs = self.idle_timeout.as_secs(), "session idle, closing");
                CloseOutcome::IdleTimeout
            }
            Err(e) => {
                warn!(error = %e, "relay loop failed");
                CloseOutcome::from_error(&e)
            }
        };

        self.advance(RelayState::Closing);
        release_upstream(sender.as_mut()).await;
        drop(events);
        self.close_client(&outcome).await;
        self.advance(RelayState::Closed);
        outcome
    }

    async fn close_client(&mut self, outcome: &CloseOutcome) {
        match tokio::time::timeout(CLOSE_GRACE, self.writer.close(outcome)).await {
            Ok(Ok(())) => debug!(code = outcome.code(), "client closed"),
            Ok(Err(e)) => debug!(error = %e, "client close failed"),
            Err(_) => debug!("client close timed out"),
        }
    }
}

async fn release_upstream(sender: &mut dyn LiveSender) {
    match tokio::time::timeout(CLOSE_GRACE, sender.close()).await {
        Ok(Ok(())) => debug!("upstream released"),
        Ok(Err(e)) => debug!(error = %e, "upstream close failed"),
        Err(_) => debug!("upstream close timed out"),
    }
}

/// Client → upstream, starting with anything queued during bootstrap.
/// Ends cleanly on ordinary disconnect.
async fn inbound_loop(
    backlog: VecDeque<Vec<u8>>,
    reader: &mut dyn ClientReader,
    sender: &mut dyn LiveSender,
    activity: &watch::Sender<()>,
) -> Result<(), RelayError> {
    let mut frames: u64 = 0;
    for frame in backlog {
        forward(sender, &frame, activity).await?;
        frames += 1;
    }
    while let Some(frame) = reader.next_frame().await? {
        forward(sender, &frame, activity).await?;
        frames += 1;
    }
    debug!(frames, "inbound loop done");
    Ok(())
}

async fn forward(
    sender: &mut dyn LiveSender,
    frame: &[u8],
    activity: &watch::Sender<()>,
) -> Result<(), RelayError> {
    sender
        .send_audio(frame)
        .await
        .map_err(RelayError::UpstreamSend)?;
    activity.send_replace(());
    Ok(())
}

/// Upstream → client. Only audio is forwarded; text is logged.
async fn outbound_loop(
    events: &mut BoxStream<'static, Result<LiveEvent, LiveError>>,
    writer: &mut dyn ClientWriter,
    activity: &watch::Sender<()>,
) -> Result<(), RelayError> {
    let mut frames: u64 = 0;
    while let Some(event) = events.next().await {
        let event = event.map_err(RelayError::UpstreamReceive)?;
        activity.send_replace(());
        match event {
            LiveEvent::Audio(data) => {
                writer.send_frame(data).await?;
                frames += 1;
            }
            LiveEvent::Text(text) => info!(text = %text, "model text"),
            LiveEvent::TurnComplete => debug!("model turn complete"),
        }
    }
    debug!(frames, "outbound loop done");
    Ok(())
}

/// Resolves once no activity has been signalled for `idle`.
async fn idle_watchdog(mut activity: watch::Receiver<()>, idle: Duration) {
    loop {
        match tokio::time::timeout(idle, activity.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) | Err(_) => return,
        }
    }
}
