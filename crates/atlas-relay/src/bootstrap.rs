//! Per-connection bootstrap: credential check, upstream open, initial
//! instruction, then hand-off to the relay.

use std::sync::Arc;
use std::time::Duration;

use atlas_live::{ApiKey, LiveConnector, LiveSession, LiveSetup};
use tracing::{debug, info};

use crate::error::RelayError;
use crate::protocol::CloseOutcome;
use crate::relay::RelaySession;
use crate::transport::ClientTransport;

/// Shared by every connection; holds only immutable configuration.
pub struct SessionBootstrap {
    credential: Option<ApiKey>,
    connector: Arc<dyn LiveConnector>,
    setup: LiveSetup,
    idle_timeout: Duration,
}

impl SessionBootstrap {
    pub fn new(
        credential: Option<ApiKey>,
        connector: Arc<dyn LiveConnector>,
        setup: LiveSetup,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            credential,
            connector,
            setup,
            idle_timeout,
        }
    }

    /// Run one client connection to completion. A client that leaves
    /// while upstream is still opening cancels the open.
    pub async fn serve(&self, transport: ClientTransport) -> CloseOutcome {
        let mut relay = RelaySession::new(transport, self.idle_timeout);
        match relay.await_upstream(self.open_upstream()).await {
            Ok(Some(upstream)) => {
                info!(model = %self.setup.model, "relaying");
                relay.run(upstream).await
            }
            Ok(None) => relay.abandon().await,
            Err(e) => relay.abort(e).await,
        }
    }

    async fn open_upstream(&self) -> Result<LiveSession, RelayError> {
        let api_key = self
            .credential
            .as_ref()
            .ok_or(RelayError::MissingCredential)?;

        let mut session = self
            .connector
            .connect(api_key, &self.setup)
            .await
            .map_err(RelayError::UpstreamConnect)?;

        if !self.setup.instruction.is_empty() {
            if let Err(e) = session.sender.send_text(&self.setup.instruction, true).await {
                let _ = session.sender.close().await;
                return Err(RelayError::UpstreamSend(e));
            }
            debug!("initial instruction sent");
        }

        Ok(session)
    }
}
