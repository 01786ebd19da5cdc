//! atlas-relay: WebSocket relay between mobile clients and Gemini Live.
//!
//! Each client connection gets its own upstream session. Raw PCM frames are
//! forwarded in both directions until either side closes; the relay never
//! inspects audio payloads.

mod bootstrap;
mod config;
mod error;
mod protocol;
mod relay;
#[cfg(test)]
mod testing;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use atlas_live::GeminiLiveConnector;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::Instrument;

use crate::bootstrap::SessionBootstrap;
use crate::config::{Profile, RelayConfig};

#[derive(Parser)]
#[command(name = "atlas-relay", about = "WebSocket audio relay for Gemini Live")]
struct Args {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model and instruction preset.
    #[arg(long, value_enum)]
    profile: Option<Profile>,

    /// Address to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Close sessions with no traffic for this many seconds.
    #[arg(long)]
    idle_timeout: Option<u64>,
}

impl Args {
    fn into_config(self) -> Result<RelayConfig, error::ConfigError> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load_from_path(path)?,
            None => RelayConfig::default(),
        };
        if let Some(profile) = self.profile {
            config.upstream.profile = profile;
        }
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = Some(port);
        }
        if let Some(secs) = self.idle_timeout {
            config.session.idle_timeout_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atlas_relay=info,atlas_live=info".into()),
        )
        .init();

    let config = Args::parse().into_config()?;

    let credential = config.credential();
    if credential.is_none() {
        tracing::error!(
            var = %config.upstream.credential_env,
            "API key not set; every session will be refused"
        );
    }

    let mut connector = GeminiLiveConnector::new().with_setup_timeout(config.setup_timeout());
    if let Some(base_url) = &config.upstream.base_url {
        connector = connector.with_base_url(base_url.clone());
    }

    let bootstrap = Arc::new(SessionBootstrap::new(
        credential,
        Arc::new(connector),
        config.live_setup(),
        config.idle_timeout(),
    ));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        model = %config.model(),
        path = %config.server.path,
        "atlas-relay listening on {}",
        addr
    );

    let path: Arc<str> = config.server.path.clone().into();

    // Accept loop.
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "TCP accept error");
                    continue;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        };

        let bootstrap = bootstrap.clone();
        let path = path.clone();
        let span = tracing::info_span!("relay", peer = %peer, session = %uuid::Uuid::new_v4());
        tokio::spawn(
            async move {
                match transport::accept(stream, &path).await {
                    Ok(transport) => {
                        tracing::info!("client connected");
                        let outcome = bootstrap.serve(transport).await;
                        tracing::info!(code = outcome.code(), "session closed");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "WS handshake failed");
                    }
                }
            }
            .instrument(span),
        );
    }

    Ok(())
}
