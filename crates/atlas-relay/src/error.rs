use std::path::PathBuf;

use atlas_live::LiveError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Anything that ends a relay session early.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("API key missing")]
    MissingCredential,

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(LiveError),

    #[error("upstream send failed: {0}")]
    UpstreamSend(LiveError),

    #[error("upstream receive failed: {0}")]
    UpstreamReceive(LiveError),

    #[error("client transport error: {0}")]
    Transport(String),

    /// The client went away without a close handshake. Not a failure.
    #[error("client disconnected")]
    ClientGone,
}
