//! Client-facing close codes and reasons.

use crate::error::RelayError;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Longest diagnostic excerpt placed in a close reason, in characters.
const REASON_DETAIL_CHARS: usize = 50;
/// WebSocket limit for a close reason, in bytes.
const MAX_REASON_BYTES: usize = 123;

/// How a relay session ended, as reported to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Client or upstream ended the conversation.
    Normal,
    /// Nothing moved in either direction for the idle timeout.
    IdleTimeout,
    /// No credential configured; upstream was never contacted.
    MissingCredential,
    /// Any other fatal failure. Holds the full diagnostic for logging.
    ServerError(String),
}

impl CloseOutcome {
    pub fn from_error(err: &RelayError) -> Self {
        match err {
            RelayError::MissingCredential => Self::MissingCredential,
            RelayError::ClientGone => Self::Normal,
            other => Self::ServerError(other.to_string()),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::Normal | Self::IdleTimeout => CLOSE_NORMAL,
            Self::MissingCredential => CLOSE_POLICY_VIOLATION,
            Self::ServerError(_) => CLOSE_INTERNAL_ERROR,
        }
    }

    /// Reason text sent in the close frame. Never longer than 123 bytes.
    pub fn reason(&self) -> String {
        match self {
            Self::Normal => String::new(),
            Self::IdleTimeout => "Idle timeout".to_string(),
            Self::MissingCredential => "API Key Missing".to_string(),
            Self::ServerError(detail) => {
                let excerpt: String = detail.chars().take(REASON_DETAIL_CHARS).collect();
                clamp_bytes(format!("Server Error: {excerpt}"), MAX_REASON_BYTES)
            }
        }
    }
}

fn clamp_bytes(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
