use carelink_core::wire::FrameError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no session token available")]
    NoSession,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("credential rejected by hub (http {0})")]
    AuthRejected(u16),
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("push channel closed")]
    ChannelClosed,
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest errors carry the URL, never the Authorization header.
        SyncError::Transport(err.to_string())
    }
}

impl SyncError {
    /// True when the caller should route the user back to sign-in.
    pub fn is_auth(&self) -> bool {
        match self {
            SyncError::NoSession | SyncError::AuthRejected(_) => true,
            SyncError::Api { status, .. } => *status == 401,
            _ => false,
        }
    }
}
