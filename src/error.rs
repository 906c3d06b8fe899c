//! Error taxonomy for a talkwire session.
//!
//! Nothing in here is fatal to the process: permission and connection
//! failures leave the session disconnected-but-retryable, malformed or
//! undecodable messages are dropped one at a time, and backend errors are
//! surfaced as status updates.

use tokio_tungstenite::tungstenite::Error as WsError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The audio device could not be acquired (permission denied, no
    /// device, or the sound server is unreachable).
    #[error("audio device unavailable: {0}")]
    PermissionDenied(String),

    /// The duplex channel could not be opened or dropped unexpectedly.
    #[error("connection failure: {0}")]
    ConnectionFailure(#[from] WsError),

    /// An inbound payload could not be parsed as a known event.
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    /// Inbound audio bytes did not form valid PCM.
    #[error("audio decode failure: {0}")]
    DecodeFailure(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
