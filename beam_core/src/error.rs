use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BeamError {
    /// Connect/accept/read/write failure on a stream or file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Peer {0} unreachable: connect timed out")]
    Unreachable(SocketAddr),

    /// Malformed or truncated header/reply.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transfer declined by peer")]
    Declined,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Pairing code mismatch")]
    PairingMismatch,

    #[error("Pairing code from {0} does not belong to the live attempt")]
    ForeignPairingSource(SocketAddr),

    #[error("No pairing attempt in progress")]
    NoPairingAttempt,

    #[error("Radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("Peer {0} has no known endpoint")]
    NoEndpoint(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Unknown transfer request: {0}")]
    UnknownRequest(String),

    #[error("Not running")]
    NotRunning,

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl BeamError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        BeamError::Protocol(msg.into())
    }

    /// Locally initiated; never surfaced to the user as an error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BeamError::Cancelled)
    }

    pub fn is_declined(&self) -> bool {
        matches!(self, BeamError::Declined)
    }
}

pub type Result<T> = std::result::Result<T, BeamError>;
