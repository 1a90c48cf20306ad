//! Errors from the session layer.

use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("Unsupported transport scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Unknown key scheme: {0}")]
    UnknownKeyScheme(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Invalid frame length: {0}")]
    InvalidLength(i64),
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("Peer identity not known for session {0}")]
    UnknownPeer(String),
    #[error("Envelope addressed to another node")]
    RecipientMismatch,
    #[error("Sender {claimed} does not match session peer {bound}")]
    IdentityMismatch { claimed: String, bound: String },
    #[error("Signature verification failed")]
    BadSignature,
    #[error("Write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),
    #[error("Session closed")]
    SessionClosed,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Network is already listening")]
    AlreadyListening,
    #[error("Network is closed")]
    NetworkClosed,
    #[error("Stream ids exhausted on this connection")]
    StreamIdsExhausted,
}

impl From<rmp_serde::encode::Error> for WireError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        WireError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for WireError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        WireError::Codec(e.to_string())
    }
}
