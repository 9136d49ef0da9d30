//! Error types returned by bridge operations.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::correlation::RequestKind;
use crate::meshtastic::transport::TransportError;

/// Errors surfaced to callers of the bridge API.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Link not connected, write failed, or the link went away mid-request.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The device is connected but its identity has not been captured yet.
    #[error("device configuration not captured yet")]
    NotReady,

    /// A payload from the device could not be decoded.
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    /// No correlated response arrived before the deadline.
    #[error("no response to {kind} request 0x{request_id:08x} for {destination} after {waited:?}")]
    Timeout {
        kind: RequestKind,
        request_id: u32,
        destination: String,
        waited: Duration,
    },

    #[error("{feature} requires firmware {required} or newer (found {found})")]
    FirmwareUnsupported {
        feature: &'static str,
        required: String,
        found: String,
    },

    #[error("a configuration edit transaction is already open")]
    TransactionConflict,

    #[error("session passkey unavailable for {node}: {reason}")]
    PasskeyUnavailable { node: String, reason: String },

    /// The mesh reported a routing error for a correlated request.
    #[error("mesh routing error: {reason}")]
    Routing { reason: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Stable classification for the REST layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    ProtocolDecode,
    Timeout,
    FirmwareUnsupported,
    TransactionConflict,
    PasskeyUnavailable,
    Routing,
    BadRequest,
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Transport(_) | BridgeError::NotReady => ErrorKind::Transport,
            BridgeError::ProtocolDecode(_) | BridgeError::UnexpectedResponse(_) => {
                ErrorKind::ProtocolDecode
            }
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::FirmwareUnsupported { .. } => ErrorKind::FirmwareUnsupported,
            BridgeError::TransactionConflict => ErrorKind::TransactionConflict,
            BridgeError::PasskeyUnavailable { .. } => ErrorKind::PasskeyUnavailable,
            BridgeError::Routing { .. } => ErrorKind::Routing,
            BridgeError::InvalidArgument(_) => ErrorKind::BadRequest,
        }
    }

    /// Whether a caller may reasonably retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::PasskeyUnavailable
        )
    }
}

impl From<prost::DecodeError> for BridgeError {
    fn from(e: prost::DecodeError) -> Self {
        BridgeError::ProtocolDecode(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
