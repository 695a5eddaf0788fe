//! Error types
//!
//! API-level failures use [`Error`]. Everything that happens to a single queued
//! attribute operation is reported as an [`OperationError`], and a transport that
//! refuses to start a call answers with a [`TransportError`].

use crate::domain::models::{AttributeHandle, GattStatus};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("invalid uuid: {0}")]
    InvalidUuid(String),

    #[error("no tokio runtime available: {0}")]
    Runtime(String),

    #[error("settings error: {0}")]
    Settings(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Returned synchronously by a [`Transport`](crate::infrastructure::bluetooth::transport::Transport)
/// call that could not be initiated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport returned status {0}")]
    Status(GattStatus),

    /// The native handle is gone; the connection epoch cannot continue.
    #[error("transport handle is unusable")]
    HandleUnusable,

    #[error("transport error: {0}")]
    Other(String),
}

/// Why a submission was refused before it reached the queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RejectReason {
    #[error("peer is not connected")]
    NotConnected,

    #[error("attribute {0} is not in the current registry")]
    UnknownAttribute(AttributeHandle),

    #[error("attribute {0} is not a characteristic")]
    NotACharacteristic(AttributeHandle),

    #[error("characteristic {0} has no client configuration descriptor")]
    MissingConfigDescriptor(AttributeHandle),
}

/// Outcome of a failed queued operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("gatt error {0}")]
    Gatt(GattStatus),

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("rejected: {0}")]
    Rejected(#[from] RejectReason),
}

impl From<TransportError> for OperationError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Status(status) => OperationError::Gatt(status),
            TransportError::HandleUnusable => OperationError::Fatal(err.to_string()),
            TransportError::Other(msg) => OperationError::Fatal(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
