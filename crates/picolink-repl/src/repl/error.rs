//! Driver error type.

use serde::{Deserialize, Serialize};

/// Categorised driver error.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("[REPL {kind:?}] {message}")]
pub struct ReplError {
    pub kind: ReplErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplErrorKind {
    /// Port could not be opened, read or written.
    TransportFailure,
    /// No connection is open.
    NotConnected,
    /// The read side of the port is already leased.
    ReaderBusy,
    /// The write side of the port is already leased.
    WriterBusy,
    /// An expected marker never arrived.
    ProtocolTimeout,
    /// The connection was closed while waiting.
    Cancelled,
    /// Upload payload at or above the configured limit.
    SizeLimitExceeded,
    /// A generated script reported failure.
    DeviceScriptFailure,
    /// Another high-level operation holds the session.
    SessionBusy,
    /// Path or file name rejected before reaching the device.
    InvalidPath,
    /// Device output could not be parsed.
    ParseError,
    /// Config / parameter validation error.
    InvalidConfig,
}

pub type ReplResult<T> = Result<T, ReplError>;

impl ReplError {
    pub fn new(kind: ReplErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::TransportFailure, msg)
    }

    pub fn not_connected() -> Self {
        Self::new(ReplErrorKind::NotConnected, "no device connected")
    }

    pub fn reader_busy(port: &str) -> Self {
        Self::new(
            ReplErrorKind::ReaderBusy,
            format!("reader of '{}' is already in use", port),
        )
    }

    pub fn writer_busy(port: &str) -> Self {
        Self::new(
            ReplErrorKind::WriterBusy,
            format!("writer of '{}' is already in use", port),
        )
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::ProtocolTimeout, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ReplErrorKind::Cancelled, "connection closed while waiting")
    }

    pub fn size_limit(len: usize, limit: usize) -> Self {
        Self::new(
            ReplErrorKind::SizeLimitExceeded,
            format!("file of {} bytes is too large (limit {} bytes)", len, limit),
        )
    }

    pub fn script_failed(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::DeviceScriptFailure, msg)
    }

    pub fn busy() -> Self {
        Self::new(
            ReplErrorKind::SessionBusy,
            "another operation is already running",
        )
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::InvalidPath, msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::ParseError, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::InvalidConfig, msg)
    }

    /// True when the error came from a connection going away, not from the
    /// device misbehaving.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self.kind,
            ReplErrorKind::Cancelled | ReplErrorKind::NotConnected
        )
    }
}

impl From<std::io::Error> for ReplError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e))
        } else {
            Self::transport(e.to_string())
        }
    }
}

impl From<serialport::Error> for ReplError {
    fn from(e: serialport::Error) -> Self {
        Self::transport(e.to_string())
    }
}

impl From<serde_json::Error> for ReplError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(e.to_string())
    }
}

impl From<ReplError> for String {
    fn from(e: ReplError) -> String {
        e.to_string()
    }
}
