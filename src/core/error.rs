//! Error taxonomy shared by the device client and the transfer orchestrator.

use thiserror::Error;

/// Errors surfaced by device calls and the transfer workflow.
///
/// Every variant carries a human-readable message so callers can show it as-is.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Device did not respond (timeout, refused, unroutable)
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// Response body was malformed or not what the protocol promises
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device answered the request with an error status
    #[error("Request rejected: {0}")]
    RequestRejected(String),

    /// Device reported that the extraction itself failed
    #[error("Extraction failed: {0}")]
    RemoteExtraction(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    /// A device call failed while the workflow was running
    #[error("Request failed: {0}")]
    Request(String),

    /// Download spooling or the payload codec failed
    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("An extraction is already in progress")]
    Busy,

    #[error("No device connected")]
    NotConnected,

    /// Manual-add input rejected before any network call
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure classification carried by `OrchestratorState::Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connection,
    Request,
    RemoteExtraction,
    Processing,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Request => "request",
            Self::RemoteExtraction => "remote-extraction",
            Self::Processing => "processing",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Error {
    /// Map an error raised inside the workflow to the state-machine failure kind.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Connection(_) | Error::Unreachable(_) => FailureKind::Connection,
            Error::RemoteExtraction(_) => FailureKind::RemoteExtraction,
            Error::Processing(_) | Error::Io(_) => FailureKind::Processing,
            Error::Cancelled => FailureKind::Cancelled,
            Error::Protocol(_)
            | Error::RequestRejected(_)
            | Error::Request(_)
            | Error::Busy
            | Error::NotConnected
            | Error::InvalidAddress(_) => FailureKind::Request,
        }
    }

    /// The bare message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            Error::Unreachable(m)
            | Error::Protocol(m)
            | Error::RequestRejected(m)
            | Error::RemoteExtraction(m)
            | Error::Connection(m)
            | Error::Request(m)
            | Error::Processing(m)
            | Error::InvalidAddress(m)
            | Error::Io(m) => m.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            Error::Unreachable(error.to_string())
        } else if error.is_decode() {
            Error::Protocol(error.to_string())
        } else if let Some(status) = error.status() {
            Error::Protocol(format!("unexpected status {}", status))
        } else {
            Error::Unreachable(error.to_string())
        }
    }
}
