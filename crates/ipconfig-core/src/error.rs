//! Error types for the ipconfig system
//!
//! Two families live here. [`Error`] covers ambient failures (capture devices,
//! stores, configuration). [`Status`] is the outcome code a configuration
//! method reports for a service and is what gets published.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ipconfig operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the ipconfig system
#[derive(Error, Debug)]
pub enum Error {
    /// Raw link-capture errors (open, filter, ioctl, read, write)
    #[error("Capture error on {interface}: {message}")]
    Capture {
        /// Interface the capture handle belongs to
        interface: String,
        /// Error message
        message: String,
    },

    /// Publish/configuration store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Interface control errors (address assignment, admin state)
    #[error("Interface control error: {0}")]
    Control(String),

    /// Protocol transport errors (DHCP, DHCPv6)
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed link-layer frame
    #[error("Malformed frame: {0}")]
    Frame(String),

    /// Unknown interface
    #[error("Interface not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a capture error for an interface
    pub fn capture(interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Capture {
            interface: interface.into(),
            message: message.into(),
        }
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an interface control error
    pub fn control(msg: impl Into<String>) -> Self {
        Self::Control(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a frame error
    pub fn frame(msg: impl Into<String>) -> Self {
        Self::Frame(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// Outcome code of a configuration method
///
/// `Success` with `ready == false` means the method is still working.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[error("success")]
    Success,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("operation not supported")]
    OperationNotSupported,
    #[error("address in use")]
    AddressInUse,
    #[error("no server")]
    NoServer,
    #[error("lease terminated")]
    LeaseTerminated,
    #[error("lease expired")]
    LeaseExpired,
    #[error("media inactive")]
    MediaInactive,
    #[error("address timed out")]
    AddressTimedOut,
    #[error("resource unavailable")]
    ResourceUnavailable,
    #[error("internal error")]
    InternalError,
}

impl Status {
    /// Whether this is the success code
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}
