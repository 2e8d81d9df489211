//! Error types for the someipyd daemon.

use std::fmt;
use std::io;

use crate::wire::DecodeError;

/// Result type for daemon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error from network or IPC operations
    Io(io::Error),
    /// Configuration error (bad file, unparseable values)
    Config(ConfigError),
    /// Malformed wire bytes; the offending message is dropped
    Decode(DecodeError),
    /// Well-formed but logically impossible message
    Protocol(ProtocolError),
    /// RPC attempted while no remote offer is live
    NotAvailable,
    /// TCP connector to the peer is not up
    NotConnected,
    /// RPC exceeded its deadline
    Timeout,
    /// The remote application answered with an ERROR message
    Application(u8),
    /// The IPC peer closed the connection
    IpcClosed,
    /// Service/instance/transport is already offered
    AlreadyOffered,
    /// The daemon is shutting down
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Decode(e) => write!(f, "Decode error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::NotAvailable => write!(f, "Service not available"),
            Error::NotConnected => write!(f, "Service temporarily unavailable (TCP down)"),
            Error::Timeout => write!(f, "Request timed out"),
            Error::Application(code) => write!(f, "Application error (return code 0x{:02x})", code),
            Error::IpcClosed => write!(f, "IPC connection closed"),
            Error::AlreadyOffered => write!(f, "Service/instance is already offered"),
            Error::Shutdown => write!(f, "Daemon has shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Decode(e)
    }
}

/// Configuration error
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

/// Protocol-level error
#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}
