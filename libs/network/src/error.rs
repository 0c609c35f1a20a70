//! Network Error Types
//!
//! Error handling for listen setup, dialing, and session operations.
//! Setup failures during `listen` surface as `Err`; later accept and connect
//! failures are recorded on the frame and logged instead.

use crate::session::SessionId;
use std::net::SocketAddr;
use thiserror::Error;

/// Main network error type
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Host/service resolution failed
    #[error("resolve endpoint failed: {source}. address:{host} port:{port}")]
    Resolve {
        host: String,
        port: String,
        source: std::io::Error,
    },

    /// The listening socket could not be created
    #[error("acceptor open failed: {source}. address:{host} port:{port}")]
    SocketOpen {
        host: String,
        port: String,
        source: std::io::Error,
    },

    /// Connection management errors
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<std::io::Error>,
    },

    /// Framing violations
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// No execution context owns this session
    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: SessionId },

    /// Session is closing or already closed
    #[error("Session {session_id} is not open")]
    SessionClosed { session_id: SessionId },

    /// Execution context runtime failures
    #[error("Runtime error: {message}")]
    Runtime {
        message: String,
        source: Option<std::io::Error>,
    },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

impl NetworkError {
    /// Create a resolve error
    pub fn resolve(host: impl Into<String>, port: impl Into<String>, source: std::io::Error) -> Self {
        Self::Resolve {
            host: host.into(),
            port: port.into(),
            source,
        }
    }

    /// Create a socket open error
    pub fn socket_open(
        host: impl Into<String>,
        port: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::SocketOpen {
            host: host.into(),
            port: port.into(),
            source,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: std::io::Error,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: Some(source),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            source: None,
        }
    }

    /// Create a runtime error with source
    pub fn runtime_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Runtime {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// The underlying OS error, if any
    pub fn io_source(&self) -> Option<&std::io::Error> {
        match self {
            NetworkError::Resolve { source, .. }
            | NetworkError::SocketOpen { source, .. }
            | NetworkError::Io { source, .. } => Some(source),
            NetworkError::Connection { source, .. } | NetworkError::Runtime { source, .. } => {
                source.as_ref()
            }
            _ => None,
        }
    }

    /// Setup errors are raised synchronously from `listen` and are fatal for
    /// that listener
    pub fn is_fatal_setup(&self) -> bool {
        matches!(self, NetworkError::Resolve { .. } | NetworkError::SocketOpen { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            NetworkError::Resolve { .. } => "resolve",
            NetworkError::SocketOpen { .. } => "socket_open",
            NetworkError::Connection { .. } => "connection",
            NetworkError::Protocol { .. } => "protocol",
            NetworkError::SessionNotFound { .. } => "session_not_found",
            NetworkError::SessionClosed { .. } => "session_closed",
            NetworkError::Runtime { .. } => "runtime",
            NetworkError::Io { .. } => "io",
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string(), err)
    }
}
