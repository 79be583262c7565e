//! Error taxonomy for netron and its wire envelope.
//!
//! Local failures are reported as [`NetronError`]. Failures that happen while
//! serving a remote request are normalized into a [`RemoteError`] before they
//! cross the wire and turned back into a `NetronError` on arrival, keeping
//! their kind when it is one netron knows about.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for the netron protocol.
#[derive(Error, Debug)]
pub enum NetronError {
    /// An unknown definition, context, stub, task or peer was referenced.
    #[error("{0}")]
    NotExists(String),

    /// Write access to a readonly property.
    #[error("{0}")]
    InvalidAccess(String),

    /// The feature is disabled on the remote side.
    #[error("{0}")]
    NotSupported(String),

    /// A duplicate context, peer, task or proxification.
    #[error("{0}")]
    Exists(String),

    /// A malformed task result, argument or context.
    #[error("{0}")]
    NotValid(String),

    /// No response arrived within the response timeout.
    #[error("{0}")]
    Timeout(String),

    /// A frame could not be decoded.
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// The peer has no active connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A generic error raised by remote code.
    #[error("{message}")]
    Remote {
        /// Error message as reported by the remote side.
        message: String,
        /// Remote stack or backtrace, if any.
        stack: Option<String>,
    },

    /// Payload serialization failed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The connection handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The remote side speaks a different protocol version.
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Our protocol version.
        local: u32,
        /// The remote protocol version.
        remote: u32,
    },

    /// A frame exceeds the maximum allowed size.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Declared frame size.
        size: u32,
        /// Maximum accepted size.
        max: u32,
    },

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with NetronError.
pub type NetronResult<T> = Result<T, NetronError>;

/// Kinds of errors that survive a trip across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotExists,
    InvalidAccess,
    NotSupported,
    Exists,
    NotValid,
    Timeout,
    InvalidPacket,
    /// Anything netron has no dedicated kind for.
    Generic,
}

/// Error envelope transmitted in error responses and task outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Stack or backtrace captured where the error was raised.
    #[serde(default)]
    pub stack: Option<String>,
}

impl RemoteError {
    /// Create an error envelope without a stack.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    /// Restore the local error this envelope describes.
    pub fn into_error(self) -> NetronError {
        let message = self.message;
        match self.kind {
            ErrorKind::NotExists => NetronError::NotExists(message),
            ErrorKind::InvalidAccess => NetronError::InvalidAccess(message),
            ErrorKind::NotSupported => NetronError::NotSupported(message),
            ErrorKind::Exists => NetronError::Exists(message),
            ErrorKind::NotValid => NetronError::NotValid(message),
            ErrorKind::Timeout => NetronError::Timeout(message),
            ErrorKind::InvalidPacket => NetronError::InvalidPacket(message),
            ErrorKind::Generic => NetronError::Remote {
                message,
                stack: self.stack,
            },
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl NetronError {
    /// Kind of this error as seen by a remote peer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetronError::NotExists(_) => ErrorKind::NotExists,
            NetronError::InvalidAccess(_) => ErrorKind::InvalidAccess,
            NetronError::NotSupported(_) => ErrorKind::NotSupported,
            NetronError::Exists(_) => ErrorKind::Exists,
            NetronError::NotValid(_) => ErrorKind::NotValid,
            NetronError::Timeout(_) => ErrorKind::Timeout,
            NetronError::InvalidPacket(_) => ErrorKind::InvalidPacket,
            _ => ErrorKind::Generic,
        }
    }

    /// Normalize this error for transmission.
    ///
    /// Known kinds keep their kind and message; anything else degrades to a
    /// generic error carrying the display message. A remote stack is kept.
    pub fn to_remote(&self) -> RemoteError {
        let stack = match self {
            NetronError::Remote { stack, .. } => stack.clone(),
            _ => None,
        };
        RemoteError {
            kind: self.kind(),
            message: match self {
                NetronError::Remote { message, .. } => message.clone(),
                other => other.to_string(),
            },
            stack,
        }
    }
}

impl From<RemoteError> for NetronError {
    fn from(err: RemoteError) -> Self {
        err.into_error()
    }
}
