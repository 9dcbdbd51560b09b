//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! variant maps onto an [`ErrorKind`], which is what crosses the wire in a
//! failed [`CallResult`](crate::comm::CallResult) and what the fault
//! escalation machine counts.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failure.
///
/// The serialized names match the names peers see in failure results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ConnectionError")]
    Connection,
    #[serde(rename = "RemoteTimeoutError")]
    RemoteTimeout,
    #[serde(rename = "RemoteError")]
    Remote,
    #[serde(rename = "InterfaceNotSupportedError")]
    InterfaceNotSupported,
    #[serde(rename = "InvocationError")]
    Invocation,
    #[serde(rename = "MotionError")]
    Motion,
    #[serde(rename = "ImageError")]
    Image,
    #[serde(rename = "ModuleError")]
    Module,
    /// Exclusive resource already in use by another call.
    #[serde(rename = "BusyError")]
    Busy,
    #[serde(rename = "GeneralError")]
    General,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::RemoteTimeout => "RemoteTimeoutError",
            ErrorKind::Remote => "RemoteError",
            ErrorKind::InterfaceNotSupported => "InterfaceNotSupportedError",
            ErrorKind::Invocation => "InvocationError",
            ErrorKind::Motion => "MotionError",
            ErrorKind::Image => "ImageError",
            ErrorKind::Module => "ModuleError",
            ErrorKind::Busy => "BusyError",
            ErrorKind::General => "GeneralError",
        }
    }

    /// Local application kinds, the ones raised by module code itself.
    pub fn is_application(self) -> bool {
        matches!(
            self,
            ErrorKind::Motion
                | ErrorKind::Image
                | ErrorKind::Module
                | ErrorKind::Busy
                | ErrorKind::General
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error enum.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport unreachable (hub down, connect refused, not connected).
    #[error("connection error: {0}")]
    Connection(String),

    /// No reply arrived before the call deadline.
    #[error("remote timeout calling {module}: {message}")]
    RemoteTimeout { module: String, message: String },

    /// Peer failure, rejection, or lost connection.
    #[error("remote error from {module}: <{kind}> {message}")]
    Remote {
        module: String,
        kind: ErrorKind,
        message: String,
    },

    /// Proxy requested for a capability the peer does not implement.
    #[error("interface not supported: {0}")]
    InterfaceNotSupported(String),

    /// Unknown method or bad arguments.
    #[error("invocation error: {0}")]
    Invocation(String),

    /// Error raised by module code (motion, image, module, busy, general).
    #[error("<{kind}> {message}")]
    Application { kind: ErrorKind, message: String },

    /// Construction or configuration misuse.
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wire encoding errors.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Wire decoding errors.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) | Error::Io(_) => ErrorKind::Connection,
            Error::RemoteTimeout { .. } => ErrorKind::RemoteTimeout,
            Error::Remote { .. } => ErrorKind::Remote,
            Error::InterfaceNotSupported(_) => ErrorKind::InterfaceNotSupported,
            Error::Invocation(_) | Error::Serialization(_) => ErrorKind::Invocation,
            Error::Application { kind, .. } => *kind,
            Error::Validation(_) | Error::Encode(_) | Error::Decode(_) => ErrorKind::General,
        }
    }

    /// Message without the kind prefix, as carried in a failure result.
    pub fn message(&self) -> String {
        match self {
            Error::Connection(msg)
            | Error::InterfaceNotSupported(msg)
            | Error::Invocation(msg)
            | Error::Validation(msg) => msg.clone(),
            Error::RemoteTimeout { module, message } => format!("{}: {}", module, message),
            Error::Remote {
                module,
                kind,
                message,
            } => format!("{} ({}): {}", module, kind, message),
            Error::Application { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Wire form of this error, as returned to a remote caller.
    pub fn to_failure(&self) -> crate::comm::CallResult {
        crate::comm::CallResult::Failure {
            kind: self.kind(),
            message: self.message(),
        }
    }

    /// Rebuild an equivalent error. Used to hand one outcome to several
    /// waiters; I/O and codec sources are flattened to their messages.
    pub fn replicate(&self) -> Error {
        match self {
            Error::Connection(msg) => Error::Connection(msg.clone()),
            Error::RemoteTimeout { module, message } => Error::RemoteTimeout {
                module: module.clone(),
                message: message.clone(),
            },
            Error::Remote {
                module,
                kind,
                message,
            } => Error::Remote {
                module: module.clone(),
                kind: *kind,
                message: message.clone(),
            },
            Error::InterfaceNotSupported(msg) => Error::InterfaceNotSupported(msg.clone()),
            Error::Invocation(msg) => Error::Invocation(msg.clone()),
            Error::Application { kind, message } => Error::Application {
                kind: *kind,
                message: message.clone(),
            },
            Error::Validation(msg) => Error::Validation(msg.clone()),
            Error::Serialization(e) => Error::Invocation(e.to_string()),
            Error::Encode(e) => Error::Validation(e.to_string()),
            Error::Decode(e) => Error::Validation(e.to_string()),
            Error::Io(e) => Error::Connection(e.to_string()),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn remote_timeout(module: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RemoteTimeout {
            module: module.into(),
            message: msg.into(),
        }
    }

    pub fn remote(module: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Remote {
            module: module.into(),
            kind: ErrorKind::Remote,
            message: msg.into(),
        }
    }

    pub fn connection_lost(module: impl Into<String>) -> Self {
        Self::remote(module, "connection lost")
    }

    pub fn interface_not_supported(msg: impl Into<String>) -> Self {
        Self::InterfaceNotSupported(msg.into())
    }

    pub fn invocation(msg: impl Into<String>) -> Self {
        Self::Invocation(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn motion(msg: impl Into<String>) -> Self {
        Self::Application {
            kind: ErrorKind::Motion,
            message: msg.into(),
        }
    }

    pub fn image(msg: impl Into<String>) -> Self {
        Self::Application {
            kind: ErrorKind::Image,
            message: msg.into(),
        }
    }

    pub fn module(msg: impl Into<String>) -> Self {
        Self::Application {
            kind: ErrorKind::Module,
            message: msg.into(),
        }
    }

    /// Exclusive resource held by a concurrent call. Not a fault.
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Application {
            kind: ErrorKind::Busy,
            message: msg.into(),
        }
    }

    pub fn general(msg: impl Into<String>) -> Self {
        Self::Application {
            kind: ErrorKind::General,
            message: msg.into(),
        }
    }
}
