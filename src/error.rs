//! Error taxonomy for the audit log server.
//!
//! Mirrors five error kinds: protocol violations,
//! resource exhaustion, transport failures, timeouts, and fatal
//! configuration errors. Only the last one is allowed to propagate past a
//! connection boundary; everything else is handled by tearing down the
//! affected connection.

use std::fmt;
use std::io;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The five error kinds from the error handling design.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad frame size, malformed payload, disallowed transition, missing
    /// required field, or unknown message kind.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Allocation or file-system failure.
    #[error("resource error: {0}")]
    Resource(String),

    /// Socket or TLS failure.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// Read, write, or handshake timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// No listener could be created at startup or reload.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
}

impl Error {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn resource<S: Into<String>>(msg: S) -> Self {
        Self::Resource(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn fatal_config<S: Into<String>>(msg: S) -> Self {
        Self::FatalConfig(msg.into())
    }

    /// Category label for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::Resource(_) => "resource",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::FatalConfig(_) => "fatal_config",
        }
    }

    /// Whether this error should produce an `Error` reply to the client
    /// before the connection closes (protocol and, best-effort, resource
    /// errors do; transport and timeout errors close immediately).
    pub fn wants_reply(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Resource(_))
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Self::Transport(source)
    }
}

/// Wraps a display-only context string onto an I/O error without losing the
/// transport classification, for call sites that want a descriptive message.
pub fn transport_context(source: io::Error, context: impl fmt::Display) -> Error {
    Error::Transport(io::Error::new(source.kind(), format!("{context}: {source}")))
}
