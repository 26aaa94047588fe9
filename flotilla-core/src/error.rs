//! Flotilla error types.
//!
//! Two layers:
//! - [`FlotillaError`] is the internal, `thiserror`-backed error used by Rust
//!   call sites (broker dispatch, procman, transport).
//! - [`ReplyStatus`] is the wire-level taxonomy carried in reply frames. It
//!   is deliberately small and string-stable so non-Rust clients can match
//!   on it.

use std::io;
use thiserror::Error;

/// Wire-level error kind attached to a failed reply.
///
/// Propagation policy: handler errors are captured, attached to the reply
/// frame, and surfaced to the originating client verbatim. The broker never
/// logs client errors as fatal; errors in the broker's own dispatch are
/// logged and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ReplyStatus {
    /// Client input failed schema validation or references an unknown
    /// method/worker field.
    #[serde(rename = "BADARG")]
    BadArg,
    /// Named worker does not exist, is disabled, or is not running.
    #[serde(rename = "NOSUCH")]
    NoSuch,
    /// Worker is known but its connection is being re-established.
    #[serde(rename = "RECOVERING")]
    Recovering,
    /// Request exceeded its effective timeout.
    #[serde(rename = "TIMEDOUT")]
    TimedOut,
    /// Resource (pid file, worker registration) already owned.
    #[serde(rename = "EXISTS")]
    Exists,
    /// Output failed schema validation (client-surfaced form).
    #[serde(rename = "INVALID")]
    Invalid,
    /// Output failed schema validation (server-surfaced form) or the
    /// handler raised uncaught.
    #[serde(rename = "INTERNAL")]
    Internal,
    /// Worker does not implement the requested method.
    #[serde(rename = "UNIMPL")]
    Unimpl,
}

impl ReplyStatus {
    /// The stable wire string for this status, as used in reply frames.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadArg => "BADARG",
            Self::NoSuch => "NOSUCH",
            Self::Recovering => "RECOVERING",
            Self::TimedOut => "TIMEDOUT",
            Self::Exists => "EXISTS",
            Self::Invalid => "INVALID",
            Self::Internal => "INTERNAL",
            Self::Unimpl => "UNIMPL",
        }
    }
}

impl std::fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for Flotilla operations.
#[derive(Error, Debug)]
pub enum FlotillaError {
    /// IO error during socket or process operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error during wire handshake or framing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake timeout.
    #[error("handshake timeout after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// Invalid greeting received.
    #[error("invalid greeting: {0}")]
    InvalidGreeting(String),

    /// Invalid frame format.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Socket closed.
    #[error("socket closed")]
    SocketClosed,

    /// Channel send error.
    #[error("channel send error")]
    ChannelSend,

    /// Channel receive error.
    #[error("channel receive error")]
    ChannelRecv,

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    /// Invalid routing id.
    #[error("invalid routing id")]
    InvalidRoutingId,

    /// Message too large.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A request-level failure that should be surfaced to the client as a
    /// [`ReplyStatus`] rather than treated as an internal fault.
    #[error("{status}: {message}")]
    Reply {
        status: ReplyStatus,
        message: String,
    },
}

/// Result type alias for Flotilla operations.
pub type Result<T> = std::result::Result<T, FlotillaError>;

impl FlotillaError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn invalid_greeting(msg: impl Into<String>) -> Self {
        Self::InvalidGreeting(msg.into())
    }

    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    pub fn peer_disconnected(peer_id: impl Into<String>) -> Self {
        Self::PeerDisconnected(peer_id.into())
    }

    /// Build a client-facing reply failure.
    pub fn reply(status: ReplyStatus, message: impl Into<String>) -> Self {
        Self::Reply {
            status,
            message: message.into(),
        }
    }

    /// The [`ReplyStatus`] this error should be surfaced as, if it
    /// represents a request-level failure rather than a transport fault.
    #[must_use]
    pub const fn reply_status(&self) -> Option<ReplyStatus> {
        match self {
            Self::Reply { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if this error is recoverable at the transport level.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Check if this is a connection-level error.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::SocketClosed | Self::PeerDisconnected(_) | Self::HandshakeTimeout(_)
        )
    }
}
