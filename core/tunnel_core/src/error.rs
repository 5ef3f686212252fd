//! Error taxonomy and disconnect causes

use std::fmt;
use std::io;

use thiserror::Error;

/// Failures that can end a tunnel session or reject its configuration
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("negotiator unreachable: {0}")]
    NegotiatorUnreachable(String),

    #[error("public IP unavailable: {0}")]
    PublicIpUnavailable(String),

    #[error("port negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("dummy packet request failed: {0}")]
    DummyRequestFailed(String),

    #[error("error sending {kind} packet: {source}")]
    SocketSendFailed {
        kind: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("could not bind {what} socket: {source}")]
    SocketBindFailed {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Cause recorded on the session when this error ends it
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            TunnelError::NegotiatorUnreachable(_) => DisconnectReason::NegotiatorUnreachable,
            TunnelError::PublicIpUnavailable(_) => DisconnectReason::PublicIpUnavailable,
            TunnelError::NegotiationFailed(_) => DisconnectReason::NegotiationFailed,
            TunnelError::DummyRequestFailed(_) => DisconnectReason::DummyRequestFailed,
            TunnelError::SocketBindFailed { .. } => DisconnectReason::SocketBindFailed,
            TunnelError::SocketSendFailed { .. } => DisconnectReason::SocketSendFailed,
            TunnelError::InvalidConfig(_) | TunnelError::Io(_) => DisconnectReason::IoError,
        }
    }
}

/// Why a session reached `Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    NegotiatorUnreachable,
    PublicIpUnavailable,
    NegotiationFailed,
    DummyRequestFailed,
    SocketSendFailed,
    SocketBindFailed,
    KeepAliveTimeout,
    /// Event loop or other local I/O failure
    IoError,
    /// Normal stop requested by the caller
    UserRequested,
}

impl DisconnectReason {
    /// Whether this cause is a failure rather than a normal stop
    pub fn is_error(self) -> bool {
        self != DisconnectReason::UserRequested
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::NegotiatorUnreachable => "negotiator unreachable",
            DisconnectReason::PublicIpUnavailable => "public IP unavailable",
            DisconnectReason::NegotiationFailed => "negotiation failed",
            DisconnectReason::DummyRequestFailed => "dummy request failed",
            DisconnectReason::SocketSendFailed => "socket send failed",
            DisconnectReason::SocketBindFailed => "socket bind failed",
            DisconnectReason::KeepAliveTimeout => "keep-alive timeout",
            DisconnectReason::IoError => "I/O error",
            DisconnectReason::UserRequested => "stopped by user",
        };
        write!(f, "{}", s)
    }
}
