//! Error types for the link layer.

use stagelink_core::RemoteId;
use std::io;

use crate::socket::SocketError;
use crate::wire::WireError;

/// Errors surfaced by the endpoint, client and server APIs.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// An address or port argument could not be used.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The requested local address is already in use.
    #[error("address {addr} is already in use")]
    AddrInUse {
        /// The address that could not be bound.
        addr: String,
    },

    /// Binding a socket failed for a reason other than address reuse.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The endpoint is already running.
    #[error("endpoint is already running")]
    AlreadyRunning,

    /// No connection exists for the addressed remote.
    #[error("no connection for remote {0}")]
    UnknownRemote(RemoteId),

    /// The peer never completed the version handshake.
    #[error("handshake did not complete")]
    HandshakeFailed,

    /// A socket-level failure.
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// A wire encoding failure.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl LinkError {
    /// Wrap a bind failure, classifying address reuse separately.
    pub(crate) fn from_bind(addr: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::AddrInUse {
            LinkError::AddrInUse {
                addr: addr.to_string(),
            }
        } else {
            LinkError::Bind {
                addr: addr.to_string(),
                source,
            }
        }
    }
}
