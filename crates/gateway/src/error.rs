//! Error types for gateway operations.

use std::{path::PathBuf, time::Duration};

use {nodegate_protocol::FrameError, thiserror::Error};

use crate::address::NetAddress;

/// Gateway error.
#[derive(Debug, Error)]
pub enum Error {
    /// A constructor argument or call argument is unusable.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// Binding the listener failed.
    #[error("failed to listen on {address:?}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The known-node file could not be read, parsed or written.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// Dialing, handshaking with or closing a connection to a peer failed.
    #[error("connection to {address} failed: {source}")]
    Connection {
        address: NetAddress,
        #[source]
        source: ConnectError,
    },

    #[error("already connected to {0}")]
    DuplicatePeer(NetAddress),

    #[error("peer {0} not found")]
    PeerNotFound(NetAddress),

    /// An RPC handler returned an error.
    #[error("rpc {id} with {address} failed: {source}")]
    Rpc {
        id: String,
        address: NetAddress,
        #[source]
        source: anyhow::Error,
    },

    /// The gateway has been closed. Returned by every call after the first `close`.
    #[error("gateway is stopped")]
    Stopped,
}

impl Error {
    pub(crate) fn connection(address: &NetAddress, source: impl Into<ConnectError>) -> Self {
        Self::Connection {
            address: address.clone(),
            source: source.into(),
        }
    }
}

/// Underlying cause of [`Error::Connection`].
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake: {0}")]
    Frame(#[from] FrameError),

    #[error("rejected by remote: {0}")]
    Rejected(String),

    #[error("remote speaks protocol version {0}")]
    Version(u32),

    #[error("connection attempt was cancelled")]
    Cancelled,
}

/// Failure of the known-node store.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt node file {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("node file {} has header {header:?} version {version:?}", .path.display())]
    UnknownFormat {
        path: PathBuf,
        header: String,
        version: String,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode node file: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("node store task failed: {0}")]
    Task(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
