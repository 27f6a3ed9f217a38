//! Wire types shared by every gateway connection.
//!
//! A TCP connection between two gateways opens with exactly one [`Header`]
//! frame written by the dialing side and one [`Ack`] frame written back by
//! the accepting side. What follows on the stream belongs to the peer
//! session or to the RPC handler named in the header; the gateway never
//! reads it.

mod frame;

use serde::{Deserialize, Serialize};

pub use frame::{FrameError, FrameStream, codec, framed, read_frame, write_frame};

/// Version spoken in every header and acknowledgement.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame body accepted by [`read_frame`], in bytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Longest accepted RPC identifier.
pub const MAX_RPC_ID_LEN: usize = 16;

/// First frame on every connection, sent by the dialer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Header {
    /// Open a long-lived peer session.
    Session {
        version: u32,
        /// The dialer's advertised `host:port`.
        address: String,
    },
    /// Open a stream carrying a single RPC.
    Rpc {
        version: u32,
        id: String,
        /// The caller's advertised `host:port`.
        address: String,
    },
}

impl Header {
    pub fn version(&self) -> u32 {
        match self {
            Self::Session { version, .. } | Self::Rpc { version, .. } => *version,
        }
    }

    /// Advertised address of the dialing side.
    pub fn address(&self) -> &str {
        match self {
            Self::Session { address, .. } | Self::Rpc { address, .. } => address,
        }
    }
}

/// Reply to a [`Header`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Ack {
    Accepted { version: u32 },
    Rejected { reason: String },
}

impl Ack {
    pub fn accepted() -> Self {
        Self::Accepted {
            version: PROTOCOL_VERSION,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Check an RPC identifier: 1 to [`MAX_RPC_ID_LEN`] printable ASCII characters.
pub fn is_valid_rpc_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_RPC_ID_LEN && id.bytes().all(|b| b.is_ascii_graphic())
}
