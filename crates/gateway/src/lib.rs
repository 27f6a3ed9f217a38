//! Peer-to-peer gateway: the connection manager of a node.
//!
//! Lifecycle:
//! 1. Validate the persist directory and bind the listener
//! 2. Load the known-node set and resolve the advertised address
//! 3. Accept inbound peers and RPC streams
//! 4. Bootstrap from known nodes and run periodic discovery (optional)
//! 5. `close`: stop accepting, disconnect peers, persist nodes, release the
//!    listener
//!
//! Higher layers plug in through [`Gateway::register_rpc`] and
//! [`Gateway::register_connect_call`].

pub mod address;
pub mod dialer;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod lifecycle;
mod nodes;
pub mod peers;
pub mod persist;
pub mod rpc;

pub use {
    address::{AddressResolver, AnnouncedResolver, LocalResolver, NetAddress},
    dialer::{Dialer, TcpDialer},
    error::{ConnectError, Error, PersistError, Result},
    gateway::{Gateway, GatewayBuilder},
    lifecycle::State,
    peers::{Direction, Peer},
    persist::{JsonNodeStore, NodeStore},
    rpc::{RpcHandler, RpcStream},
};
