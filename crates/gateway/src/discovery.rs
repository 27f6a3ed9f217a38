//! Node discovery: bootstrapping from the known-node set and trading node
//! lists with peers over the built-in `ShareNodes` RPC.

use std::{
    collections::HashSet,
    sync::{Arc, Weak},
};

use {
    async_trait::async_trait,
    futures::future::join_all,
    rand::seq::IndexedRandom,
    tracing::{debug, info, warn},
};

use crate::{
    address::NetAddress,
    error::{Error, Result},
    gateway::Shared,
    rpc::{RpcHandler, RpcStream},
};

/// Identifier of the built-in node-sharing RPC.
pub const SHARE_NODES_RPC: &str = "ShareNodes";

/// Most nodes sent or accepted in one `ShareNodes` exchange.
pub const MAX_SHARED_NODES: usize = 10;

// ── ShareNodes ───────────────────────────────────────────────────────────────

/// Answers `ShareNodes` with a random slice of the known-node set.
///
/// Holds the gateway weakly: the handler lives inside the gateway's own
/// registry.
pub(crate) struct ShareNodes {
    shared: Weak<Shared>,
}

impl ShareNodes {
    pub fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl RpcHandler for ShareNodes {
    async fn handle(&self, mut stream: RpcStream) -> anyhow::Result<()> {
        let Some(shared) = self.shared.upgrade() else {
            anyhow::bail!("gateway is gone");
        };
        let requester = stream.remote().clone();
        let nodes = shared
            .nodes
            .sample(MAX_SHARED_NODES, |addr| *addr != requester);
        debug!(peer = %requester, count = nodes.len(), "sharing nodes");
        stream.write_message(&nodes).await?;
        Ok(())
    }
}

/// Ask `peer` for nodes and merge the valid ones into the known set.
/// Returns how many were new.
pub(crate) async fn request_nodes(shared: &Shared, peer: &NetAddress) -> Result<usize> {
    let mut nodes = shared
        .call(peer, SHARE_NODES_RPC, |mut stream| async move {
            let nodes: Vec<NetAddress> = stream.read_message().await?;
            Ok::<_, anyhow::Error>(nodes)
        })
        .await?;
    nodes.truncate(MAX_SHARED_NODES);

    let mut added = 0;
    for node in nodes {
        if node == shared.address || !node.is_valid() {
            continue;
        }
        if shared.nodes.insert(node) {
            added += 1;
        }
    }
    debug!(peer = %peer, added, "received nodes");
    Ok(added)
}

// ── Bootstrap ────────────────────────────────────────────────────────────────

/// Connect to random known nodes until the peer target is met or the
/// candidates run out. Returns how many connections succeeded.
pub(crate) async fn bootstrap(shared: &Arc<Shared>) -> usize {
    let target = shared.options.bootstrap_peers;
    let connected: HashSet<NetAddress> = shared.peers.addresses().into_iter().collect();
    let wanted = target.saturating_sub(connected.len());
    if wanted == 0 {
        return 0;
    }

    let candidates = shared
        .nodes
        .sample(wanted, |addr| *addr != shared.address && !connected.contains(addr));
    if candidates.is_empty() {
        return 0;
    }

    let attempts = candidates.into_iter().map(|addr| async move {
        let result = shared.connect(addr.clone()).await;
        (addr, result)
    });
    let mut succeeded = 0;
    for (addr, result) in join_all(attempts).await {
        match result {
            Ok(()) => succeeded += 1,
            Err(Error::Stopped) => {},
            Err(e) => debug!(node = %addr, error = %e, "bootstrap connection failed"),
        }
    }
    if succeeded > 0 {
        info!(connected = succeeded, "bootstrapped peers");
    }
    succeeded
}

/// One discovery round: ask a random peer for nodes, top up the peer set,
/// then persist the known-node set if it changed.
pub(crate) async fn discover_once(shared: &Arc<Shared>) -> Result<()> {
    let peer = shared.peers.addresses().choose(&mut rand::rng()).cloned();
    if let Some(peer) = peer {
        match request_nodes(shared, &peer).await {
            Ok(_) => {},
            Err(Error::Stopped) => return Err(Error::Stopped),
            Err(e) => debug!(peer = %peer, error = %e, "node request failed"),
        }
    }
    if shared.peers.len() < shared.options.bootstrap_peers {
        bootstrap(shared).await;
    }
    shared.flush_nodes(false).await
}

/// Background discovery task; ends when the gateway stops.
pub(crate) async fn run(shared: Arc<Shared>) {
    let token = shared.lifecycle.token().clone();
    tokio::select! {
        _ = token.cancelled() => return,
        _ = bootstrap(&shared) => {},
    }

    let mut interval = tokio::time::interval(shared.options.discovery_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {},
        }
        let round = tokio::select! {
            _ = token.cancelled() => break,
            res = discover_once(&shared) => res,
        };
        match round {
            Ok(()) => {},
            Err(Error::Stopped) => break,
            Err(e) => warn!(error = %e, "discovery round failed"),
        }
    }
    debug!(address = %shared.address, "discovery stopped");
}
