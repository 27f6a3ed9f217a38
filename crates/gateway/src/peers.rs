//! Thread-safe table of connected peers.

use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
    time::Instant,
};

use {serde::Serialize, tokio::sync::oneshot, tokio_util::sync::CancellationToken};

use crate::{
    address::NetAddress,
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Descriptor of a connected peer, as returned by `Gateway::peers`.
#[derive(Debug, Clone)]
pub struct Peer {
    pub net_address: NetAddress,
    pub direction: Direction,
    pub connected_since: Instant,
}

/// Table entry: the descriptor plus the handles that end the session.
#[derive(Debug)]
pub(crate) struct PeerEntry {
    pub peer: Peer,
    conn_id: u64,
    /// Outbound entries stay pending until their handshake is acknowledged.
    pending: bool,
    cancel: CancellationToken,
    closed: oneshot::Receiver<std::io::Result<()>>,
}

/// What the session task needs to serve a freshly inserted peer.
#[derive(Debug)]
pub(crate) struct SessionSlot {
    pub conn_id: u64,
    pub cancel: CancellationToken,
    pub closed: oneshot::Sender<std::io::Result<()>>,
}

impl PeerEntry {
    /// Stop the session task and wait for it to shut the socket down.
    pub async fn disconnect(self) -> std::io::Result<()> {
        self.cancel.cancel();
        // A dropped sender means the task already finished on its own.
        self.closed.await.unwrap_or(Ok(()))
    }
}

#[derive(Debug, Default)]
struct Inner {
    peers: BTreeMap<NetAddress, PeerEntry>,
    next_conn_id: u64,
    closed: bool,
}

/// Connected peers keyed by address.
///
/// Every check-then-mutate sequence happens under one lock acquisition.
/// Once [`PeerTable::close`] has run the table refuses further inserts.
#[derive(Debug, Default)]
pub(crate) struct PeerTable {
    inner: Mutex<Inner>,
}

impl PeerTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, addr: &NetAddress) -> bool {
        self.lock().peers.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    /// Insert `addr` unless it is already present or the table is closed.
    ///
    /// `parent` is the gateway's shutdown token; the session is cancelled
    /// when either it or the returned slot's token fires. Outbound entries
    /// start pending and are hidden from [`PeerTable::snapshot`] until
    /// [`PeerTable::establish`] confirms them.
    pub fn insert(
        &self,
        addr: NetAddress,
        direction: Direction,
        parent: &CancellationToken,
    ) -> Result<SessionSlot> {
        self.insert_with(addr, direction, parent, false)
    }

    /// Insert an accepted inbound session.
    ///
    /// With `supersede_pending` set, a pending outbound entry for the same
    /// address is cancelled and replaced; an established entry is never
    /// replaced.
    pub fn insert_inbound(
        &self,
        addr: NetAddress,
        parent: &CancellationToken,
        supersede_pending: bool,
    ) -> Result<SessionSlot> {
        self.insert_with(addr, Direction::Inbound, parent, supersede_pending)
    }

    fn insert_with(
        &self,
        addr: NetAddress,
        direction: Direction,
        parent: &CancellationToken,
        supersede_pending: bool,
    ) -> Result<SessionSlot> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::Stopped);
        }
        if let Some(existing) = inner.peers.get(&addr) {
            if !(supersede_pending && existing.pending) {
                return Err(Error::DuplicatePeer(addr));
            }
            if let Some(old) = inner.peers.remove(&addr) {
                old.cancel.cancel();
            }
        }
        inner.next_conn_id += 1;
        let conn_id = inner.next_conn_id;
        let cancel = parent.child_token();
        let (tx, rx) = oneshot::channel();
        inner.peers.insert(addr.clone(), PeerEntry {
            peer: Peer {
                net_address: addr,
                direction,
                connected_since: Instant::now(),
            },
            conn_id,
            pending: direction == Direction::Outbound,
            cancel: cancel.clone(),
            closed: rx,
        });
        Ok(SessionSlot {
            conn_id,
            cancel,
            closed: tx,
        })
    }

    /// Mark the pending entry of connection `conn_id` as connected.
    ///
    /// Returns `false` when the entry was removed or replaced meanwhile.
    pub fn establish(&self, addr: &NetAddress, conn_id: u64) -> bool {
        let mut inner = self.lock();
        match inner.peers.get_mut(addr) {
            Some(entry) if entry.conn_id == conn_id && !entry.cancel.is_cancelled() => {
                entry.pending = false;
                entry.peer.connected_since = Instant::now();
                true
            },
            _ => false,
        }
    }

    /// Remove `addr` and cancel its session in the same critical section.
    pub fn remove(&self, addr: &NetAddress) -> Option<PeerEntry> {
        let mut inner = self.lock();
        let entry = inner.peers.remove(addr)?;
        entry.cancel.cancel();
        Some(entry)
    }

    /// Remove `addr` only if it still belongs to connection `conn_id`.
    pub fn remove_conn(&self, addr: &NetAddress, conn_id: u64) -> bool {
        let mut inner = self.lock();
        if inner.peers.get(addr).is_some_and(|e| e.conn_id == conn_id) {
            inner.peers.remove(addr);
            return true;
        }
        false
    }

    /// Connected peers in address order. Pending dials are left out.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.lock()
            .peers
            .values()
            .filter(|e| !e.pending)
            .map(|e| e.peer.clone())
            .collect()
    }

    pub fn addresses(&self) -> Vec<NetAddress> {
        self.lock().peers.keys().cloned().collect()
    }

    /// Refuse future inserts and hand back every entry for teardown.
    pub fn close(&self) -> Vec<PeerEntry> {
        let mut inner = self.lock();
        inner.closed = true;
        std::mem::take(&mut inner.peers).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NetAddress {
        NetAddress::from(s)
    }

    #[test]
    fn insert_rejects_duplicates() {
        let table = PeerTable::default();
        let root = CancellationToken::new();
        table
            .insert(addr("10.0.0.1:1"), Direction::Outbound, &root)
            .unwrap();
        assert!(matches!(
            table.insert(addr("10.0.0.1:1"), Direction::Inbound, &root),
            Err(Error::DuplicatePeer(a)) if a == addr("10.0.0.1:1")
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn pending_outbound_is_hidden_until_established() {
        let table = PeerTable::default();
        let root = CancellationToken::new();
        let slot = table
            .insert(addr("10.0.0.1:1"), Direction::Outbound, &root)
            .unwrap();
        assert!(table.snapshot().is_empty());
        assert!(table.contains(&addr("10.0.0.1:1")));

        assert!(!table.establish(&addr("10.0.0.1:1"), slot.conn_id + 1));
        assert!(table.establish(&addr("10.0.0.1:1"), slot.conn_id));
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn removed_entry_cannot_be_established() {
        let table = PeerTable::default();
        let root = CancellationToken::new();
        let slot = table
            .insert(addr("10.0.0.1:1"), Direction::Outbound, &root)
            .unwrap();
        table.remove(&addr("10.0.0.1:1"));
        assert!(!table.establish(&addr("10.0.0.1:1"), slot.conn_id));
        assert!(!table.contains(&addr("10.0.0.1:1")));
    }

    #[test]
    fn inbound_supersedes_only_pending_outbound() {
        let table = PeerTable::default();
        let root = CancellationToken::new();
        let dial = table
            .insert(addr("10.0.0.1:1"), Direction::Outbound, &root)
            .unwrap();

        assert!(matches!(
            table.insert_inbound(addr("10.0.0.1:1"), &root, false),
            Err(Error::DuplicatePeer(_))
        ));
        assert!(!dial.cancel.is_cancelled());

        let accepted = table
            .insert_inbound(addr("10.0.0.1:1"), &root, true)
            .unwrap();
        assert!(dial.cancel.is_cancelled());
        assert!(!table.establish(&addr("10.0.0.1:1"), dial.conn_id));
        let peers = table.snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].direction, Direction::Inbound);

        // Established entries are never replaced.
        assert!(matches!(
            table.insert_inbound(addr("10.0.0.1:1"), &root, true),
            Err(Error::DuplicatePeer(_))
        ));
        assert!(!accepted.cancel.is_cancelled());
    }

    #[test]
    fn snapshot_is_ordered_copy() {
        let table = PeerTable::default();
        let root = CancellationToken::new();
        for a in ["10.0.0.3:1", "10.0.0.1:1", "10.0.0.2:1"] {
            table.insert(addr(a), Direction::Inbound, &root).unwrap();
        }
        let snapshot = table.snapshot();
        table.remove(&addr("10.0.0.2:1"));
        let order: Vec<_> = snapshot.iter().map(|p| p.net_address.as_str()).collect();
        assert_eq!(order, ["10.0.0.1:1", "10.0.0.2:1", "10.0.0.3:1"]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn remove_cancels_session() {
        let table = PeerTable::default();
        let root = CancellationToken::new();
        let slot = table
            .insert(addr("10.0.0.1:1"), Direction::Outbound, &root)
            .unwrap();
        assert!(!slot.cancel.is_cancelled());
        assert!(table.remove(&addr("10.0.0.1:1")).is_some());
        assert!(slot.cancel.is_cancelled());
        assert!(table.remove(&addr("10.0.0.1:1")).is_none());
    }

    #[test]
    fn remove_conn_ignores_replaced_entry() {
        let table = PeerTable::default();
        let root = CancellationToken::new();
        let first = table
            .insert(addr("10.0.0.1:1"), Direction::Outbound, &root)
            .unwrap();
        table.remove(&addr("10.0.0.1:1"));
        let second = table
            .insert(addr("10.0.0.1:1"), Direction::Inbound, &root)
            .unwrap();
        assert!(!table.remove_conn(&addr("10.0.0.1:1"), first.conn_id));
        assert!(table.contains(&addr("10.0.0.1:1")));
        assert!(table.remove_conn(&addr("10.0.0.1:1"), second.conn_id));
        assert!(!table.contains(&addr("10.0.0.1:1")));
    }

    #[test]
    fn closed_table_refuses_inserts() {
        let table = PeerTable::default();
        let root = CancellationToken::new();
        table
            .insert(addr("10.0.0.1:1"), Direction::Outbound, &root)
            .unwrap();
        let drained = table.close();
        assert_eq!(drained.len(), 1);
        assert!(matches!(
            table.insert(addr("10.0.0.2:1"), Direction::Outbound, &root),
            Err(Error::Stopped)
        ));
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn parent_cancellation_reaches_sessions() {
        let table = PeerTable::default();
        let root = CancellationToken::new();
        let slot = table
            .insert(addr("10.0.0.1:1"), Direction::Outbound, &root)
            .unwrap();
        root.cancel();
        assert!(slot.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn disconnect_reports_session_result() {
        let table = PeerTable::default();
        let root = CancellationToken::new();
        let slot = table
            .insert(addr("10.0.0.1:1"), Direction::Outbound, &root)
            .unwrap();
        let session = tokio::spawn(async move {
            slot.cancel.cancelled().await;
            let _ = slot
                .closed
                .send(Err(std::io::Error::other("shutdown failed")));
        });
        let entry = table.remove(&addr("10.0.0.1:1")).unwrap();
        assert!(entry.disconnect().await.is_err());
        session.await.unwrap();
    }
}
