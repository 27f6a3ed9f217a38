use std::{
    collections::BTreeSet,
    sync::{Mutex, PoisonError},
};

use rand::seq::SliceRandom;

use crate::address::NetAddress;

/// In-memory known-node set with a dirty flag tracking unsaved changes.
#[derive(Debug, Default)]
pub(crate) struct KnownNodes {
    inner: Mutex<NodeSet>,
}

#[derive(Debug, Default)]
struct NodeSet {
    nodes: BTreeSet<NetAddress>,
    dirty: bool,
}

impl KnownNodes {
    pub fn new(nodes: BTreeSet<NetAddress>) -> Self {
        Self {
            inner: Mutex::new(NodeSet {
                nodes,
                dirty: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NodeSet> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a node. Returns `true` if it was not known before.
    pub fn insert(&self, addr: NetAddress) -> bool {
        let mut set = self.lock();
        let added = set.nodes.insert(addr);
        set.dirty |= added;
        added
    }

    pub fn snapshot(&self) -> BTreeSet<NetAddress> {
        self.lock().nodes.clone()
    }

    /// Snapshot and clear the dirty flag, or `None` if nothing changed.
    pub fn take_dirty(&self) -> Option<BTreeSet<NetAddress>> {
        let mut set = self.lock();
        if !set.dirty {
            return None;
        }
        set.dirty = false;
        Some(set.nodes.clone())
    }

    /// Re-flag the set after a failed save so the next flush retries.
    pub fn mark_dirty(&self) {
        self.lock().dirty = true;
    }

    /// Up to `n` random known nodes for which `keep` holds.
    pub fn sample(&self, n: usize, keep: impl Fn(&NetAddress) -> bool) -> Vec<NetAddress> {
        let mut candidates: Vec<NetAddress> =
            self.lock().nodes.iter().filter(|a| keep(a)).cloned().collect();
        candidates.shuffle(&mut rand::rng());
        candidates.truncate(n);
        candidates
    }
}
