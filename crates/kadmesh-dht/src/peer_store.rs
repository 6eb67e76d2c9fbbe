//! In-memory cache of peer metadata

use kadmesh_core::{NodeId, NodeInfo};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Map from node id to the latest known [`NodeInfo`]
///
/// Written by the routing table and by lookups that discover new peers.
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: RwLock<HashMap<NodeId, NodeInfo>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the metadata for a peer
    pub fn get(&self, node_id: &NodeId) -> Option<NodeInfo> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    /// Store metadata for a peer, replacing any previous record
    pub fn put(&self, info: NodeInfo) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.node_id.clone(), info);
    }

    pub fn remove(&self, node_id: &NodeId) -> Option<NodeInfo> {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_replaces_wholesale() {
        let store = PeerStore::new();
        store.put(NodeInfo::new("a", "10.0.0.1:1818"));
        store.put(NodeInfo::new("a", "10.0.0.2:1818"));

        assert_eq!(store.len(), 1);
        let info = store.get(&NodeId::new("a")).unwrap();
        assert_eq!(info.api_host, "10.0.0.2:1818");
        assert!(store.get(&NodeId::new("b")).is_none());
    }
}
