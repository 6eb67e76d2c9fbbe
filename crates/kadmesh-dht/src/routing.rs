//! Kademlia routing table implementation

use crate::peer_store::PeerStore;
use bitvec::prelude::*;
use kadmesh_core::{xor_distance, Distance, KadId, Key, NodeId, NodeInfo, KEY_LEN};
use std::collections::VecDeque;
use std::sync::Arc;

/// Number of buckets, one per possible common-prefix length
pub const BUCKET_COUNT: usize = KEY_LEN * 8;

/// Find the index of the most significant bit that differs
///
/// Returns `None` for a zero distance (the local node itself).
pub fn bucket_index(distance: &Distance) -> Option<usize> {
    let leading = distance.as_bytes().view_bits::<Msb0>().leading_zeros();
    if leading == BUCKET_COUNT {
        return None;
    }
    Some(BUCKET_COUNT - 1 - leading)
}

/// A peer known to the routing table
#[derive(Debug, Clone)]
pub struct Entry {
    pub node_id: NodeId,
    pub kad_id: KadId,
    /// Order in which the entry was first admitted
    seq: u64,
}

/// Result of offering a peer to the routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// New entry admitted
    Added,
    /// Already known; moved to the most recently seen position
    Updated,
    /// Bucket is at capacity. The caller may check `oldest` for liveness and
    /// remove it to make room.
    BucketFull { oldest: NodeId },
    /// The local node is never stored
    Rejected,
}

/// A k-bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Maximum number of entries in this bucket
    k: usize,
    /// Entries in this bucket, ordered by last seen (most recent at back)
    entries: VecDeque<Entry>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            entries: VecDeque::new(),
        }
    }

    fn upsert(&mut self, entry: Entry) -> AddOutcome {
        if let Some(pos) = self.entries.iter().position(|e| e.node_id == entry.node_id) {
            // Move to back (most recently seen), keeping its admission order
            if let Some(existing) = self.entries.remove(pos) {
                self.entries.push_back(existing);
            }
            return AddOutcome::Updated;
        }

        if self.entries.len() < self.k {
            self.entries.push_back(entry);
            return AddOutcome::Added;
        }

        match self.entries.front() {
            Some(oldest) => AddOutcome::BucketFull {
                oldest: oldest.node_id.clone(),
            },
            // k == 0
            None => AddOutcome::Rejected,
        }
    }

    fn remove(&mut self, node_id: &NodeId) -> bool {
        match self.entries.iter().position(|e| &e.node_id == node_id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Get all entries in the bucket
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check if bucket is full
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.k
    }
}

/// Kademlia routing table
pub struct RoutingTable {
    /// Our node id
    local_id: NodeId,
    local_kad_id: KadId,
    /// K-buckets (256 buckets for 256-bit ids)
    buckets: Vec<KBucket>,
    /// K parameter
    k: usize,
    next_seq: u64,
    peer_store: Arc<PeerStore>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize, peer_store: Arc<PeerStore>) -> Self {
        let local_kad_id = local_id.kad_id();
        Self {
            local_id,
            local_kad_id,
            buckets: (0..BUCKET_COUNT).map(|_| KBucket::new(k)).collect(),
            k,
            next_seq: 0,
            peer_store,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn peer_store(&self) -> &Arc<PeerStore> {
        &self.peer_store
    }

    /// Bucket a peer belongs in, or `None` for the local node
    pub fn bucket_for(&self, node_id: &NodeId) -> Option<usize> {
        let distance = xor_distance(self.local_kad_id.as_bytes(), node_id.kad_id().as_bytes());
        bucket_index(&distance)
    }

    /// Add or update a peer, recording its metadata in the peer store
    pub fn add(&mut self, info: NodeInfo) -> AddOutcome {
        if info.node_id == self.local_id {
            return AddOutcome::Rejected;
        }
        let kad_id = info.kad_id();
        let Some(idx) = bucket_index(&xor_distance(self.local_kad_id.as_bytes(), kad_id.as_bytes()))
        else {
            return AddOutcome::Rejected;
        };

        let entry = Entry {
            node_id: info.node_id.clone(),
            kad_id,
            seq: self.next_seq,
        };
        let outcome = self.buckets[idx].upsert(entry);
        match outcome {
            AddOutcome::Added => {
                self.next_seq += 1;
                self.peer_store.put(info);
            }
            AddOutcome::Updated => self.peer_store.put(info),
            AddOutcome::BucketFull { .. } | AddOutcome::Rejected => {}
        }
        outcome
    }

    /// Remove a peer from its bucket
    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        match self.bucket_for(node_id) {
            Some(idx) => self.buckets[idx].remove(node_id),
            None => false,
        }
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.bucket_for(node_id)
            .map(|idx| self.buckets[idx].entries().any(|e| &e.node_id == node_id))
            .unwrap_or(false)
    }

    pub fn bucket(&self, index: usize) -> Option<&KBucket> {
        self.buckets.get(index)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    /// All known peers, in no particular order
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries())
            .map(|e| e.node_id.clone())
            .collect()
    }

    /// Find the `count` peers closest to a key
    ///
    /// Sorted by ascending XOR distance; equal distances keep admission
    /// order. Peers without metadata in the peer store are skipped.
    pub fn closest_peers(&self, key: &Key, count: usize) -> Vec<NodeInfo> {
        let mut entries: Vec<(Distance, u64, &NodeId)> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries())
            .map(|e| (e.kad_id.distance(key), e.seq, &e.node_id))
            .collect();

        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        entries
            .into_iter()
            .filter_map(|(_, _, node_id)| self.peer_store.get(node_id))
            .take(count)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(k: usize) -> RoutingTable {
        RoutingTable::new(NodeId::new("local"), k, Arc::new(PeerStore::new()))
    }

    fn peer(i: usize) -> NodeInfo {
        NodeInfo::new(format!("peer-{}", i), format!("10.0.0.{}:1818", i % 250))
    }

    #[test]
    fn test_bucket_index() {
        let mut dist = [0u8; 32];
        dist[31] = 1;
        assert_eq!(bucket_index(&Distance::from_bytes(dist)), Some(0));

        dist[31] = 0x80;
        assert_eq!(bucket_index(&Distance::from_bytes(dist)), Some(7));

        dist[0] = 0x80;
        dist[31] = 0;
        assert_eq!(bucket_index(&Distance::from_bytes(dist)), Some(255));

        assert_eq!(bucket_index(&Distance::ZERO), None);
    }

    #[test]
    fn test_empty_table_returns_nothing() {
        let table = table(20);
        assert!(table.closest_peers(&Key::digest(b"x"), 20).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_local_node_rejected() {
        let mut table = table(20);
        assert_eq!(table.add(NodeInfo::new("local", "127.0.0.1:1")), AddOutcome::Rejected);
        assert!(table.is_empty());
    }

    #[test]
    fn test_add_then_update() {
        let mut table = table(20);
        assert_eq!(table.add(peer(1)), AddOutcome::Added);
        assert_eq!(
            table.add(NodeInfo::new("peer-1", "192.168.0.1:1818")),
            AddOutcome::Updated
        );
        assert_eq!(table.len(), 1);
        let info = table.peer_store().get(&NodeId::new("peer-1")).unwrap();
        assert_eq!(info.api_host, "192.168.0.1:1818");
    }

    #[test]
    fn test_closest_peers_sorted_limited_and_without_self() {
        let mut table = table(20);
        for i in 0..100 {
            table.add(peer(i));
        }
        table.add(NodeInfo::new("local", "127.0.0.1:1"));

        let key = Key::digest(b"target");
        let closest = table.closest_peers(&key, 10);
        assert_eq!(closest.len(), 10);
        assert!(closest.iter().all(|n| n.node_id.as_str() != "local"));

        let distances: Vec<Distance> = closest.iter().map(|n| n.kad_id().distance(&key)).collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));

        // Nothing left out is closer than the last returned peer
        let worst = distances[distances.len() - 1];
        let all = table.closest_peers(&key, usize::MAX);
        let closer_count = all.iter().filter(|n| n.kad_id().distance(&key) <= worst).count();
        assert_eq!(closer_count, 10);
    }

    #[test]
    fn test_bucket_capacity_respected() {
        let mut table = table(2);
        let mut per_bucket: std::collections::HashMap<usize, Vec<NodeInfo>> = Default::default();
        for i in 0..200 {
            let info = peer(i);
            if let Some(idx) = table.bucket_for(&info.node_id) {
                per_bucket.entry(idx).or_default().push(info);
            }
        }
        let (idx, candidates) = per_bucket
            .into_iter()
            .find(|(_, v)| v.len() >= 3)
            .expect("some bucket receives three peers");

        assert_eq!(table.add(candidates[0].clone()), AddOutcome::Added);
        assert_eq!(table.add(candidates[1].clone()), AddOutcome::Added);
        assert_eq!(
            table.add(candidates[2].clone()),
            AddOutcome::BucketFull {
                oldest: candidates[0].node_id.clone()
            }
        );
        assert!(table.bucket(idx).unwrap().is_full());
        assert!(!table.contains(&candidates[2].node_id));

        // Evict the oldest and retry
        assert!(table.remove(&candidates[0].node_id));
        assert_eq!(table.add(candidates[2].clone()), AddOutcome::Added);
        assert_eq!(table.bucket(idx).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_metadata_skipped() {
        let mut table = table(20);
        table.add(peer(1));
        table.add(peer(2));
        table.peer_store().remove(&NodeId::new("peer-1"));

        let closest = table.closest_peers(&Key::digest(b"k"), 20);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].node_id.as_str(), "peer-2");
    }
}
