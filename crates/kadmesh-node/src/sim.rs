//! In-memory network simulation
//!
//! Every simulated node is a real [`Kad`] whose requests are delivered
//! directly to the target node's handlers instead of going over a wire.
//! Used for the `simulate` command and the integration tests.

use kadmesh_core::{Key, NodeId, NodeInfo};
use kadmesh_dht::{DhtError, Kad, KadConfig, KadNetwork, ProvidersResponse};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type SimNode = Kad<SimNetwork>;

/// Shared state of a simulated network
#[derive(Default)]
pub struct SimRegistry {
    nodes: RwLock<HashMap<NodeId, Weak<SimNode>>>,
    /// Provider records, by the node holding them
    providers: RwLock<HashMap<NodeId, HashMap<Key, Vec<NodeInfo>>>>,
    failing: RwLock<HashSet<NodeId>>,
    latency: Duration,
    requests: AtomicU64,
}

impl SimRegistry {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Default::default()
        })
    }

    /// Create, register and start a node
    pub fn spawn_node(self: &Arc<Self>, info: NodeInfo, config: KadConfig) -> Arc<SimNode> {
        let network = Arc::new(SimNetwork {
            registry: self.clone(),
            local: info.clone(),
        });
        let node = Arc::new(Kad::new(info.clone(), network, config));
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.node_id, Arc::downgrade(&node));
        node.start();
        node
    }

    /// Make a node drop every request sent to it
    pub fn set_failing(&self, node_id: &NodeId, failing: bool) {
        let mut set = self.failing.write().unwrap_or_else(PoisonError::into_inner);
        if failing {
            set.insert(node_id.clone());
        } else {
            set.remove(node_id);
        }
    }

    /// Store a provider record at the `count` nodes truly closest to `key`
    pub fn provide(&self, key: Key, provider: NodeInfo, count: usize) {
        let holders = self.closest_nodes(&key, count);
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        for holder in holders {
            let records = providers.entry(holder).or_default().entry(key).or_default();
            if !records.iter().any(|p| p.node_id == provider.node_id) {
                records.push(provider.clone());
            }
        }
    }

    /// Ground truth: the registered nodes closest to `key`
    pub fn closest_nodes(&self, key: &Key, count: usize) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort_by_key(|id| id.kad_id().distance(key));
        ids.truncate(count);
        ids
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests delivered or attempted so far
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    async fn reach(
        &self,
        peer: &NodeInfo,
        signal: &CancellationToken,
    ) -> kadmesh_dht::Result<Arc<SimNode>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.latency) => {}
                _ = signal.cancelled() => return Err(DhtError::Canceled),
            }
        }

        let failing = self
            .failing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&peer.node_id);
        if failing {
            return Err(DhtError::PeerUnreachable(peer.node_id.clone()));
        }

        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer.node_id)
            .and_then(Weak::upgrade)
            .filter(|node| node.is_started())
            .ok_or_else(|| DhtError::PeerUnreachable(peer.node_id.clone()))
    }

    fn providers_at(&self, holder: &NodeId, key: &Key) -> Vec<NodeInfo> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(holder)
            .and_then(|records| records.get(key))
            .cloned()
            .unwrap_or_default()
    }
}

/// A node's view of the simulated network
pub struct SimNetwork {
    registry: Arc<SimRegistry>,
    local: NodeInfo,
}

impl KadNetwork for SimNetwork {
    async fn find_node(
        &self,
        peer: &NodeInfo,
        key: &Key,
        signal: CancellationToken,
    ) -> kadmesh_dht::Result<Vec<NodeInfo>> {
        let target = self.registry.reach(peer, &signal).await?;
        // The remote side learns about us from the request
        target.add_peer(self.local.clone());
        Ok(target.handle_find_node(key))
    }

    async fn get_providers(
        &self,
        peer: &NodeInfo,
        key: &Key,
        signal: CancellationToken,
    ) -> kadmesh_dht::Result<ProvidersResponse> {
        let target = self.registry.reach(peer, &signal).await?;
        target.add_peer(self.local.clone());
        Ok(ProvidersResponse {
            providers: self.registry.providers_at(&peer.node_id, key),
            closer_peers: target.handle_find_node(key),
        })
    }
}

/// Parameters of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationParams {
    pub nodes: usize,
    pub lookups: usize,
    pub latency: Duration,
    /// Derive lookup keys from this seed instead of the OS RNG
    pub seed: Option<u64>,
    pub config: KadConfig,
}

impl SimulationParams {
    fn lookup_key(&self, index: usize) -> kadmesh_core::Result<Key> {
        match self.seed {
            Some(seed) => Ok(Key::digest(format!("{}-{}", seed, index).as_bytes())),
            None => Key::random(),
        }
    }
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub nodes: usize,
    pub lookups: usize,
    /// Lookups that returned the single closest node
    pub exact_hits: usize,
    /// Average share of the true K closest nodes a lookup returned
    pub mean_recall: f64,
    pub requests: u64,
}

pub fn sim_node_info(index: usize) -> NodeInfo {
    NodeInfo::new(
        format!("sim-{:05}", index),
        format!("10.{}.{}.1:1818", (index >> 8) & 0xff, index & 0xff),
    )
}

/// Create `count` nodes, each bootstrapped from its predecessors, and run their
/// self-queries in order
pub async fn build_network(
    registry: &Arc<SimRegistry>,
    count: usize,
    config: &KadConfig,
) -> kadmesh_dht::Result<Vec<Arc<SimNode>>> {
    let mut nodes: Vec<Arc<SimNode>> = Vec::with_capacity(count);
    for index in 0..count {
        let node = registry.spawn_node(sim_node_info(index), config.clone());
        if let Some(first) = nodes.first() {
            node.add_peer(first.local_info().clone());
        }
        if let Some(previous) = nodes.last() {
            node.add_peer(previous.local_info().clone());
        }
        nodes.push(node);
    }

    for node in &nodes {
        node.query_self().await?;
    }
    tracing::info!("Simulated network of {} nodes is ready", nodes.len());
    Ok(nodes)
}

/// Add a node with its own identity to a running network
///
/// The node is offered every `bootstrap` peer before its self-query. Peers that
/// are not part of the network just fail to answer.
pub async fn join(
    registry: &Arc<SimRegistry>,
    info: NodeInfo,
    bootstrap: &[NodeInfo],
    config: &KadConfig,
) -> kadmesh_dht::Result<Arc<SimNode>> {
    let node = registry.spawn_node(info, config.clone());
    for peer in bootstrap {
        node.add_peer(peer.clone());
    }
    let answered = node.query_self().await?;
    tracing::info!(
        "Node {} joined with {} bootstrap peers, {} answered its self-query",
        node.node_id(),
        bootstrap.len(),
        answered
    );
    Ok(node)
}

/// Build a network and measure how well random lookups converge
pub async fn run_simulation(params: &SimulationParams) -> anyhow::Result<SimulationReport> {
    if params.nodes < 2 {
        anyhow::bail!("a simulation needs at least two nodes");
    }
    let registry = SimRegistry::new(params.latency);
    let nodes = build_network(&registry, params.nodes, &params.config).await?;
    let k = params.config.k;

    let mut exact_hits = 0;
    let mut recall_sum = 0.0;
    for i in 0..params.lookups {
        let key = params.lookup_key(i)?;
        let origin = &nodes[i % nodes.len()];
        let found = origin.find_closest_nodes(&key).await?;

        // The origin never finds itself, so leave it out of the truth
        let truth: Vec<NodeId> = registry
            .closest_nodes(&key, k + 1)
            .into_iter()
            .filter(|id| id != origin.node_id())
            .take(k)
            .collect();
        let found_ids: HashSet<&NodeId> = found.iter().map(|n| &n.node_id).collect();
        let hits = truth.iter().filter(|id| found_ids.contains(id)).count();

        if truth.first().map_or(false, |id| found_ids.contains(id)) {
            exact_hits += 1;
        }
        if !truth.is_empty() {
            recall_sum += hits as f64 / truth.len() as f64;
        }
        tracing::debug!(
            "Lookup {} from {}: {}/{} of the closest nodes found",
            i,
            origin.node_id(),
            hits,
            truth.len()
        );
    }

    for node in &nodes {
        node.stop();
    }

    Ok(SimulationReport {
        nodes: params.nodes,
        lookups: params.lookups,
        exact_hits,
        mean_recall: if params.lookups == 0 {
            0.0
        } else {
            recall_sum / params.lookups as f64
        },
        requests: registry.request_count(),
    })
}
