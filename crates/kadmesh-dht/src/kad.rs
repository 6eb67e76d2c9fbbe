//! Node discovery on top of the query manager
//!
//! [`Kad`] ties a routing table, a peer store and a [`QueryManager`] to a
//! [`KadNetwork`] and offers the lookups a node actually performs: the
//! initial self-query, finding the nodes closest to a key, and finding the
//! providers of a key.

use crate::gate::SelfQueryGate;
use crate::network::{KadNetwork, ProvidersResponse};
use crate::peer_store::PeerStore;
use crate::query::{PeerResponse, QueryManager, QueryOptions};
use crate::routing::{AddOutcome, RoutingTable};
use crate::{KadConfig, Result};
use futures::StreamExt;
use kadmesh_core::{Key, NodeId, NodeInfo};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A DHT participant
pub struct Kad<N> {
    local: NodeInfo,
    network: Arc<N>,
    routing_table: Arc<RwLock<RoutingTable>>,
    peer_store: Arc<PeerStore>,
    query_manager: QueryManager,
    self_query: SelfQueryGate,
    config: KadConfig,
}

impl<N: KadNetwork> Kad<N> {
    pub fn new(local: NodeInfo, network: Arc<N>, config: KadConfig) -> Self {
        let peer_store = Arc::new(PeerStore::new());
        let routing_table = Arc::new(RwLock::new(RoutingTable::new(
            local.node_id.clone(),
            config.k,
            peer_store.clone(),
        )));
        let self_query = SelfQueryGate::new();
        let query_manager = QueryManager::new(routing_table.clone(), self_query.clone(), &config);

        Self {
            local,
            network,
            routing_table,
            peer_store,
            query_manager,
            self_query,
            config,
        }
    }

    pub fn local_info(&self) -> &NodeInfo {
        &self.local
    }

    pub fn node_id(&self) -> &NodeId {
        &self.local.node_id
    }

    pub fn config(&self) -> &KadConfig {
        &self.config
    }

    pub fn peer_store(&self) -> &Arc<PeerStore> {
        &self.peer_store
    }

    pub fn query_manager(&self) -> &QueryManager {
        &self.query_manager
    }

    pub fn self_query_gate(&self) -> &SelfQueryGate {
        &self.self_query
    }

    fn table(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routing_table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn table_mut(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.routing_table.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) {
        self.query_manager.start();
        tracing::info!("DHT node {} started", self.local.node_id);
    }

    pub fn stop(&self) {
        self.query_manager.stop();
        tracing::info!("DHT node {} stopped", self.local.node_id);
    }

    pub fn is_started(&self) -> bool {
        self.query_manager.is_started()
    }

    /// Offer a peer to the routing table
    pub fn add_peer(&self, info: NodeInfo) -> AddOutcome {
        let node_id = info.node_id.clone();
        let outcome = self.table_mut().add(info);
        if let AddOutcome::BucketFull { oldest } = &outcome {
            tracing::trace!("Bucket full for {}, oldest entry is {}", node_id, oldest);
        }
        outcome
    }

    pub fn remove_peer(&self, node_id: &NodeId) -> bool {
        self.table_mut().remove(node_id)
    }

    /// Every peer in the routing table
    pub fn known_nodes(&self) -> Vec<NodeInfo> {
        let ids = self.table().node_ids();
        ids.iter().filter_map(|id| self.peer_store.get(id)).collect()
    }

    pub fn closest_peers(&self, key: &Key, count: usize) -> Vec<NodeInfo> {
        self.table().closest_peers(key, count)
    }

    /// Answer a remote find-node request from the local routing table
    pub fn handle_find_node(&self, key: &Key) -> Vec<NodeInfo> {
        self.closest_peers(key, self.config.k)
    }

    /// Look up our own id to fill the routing table
    ///
    /// Opens the self-query gate afterwards, whether or not the lookup
    /// succeeded. Returns how many peers answered.
    pub async fn query_self(&self) -> Result<usize> {
        let key = Key::from(&self.local.node_id);
        let outcome = self
            .walk_closest(key, QueryOptions::default().self_query(), true)
            .await;
        self.self_query.resolve();

        let responders = outcome?;
        tracing::info!(
            "Self-query for {} reached {} peers, routing table has {}",
            self.local.node_id,
            responders.len(),
            self.table().len()
        );
        Ok(responders.len())
    }

    /// Find up to K responding nodes closest to `key`
    pub async fn find_closest_nodes(&self, key: &Key) -> Result<Vec<NodeInfo>> {
        self.walk_closest(*key, QueryOptions::default(), false).await
    }

    async fn walk_closest(
        &self,
        key: Key,
        options: QueryOptions,
        learn_closer: bool,
    ) -> Result<Vec<NodeInfo>> {
        let network = self.network.clone();
        let mut stream = self.query_manager.run_on_closest_peers(
            key,
            move |ctx| {
                let network = network.clone();
                async move { network.find_node(&ctx.node_info, &ctx.key, ctx.signal).await }
            },
            options,
        )?;

        let mut responders = Vec::new();
        while let Some(response) = stream.next().await {
            let response: PeerResponse<Vec<NodeInfo>> = response?;
            if response.error().is_some() {
                continue;
            }
            if learn_closer {
                for peer in response.closer_peers() {
                    self.add_peer(peer.clone());
                }
            }
            if let Some(info) = self.peer_store.get(&response.from_node_id) {
                self.add_peer(info.clone());
                responders.push(info);
            }
        }

        responders.sort_by_key(|n| n.kad_id().distance(&key));
        responders.truncate(self.config.k);
        Ok(responders)
    }

    /// Find the nodes that provide `key`
    pub async fn find_provider_nodes(&self, key: &Key) -> Result<Vec<NodeInfo>> {
        let network = self.network.clone();
        let mut stream = self.query_manager.run_on_closest_peers(
            *key,
            move |ctx| {
                let network = network.clone();
                async move { network.get_providers(&ctx.node_info, &ctx.key, ctx.signal).await }
            },
            QueryOptions::default(),
        )?;

        let mut seen = HashSet::new();
        let mut providers = Vec::new();
        while let Some(response) = stream.next().await {
            let response: PeerResponse<ProvidersResponse> = response?;
            if let Ok(found) = response.result {
                for provider in found.providers {
                    if seen.insert(provider.node_id.clone()) {
                        providers.push(provider);
                    }
                }
            }
        }

        tracing::debug!("Found {} providers for {}", providers.len(), key);
        Ok(providers)
    }
}
