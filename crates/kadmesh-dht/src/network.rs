//! Network abstraction for peer queries
//!
//! The DHT never talks to the wire itself. Implementations of [`KadNetwork`]
//! carry requests to remote peers; tests and simulations plug in an
//! in-memory one.

use crate::query::CloserPeers;
use crate::Result;
use kadmesh_core::{Key, NodeInfo};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Reply to a get-providers request
#[derive(Debug, Clone, Default)]
pub struct ProvidersResponse {
    /// Nodes the peer knows to serve the key
    pub providers: Vec<NodeInfo>,
    /// Peers the responder believes are closer to the key
    pub closer_peers: Vec<NodeInfo>,
}

impl CloserPeers for ProvidersResponse {
    fn closer_peers(&self) -> &[NodeInfo] {
        &self.closer_peers
    }
}

/// Requests the DHT sends to remote peers
///
/// `signal` is tripped when the lookup that issued the request is over;
/// implementations should stop waiting for a reply at that point.
pub trait KadNetwork: Send + Sync + 'static {
    /// Ask `peer` for the peers it knows closest to `key`
    fn find_node(
        &self,
        peer: &NodeInfo,
        key: &Key,
        signal: CancellationToken,
    ) -> impl Future<Output = Result<Vec<NodeInfo>>> + Send;

    /// Ask `peer` which nodes provide `key`
    fn get_providers(
        &self,
        peer: &NodeInfo,
        key: &Key,
        signal: CancellationToken,
    ) -> impl Future<Output = Result<ProvidersResponse>> + Send;
}
