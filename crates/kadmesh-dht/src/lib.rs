//! Kadmesh DHT - Kademlia routing and disjoint-path lookups
//!
//! This crate provides the routing table, the bounded-concurrency query
//! queue and the query manager that walks the network towards a key, plus a
//! discovery facade built on top of them.

pub mod gate;
pub mod kad;
pub mod network;
pub mod peer_store;
pub mod query;
pub mod queue;
pub mod routing;

pub use gate::SelfQueryGate;
pub use kad::Kad;
pub use network::{KadNetwork, ProvidersResponse};
pub use peer_store::PeerStore;
pub use query::{CloserPeers, PeerResponse, QueryContext, QueryManager, QueryOptions, QueryStream};
pub use queue::{Queue, QueueStream, TaskHandle};
pub use routing::{AddOutcome, RoutingTable};

use kadmesh_core::{NodeId, ALPHA, DEFAULT_QUERY_TIMEOUT, K};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Query manager not started")]
    NotStarted,

    #[error("Query was canceled")]
    Canceled,

    #[error("Peer {0} unreachable")]
    PeerUnreachable(NodeId),

    #[error("Query to peer {node_id} failed: {reason}")]
    PeerQueryFailed { node_id: NodeId, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error(transparent)]
    Core(#[from] kadmesh_core::Error),
}

pub type Result<T> = std::result::Result<T, DhtError>;

/// DHT node configuration
#[derive(Debug, Clone)]
pub struct KadConfig {
    /// Number of nodes per k-bucket
    pub k: usize,
    /// Parallelism factor for lookups
    pub alpha: usize,
    /// Number of seed peers a lookup starts from
    pub disjoint_paths: usize,
    /// Upper bound on the duration of a single lookup
    pub query_timeout: Duration,
}

impl Default for KadConfig {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            disjoint_paths: K,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}
