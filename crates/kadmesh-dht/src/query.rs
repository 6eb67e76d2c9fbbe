//! Disjoint-path lookups over the routing table
//!
//! A lookup seeds itself from the routing table's closest peers, queries
//! them through a bounded [`Queue`], and follows every reported peer that is
//! strictly closer to the key than the peer that reported it. Responses are
//! streamed back in completion order.

use crate::gate::SelfQueryGate;
use crate::peer_store::PeerStore;
use crate::queue::Queue;
use crate::routing::RoutingTable;
use crate::{DhtError, KadConfig, Result};
use futures::stream::{self, Stream, TryStreamExt};
use kadmesh_core::{Distance, Key, NodeId, NodeInfo};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What a query function receives for each peer
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Target of the lookup
    pub key: Key,
    /// Peer to ask
    pub node_info: NodeInfo,
    /// Tripped when the lookup is cancelled, times out or is dropped
    pub signal: CancellationToken,
}

/// A query result that may point at peers closer to the key
pub trait CloserPeers {
    fn closer_peers(&self) -> &[NodeInfo];
}

impl CloserPeers for Vec<NodeInfo> {
    fn closer_peers(&self) -> &[NodeInfo] {
        self
    }
}

/// One peer's answer within a lookup
#[derive(Debug)]
pub struct PeerResponse<R> {
    /// Peer that was queried
    pub from_node_id: NodeId,
    /// Its answer, or why it could not give one
    pub result: Result<R>,
}

impl<R: CloserPeers> PeerResponse<R> {
    pub fn closer_peers(&self) -> &[NodeInfo] {
        match &self.result {
            Ok(result) => result.closer_peers(),
            Err(_) => &[],
        }
    }

    pub fn error(&self) -> Option<&DhtError> {
        self.result.as_ref().err()
    }
}

/// Per-lookup options
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Caller timeout, on top of the manager's default timeout
    pub query_timeout: Option<Duration>,
    /// The node's own lookup; skips waiting for the self-query gate
    pub is_self_query: bool,
    /// Caller cancellation
    pub signal: Option<CancellationToken>,
}

impl QueryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn self_query(mut self) -> Self {
        self.is_self_query = true;
        self
    }
}

/// Keeps track of all running lookups
pub struct QueryManager {
    local_id: NodeId,
    routing_table: Arc<RwLock<RoutingTable>>,
    peer_store: Arc<PeerStore>,
    /// K parameter, the number of seed candidates read from the table
    k: usize,
    disjoint_paths: usize,
    alpha: usize,
    default_timeout: Duration,
    running: AtomicBool,
    /// Parent of every lookup signal; replaced on restart once tripped
    shutdown: Mutex<CancellationToken>,
    query_id_counter: AtomicU64,
    active_queries: Arc<AtomicUsize>,
    self_query: SelfQueryGate,
}

impl QueryManager {
    pub fn new(
        routing_table: Arc<RwLock<RoutingTable>>,
        self_query: SelfQueryGate,
        config: &KadConfig,
    ) -> Self {
        let (local_id, peer_store) = {
            let table = routing_table.read().unwrap_or_else(PoisonError::into_inner);
            (table.local_id().clone(), table.peer_store().clone())
        };
        Self {
            local_id,
            routing_table,
            peer_store,
            k: config.k,
            disjoint_paths: config.disjoint_paths,
            alpha: config.alpha,
            default_timeout: config.query_timeout,
            running: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            query_id_counter: AtomicU64::new(0),
            active_queries: Arc::new(AtomicUsize::new(0)),
            self_query,
        }
    }

    pub fn is_started(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        let mut shutdown = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
        if shutdown.is_cancelled() {
            *shutdown = CancellationToken::new();
        }
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stop accepting lookups and cancel every outstanding one
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Lookups whose stream has not finished yet
    pub fn active_queries(&self) -> usize {
        self.active_queries.load(Ordering::SeqCst)
    }

    /// Lookups started since creation
    pub fn query_count(&self) -> u64 {
        self.query_id_counter.load(Ordering::SeqCst)
    }

    pub fn self_query_gate(&self) -> &SelfQueryGate {
        &self.self_query
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Derive the lookup signal from shutdown, timeouts and the caller's signal
    ///
    /// The helper task exits as soon as the lookup signal trips, whichever
    /// source tripped it.
    fn compose_signal(
        &self,
        shutdown: &CancellationToken,
        query_id: u64,
        options: &QueryOptions,
    ) -> CancellationToken {
        let signal = shutdown.child_token();
        let timeout = options
            .query_timeout
            .map_or(self.default_timeout, |t| t.min(self.default_timeout));
        let caller = options.signal.clone();
        let composed = signal.clone();

        tokio::spawn(async move {
            let caller_cancelled = async move {
                match caller {
                    Some(token) => token.cancelled().await,
                    None => futures::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = composed.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {
                    tracing::debug!("Query {} timed out after {:?}", query_id, timeout);
                }
                _ = caller_cancelled => {
                    tracing::debug!("Query {} aborted by caller", query_id);
                }
            }
            composed.cancel();
        });

        signal
    }

    /// Run `query_fn` against the peers closest to `key`
    ///
    /// Must be called within a Tokio runtime. Nothing is queried until the
    /// returned stream is first polled. Per-peer failures are reported in the
    /// corresponding [`PeerResponse`]; the stream itself only fails when the
    /// lookup is cancelled for a reason other than [`QueryManager::stop`].
    /// `query_fn` should watch [`QueryContext::signal`]: a call that ignores it
    /// keeps running after the lookup ends.
    pub fn run_on_closest_peers<F, Fut, R>(
        &self,
        key: Key,
        query_fn: F,
        options: QueryOptions,
    ) -> Result<QueryStream<R>>
    where
        F: Fn(QueryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: CloserPeers + Send + 'static,
    {
        if !self.is_started() {
            return Err(DhtError::NotStarted);
        }

        let query_id = self.query_id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let shutdown = self.shutdown_token();
        let signal = self.compose_signal(&shutdown, query_id, &options);
        self.active_queries.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Query {} started for key {}", query_id, key);

        let lookup = Arc::new(Lookup {
            query_id,
            key,
            local_id: self.local_id.clone(),
            signal: signal.clone(),
            peers_seen: Mutex::new(HashSet::new()),
            peer_store: self.peer_store.clone(),
            query_fn,
        });

        let gate = self.self_query.clone();
        let routing_table = self.routing_table.clone();
        let (k, disjoint_paths, alpha) = (self.k, self.disjoint_paths, self.alpha);
        let is_self_query = options.is_self_query;

        let setup = async move {
            if !is_self_query && !gate.is_resolved() {
                tracing::debug!("Query {} waiting for self-query", lookup.query_id);
                tokio::select! {
                    _ = gate.wait() => {}
                    _ = lookup.signal.cancelled() => {
                        tracing::debug!("Query {} aborted before self-query ran", lookup.query_id);
                        return Err(DhtError::Canceled);
                    }
                }
            }

            let seeds: Vec<NodeInfo> = routing_table
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .closest_peers(&lookup.key, k)
                .into_iter()
                .take(disjoint_paths)
                .collect();
            if seeds.is_empty() {
                tracing::warn!("Query {}: no peers to query", lookup.query_id);
            }

            // Only alpha peer queries may be in flight for this lookup
            let queue = Queue::new(
                format!("query-{}", lookup.query_id),
                alpha,
                lookup.signal.clone(),
            );
            for peer in seeds {
                lookup.queue_peer(&queue, peer);
            }
            Ok(queue.into_stream())
        };

        Ok(QueryStream {
            inner: Box::pin(stream::once(setup).try_flatten()),
            shutdown,
            guard: Some(LookupGuard {
                query_id,
                signal,
                active_queries: self.active_queries.clone(),
                started: Instant::now(),
            }),
        })
    }
}

/// State owned by one lookup
struct Lookup<F> {
    query_id: u64,
    key: Key,
    local_id: NodeId,
    signal: CancellationToken,
    /// Peers already queued by any path of this lookup
    peers_seen: Mutex<HashSet<NodeId>>,
    peer_store: Arc<PeerStore>,
    query_fn: F,
}

impl<F> Lookup<F> {
    fn has_seen(&self, node_id: &NodeId) -> bool {
        self.peers_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(node_id)
    }

    fn mark_seen(&self, node_id: &NodeId) -> bool {
        self.peers_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.clone())
    }
}

impl<F, Fut, R> Lookup<F>
where
    F: Fn(QueryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: CloserPeers + Send + 'static,
{
    /// Queue a peer unless it is us or some path already visited it
    fn queue_peer(self: &Arc<Self>, queue: &Queue<Distance, PeerResponse<R>>, peer: NodeInfo) {
        if peer.node_id == self.local_id || !self.mark_seen(&peer.node_id) {
            return;
        }

        let distance = peer.kad_id().distance(&self.key);
        let lookup = self.clone();
        let path = queue.clone();
        // Closer peers get a larger complement and run first
        queue.run(
            async move { lookup.query_peer(&path, peer, distance).await },
            distance.complement(),
        );
    }

    async fn query_peer(
        self: Arc<Self>,
        queue: &Queue<Distance, PeerResponse<R>>,
        peer: NodeInfo,
        distance: Distance,
    ) -> PeerResponse<R> {
        let from_node_id = peer.node_id.clone();
        tracing::debug!("Query {}: asking {}", self.query_id, from_node_id);

        let context = QueryContext {
            key: self.key,
            node_info: peer,
            signal: self.signal.clone(),
        };
        // The call observes the lookup signal itself and settles on its own
        let result = (self.query_fn)(context).await;

        match &result {
            Ok(_) if self.signal.is_cancelled() => {
                tracing::trace!("Query {}: {} answered after cancel", self.query_id, from_node_id);
            }
            Ok(response) => {
                for closer in response.closer_peers() {
                    if self.has_seen(&closer.node_id) {
                        tracing::trace!("Query {}: {} already seen", self.query_id, closer.node_id);
                        continue;
                    }
                    if closer.node_id == self.local_id {
                        continue;
                    }
                    // Only follow peers strictly closer than the one that reported them
                    if closer.kad_id().distance(&self.key) >= distance {
                        tracing::trace!(
                            "Query {}: {} reported by {} is not closer",
                            self.query_id,
                            closer.node_id,
                            from_node_id
                        );
                        continue;
                    }
                    self.peer_store.put(closer.clone());
                    self.queue_peer(queue, closer.clone());
                }
            }
            Err(e) => {
                tracing::debug!("Query {}: {} failed: {}", self.query_id, from_node_id, e);
            }
        }

        PeerResponse {
            from_node_id,
            result,
        }
    }
}

/// Ends the lookup: trips its signal and updates the counters
struct LookupGuard {
    query_id: u64,
    signal: CancellationToken,
    active_queries: Arc<AtomicUsize>,
    started: Instant,
}

impl Drop for LookupGuard {
    fn drop(&mut self) {
        self.signal.cancel();
        self.active_queries.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(
            "Query {} done in {:?}",
            self.query_id,
            self.started.elapsed()
        );
    }
}

/// Peer responses of one lookup, in completion order
///
/// Dropping the stream before it ends abandons the lookup.
pub struct QueryStream<R> {
    inner: Pin<Box<dyn Stream<Item = Result<PeerResponse<R>>> + Send>>,
    /// Shutdown token the lookup was derived from
    shutdown: CancellationToken,
    guard: Option<LookupGuard>,
}

impl<R> QueryStream<R> {
    fn finish(&mut self) {
        self.guard.take();
    }
}

impl<R> Stream for QueryStream<R> {
    type Item = Result<PeerResponse<R>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.guard.is_none() {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Err(DhtError::Canceled))) if this.shutdown.is_cancelled() => {
                // Expected while the manager shuts down
                this.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
