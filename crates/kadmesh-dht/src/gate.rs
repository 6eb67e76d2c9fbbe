//! One-shot latch for the initial self-query

use std::sync::Arc;
use tokio::sync::watch;

/// Opens once the node's first self-lookup has finished
///
/// Lookups for other keys wait on this so that the routing table is seeded
/// before the node serves them. Clones share the same latch.
#[derive(Debug, Clone)]
pub struct SelfQueryGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for SelfQueryGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SelfQueryGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// A gate that is already open
    pub fn resolved() -> Self {
        let gate = Self::new();
        gate.resolve();
        gate
    }

    /// Open the gate; idempotent
    pub fn resolve(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_resolved(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate opens
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once resolved
        let _ = rx.wait_for(|resolved| *resolved).await;
    }
}
