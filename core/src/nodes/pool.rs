//! In-memory registry of known peers, with a secondary index from tunnel
//! address to node id. The node map and the address index are guarded by
//! separate locks; no consumer needs a combined snapshot of both.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::error::RegistrationError;
use crate::metrics::Metrics;
use crate::nodes::{NodeContext, RemoteNode};
use crate::types::{Protocol, Registration};

pub struct RemoteNodePool {
    metrics: Arc<Metrics>,
    nodes: RwLock<HashMap<String, Arc<RemoteNode>>>,
    index: Mutex<HashMap<(Protocol, IpAddr), String>>,
}

impl RemoteNodePool {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            nodes: RwLock::new(HashMap::new()),
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a registration: update the existing node in place, or create a
    /// new one and index its addresses. An address collision with a live
    /// node evicts the stale holder — at most one node id per
    /// (protocol, address) at any time.
    pub fn register(
        &self,
        ctx: &Arc<NodeContext>,
        registration: Registration,
    ) -> Result<Arc<RemoteNode>, RegistrationError> {
        let id = registration.local.id.clone();
        let existing = self.nodes.read().get(&id).cloned();
        if let Some(node) = existing {
            node.update_registration(registration)?;
            return Ok(node);
        }

        let node = RemoteNode::new(ctx.clone(), registration);
        let displaced = {
            let mut index = self.index.lock();
            let info = node.node_info();
            let mut displaced = Vec::new();
            for (protocol, addr) in &info.node_addresses {
                if let Some(previous) = index.insert((*protocol, *addr), id.clone()) {
                    if previous != id {
                        warn!(
                            "tunnel address {}/{} reassigned from node {} to node {}",
                            protocol, addr, previous, id
                        );
                        displaced.push(previous);
                    }
                }
            }
            displaced
        };
        for stale in displaced {
            self.remove(&stale);
        }

        self.nodes.write().insert(id, node.clone());
        self.metrics.peers.set(self.len() as i64);
        Ok(node)
    }

    /// Remove and close a node, dropping only the index entries still
    /// pointing at it.
    pub fn remove(&self, id: &str) -> Option<Arc<RemoteNode>> {
        let node = self.nodes.write().remove(id);
        if let Some(node) = &node {
            node.close();
            self.index.lock().retain(|_, holder| holder != id);
            self.metrics.peers.set(self.len() as i64);
        }
        node
    }

    pub fn find(&self, id: &str) -> Option<Arc<RemoteNode>> {
        self.nodes.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.read().contains_key(id)
    }

    pub fn find_by_address(&self, protocol: Protocol, addr: IpAddr) -> Option<Arc<RemoteNode>> {
        let id = self.index.lock().get(&(protocol, addr)).cloned()?;
        self.find(&id)
    }

    /// The node id the address index maps to, without touching the node map.
    pub fn resolve_address(&self, protocol: Protocol, addr: IpAddr) -> Option<String> {
        self.index.lock().get(&(protocol, addr)).cloned()
    }

    pub fn all(&self) -> Vec<Arc<RemoteNode>> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}
