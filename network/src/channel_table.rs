//! The channel table: endpoint → channel, with a node-id index.
//!
//! Replacement rules:
//! - a keepalive observed from the same node id on a different port
//!   displaces the stale endpoint mapping;
//! - when two endpoints claim one node id, the channel whose handshake
//!   verified most recently wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use strand_types::{Account, Endpoint};

use crate::channel::Channel;

#[derive(Default)]
struct TableState {
    by_endpoint: HashMap<Endpoint, Arc<Channel>>,
    by_node_id: HashMap<Account, Endpoint>,
}

#[derive(Default)]
pub struct ChannelTable {
    state: Mutex<TableState>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel under its endpoint. If the channel is live and
    /// its node id is already mapped to another endpoint, the most
    /// recently verified channel keeps the node id; the loser is evicted.
    pub fn insert(&self, channel: Arc<Channel>) {
        let mut state = self.lock();
        let endpoint = channel.endpoint();
        if let Some(node_id) = channel.node_id() {
            if let Some(existing_endpoint) = state.by_node_id.get(&node_id).copied() {
                if existing_endpoint != endpoint {
                    let keep_new = match (
                        state
                            .by_endpoint
                            .get(&existing_endpoint)
                            .and_then(|c| c.verified_at()),
                        channel.verified_at(),
                    ) {
                        (Some(old), Some(new)) => new >= old,
                        (None, _) => true,
                        (_, None) => false,
                    };
                    if keep_new {
                        if let Some(evicted) = state.by_endpoint.remove(&existing_endpoint) {
                            evicted.close();
                            tracing::debug!(
                                old = %existing_endpoint,
                                new = %endpoint,
                                "node id moved endpoints"
                            );
                        }
                    } else {
                        return;
                    }
                }
            }
            state.by_node_id.insert(node_id, endpoint);
        }
        state.by_endpoint.insert(endpoint, channel);
    }

    /// A keepalive advertised `node_id` at a new port on the same address:
    /// move the mapping, dropping the stale channel.
    pub fn replace_port(&self, node_id: &Account, new_endpoint: Endpoint) -> bool {
        let mut state = self.lock();
        let Some(old_endpoint) = state.by_node_id.get(node_id).copied() else {
            return false;
        };
        if old_endpoint == new_endpoint || old_endpoint.addr() != new_endpoint.addr() {
            return false;
        }
        let Some(channel) = state.by_endpoint.remove(&old_endpoint) else {
            return false;
        };
        state.by_node_id.insert(*node_id, new_endpoint);
        state.by_endpoint.insert(new_endpoint, channel);
        tracing::debug!(%old_endpoint, %new_endpoint, "replaced peer port");
        true
    }

    pub fn find(&self, endpoint: &Endpoint) -> Option<Arc<Channel>> {
        self.lock().by_endpoint.get(endpoint).cloned()
    }

    pub fn find_node_id(&self, node_id: &Account) -> Option<Arc<Channel>> {
        let state = self.lock();
        let endpoint = state.by_node_id.get(node_id)?;
        state.by_endpoint.get(endpoint).cloned()
    }

    /// A weak handle for observers; upgrading yields `None` once evicted.
    pub fn observe(&self, endpoint: &Endpoint) -> Option<Weak<Channel>> {
        self.lock().by_endpoint.get(endpoint).map(Arc::downgrade)
    }

    pub fn remove(&self, endpoint: &Endpoint) -> Option<Arc<Channel>> {
        let mut state = self.lock();
        let channel = state.by_endpoint.remove(endpoint)?;
        if let Some(node_id) = channel.node_id() {
            if state.by_node_id.get(&node_id) == Some(endpoint) {
                state.by_node_id.remove(&node_id);
            }
        }
        channel.close();
        Some(channel)
    }

    pub fn len(&self) -> usize {
        self.lock().by_endpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_endpoint.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Channel>> {
        self.lock().by_endpoint.values().cloned().collect()
    }

    /// Close and drop channels idle past `timeout`. Returns how many went.
    pub fn purge_idle(&self, timeout: Duration) -> usize {
        let idle: Vec<Endpoint> = {
            let state = self.lock();
            state
                .by_endpoint
                .iter()
                .filter(|(_, channel)| channel.idle_for() > timeout)
                .map(|(endpoint, _)| *endpoint)
                .collect()
        };
        for endpoint in &idle {
            self.remove(endpoint);
            tracing::debug!(%endpoint, "closed idle channel");
        }
        idle.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
