//! Engine-node routing for new function calls.
//!
//! Tracks which engine nodes are online, picks one per new call according
//! to the configured dispatch policy, and bounds total in-flight calls.
//! Scale-in removes a node from routing while its in-flight calls drain.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use rand::Rng;
use tracing::info;

use crate::config::{DispatchPolicy, ServerConfig};

/// Scale event kinds from the membership oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOp {
    ScaleOut,
    ScaleIn,
}

#[derive(Debug, Default)]
struct NodeEntry {
    inflight_requests: usize,
    dispatched_requests: u64,
}

#[derive(Debug, Default)]
struct Inner {
    /// Routing-eligible nodes, in join order.
    connected_node_list: Vec<u16>,
    connected_nodes: HashMap<u16, NodeEntry>,
    running_requests: HashSet<u64>,
    next_dispatch_idx: HashMap<u32, usize>,
    max_running_requests: usize,
}

/// Engine-node routing table for the gateway.
pub struct NodeManager {
    per_node_cap: usize,
    policy: DispatchPolicy,
    inner: Mutex<Inner>,
}

impl NodeManager {
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            per_node_cap: config.max_running_requests,
            policy: config.dispatch_policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Picks an engine for a new function call, or `None` when no node is
    /// routable or the in-flight cap is reached.
    pub fn pick_node_for_new_func_call(&self, func_id: u32, call_id: u64) -> Option<u16> {
        let mut inner = self.inner.lock();
        if inner.connected_node_list.is_empty() {
            return None;
        }
        if inner.max_running_requests > 0
            && inner.running_requests.len() > inner.max_running_requests
        {
            return None;
        }
        let count = inner.connected_node_list.len();
        let idx = match self.policy {
            DispatchPolicy::PerFunctionRoundRobin => {
                let counter = inner.next_dispatch_idx.entry(func_id).or_insert(0);
                let idx = *counter % count;
                *counter += 1;
                idx
            }
            DispatchPolicy::LeastLoad => inner
                .connected_node_list
                .iter()
                .enumerate()
                .min_by_key(|(_, node_id)| {
                    inner.connected_nodes[*node_id].inflight_requests
                })
                .map(|(idx, _)| idx)
                .unwrap_or(0),
            DispatchPolicy::Random => rand::thread_rng().gen_range(0..count),
        };
        let node_id = inner.connected_node_list[idx];
        let entry = inner.connected_nodes.get_mut(&node_id).unwrap();
        entry.inflight_requests += 1;
        entry.dispatched_requests += 1;
        inner.running_requests.insert(call_id);
        Some(node_id)
    }

    /// Releases bookkeeping for a finished call.
    pub fn func_call_finished(&self, call_id: u64, node_id: u16) {
        let mut inner = self.inner.lock();
        if !inner.running_requests.remove(&call_id) {
            info!(call_id, "no running request for this function call");
            return;
        }
        let Some(entry) = inner.connected_nodes.get_mut(&node_id) else {
            info!(node_id, "node no longer exists");
            return;
        };
        entry.inflight_requests = entry.inflight_requests.saturating_sub(1);
    }

    /// Admits a new engine node to routing.
    pub fn on_node_online(&self, node_id: u16) {
        let mut inner = self.inner.lock();
        if inner.connected_nodes.contains_key(&node_id) {
            info!(node_id, "engine node already online");
            return;
        }
        inner.connected_node_list.push(node_id);
        inner.connected_nodes.insert(node_id, NodeEntry::default());
        inner.max_running_requests = self.per_node_cap * inner.connected_nodes.len();
        info!(count = inner.connected_nodes.len(), "nodes connected");
    }

    /// Removes a node from routing. A no-op for already-removed nodes.
    pub fn on_node_offline(&self, node_id: u16) {
        let mut inner = self.inner.lock();
        if inner.connected_nodes.remove(&node_id).is_none() {
            info!(node_id, "engine node already removed");
        }
        inner.connected_node_list.retain(|&id| id != node_id);
        inner.max_running_requests = self.per_node_cap * inner.connected_nodes.len();
        info!(count = inner.connected_nodes.len(), "nodes connected");
    }

    /// Scale events: scale-in stops routing new calls to the node but
    /// leaves its in-flight bookkeeping to drain via
    /// [`Self::func_call_finished`].
    pub fn on_node_scaled(&self, scale_op: ScaleOp, node_id: u16) {
        match scale_op {
            ScaleOp::ScaleOut => {}
            ScaleOp::ScaleIn => {
                let mut inner = self.inner.lock();
                inner.connected_node_list.retain(|&id| id != node_id);
                info!(node_id, "node will not get new function requests");
            }
        }
    }

    #[must_use]
    pub fn connected_node_count(&self) -> usize {
        self.inner.lock().connected_nodes.len()
    }

    #[must_use]
    pub fn inflight_requests(&self, node_id: u16) -> Option<usize> {
        self.inner
            .lock()
            .connected_nodes
            .get(&node_id)
            .map(|entry| entry.inflight_requests)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(policy: DispatchPolicy, per_node_cap: usize) -> NodeManager {
        NodeManager::new(&ServerConfig {
            dispatch_policy: policy,
            max_running_requests: per_node_cap,
            ..ServerConfig::default()
        })
    }

    #[test]
    fn no_nodes_no_pick() {
        let nm = manager(DispatchPolicy::Random, 0);
        assert!(nm.pick_node_for_new_func_call(1, 1).is_none());
    }

    #[test]
    fn round_robin_cycles_per_function() {
        let nm = manager(DispatchPolicy::PerFunctionRoundRobin, 0);
        nm.on_node_online(1);
        nm.on_node_online(2);
        let picks: Vec<u16> = (0..4)
            .map(|i| nm.pick_node_for_new_func_call(7, i).unwrap())
            .collect();
        assert_eq!(picks, vec![1, 2, 1, 2]);
        // A different function id has its own counter.
        assert_eq!(nm.pick_node_for_new_func_call(8, 9).unwrap(), 1);
    }

    #[test]
    fn least_load_prefers_idle_node() {
        let nm = manager(DispatchPolicy::LeastLoad, 0);
        nm.on_node_online(1);
        nm.on_node_online(2);
        // Two calls land on node 1 and node 2 (least load breaks ties by
        // list order), the third must go to whichever drained.
        let a = nm.pick_node_for_new_func_call(7, 1).unwrap();
        let b = nm.pick_node_for_new_func_call(7, 2).unwrap();
        assert_ne!(a, b);
        nm.func_call_finished(1, a);
        assert_eq!(nm.pick_node_for_new_func_call(7, 3).unwrap(), a);
    }

    #[test]
    fn max_running_requests_caps_admission() {
        let nm = manager(DispatchPolicy::PerFunctionRoundRobin, 1);
        nm.on_node_online(1);
        // Cap is per_node * nodes = 1; the gate rejects once strictly
        // above the cap.
        assert!(nm.pick_node_for_new_func_call(7, 1).is_some());
        assert!(nm.pick_node_for_new_func_call(7, 2).is_some());
        assert!(nm.pick_node_for_new_func_call(7, 3).is_none());
        nm.func_call_finished(1, 1);
        assert!(nm.pick_node_for_new_func_call(7, 4).is_some());
    }

    #[test]
    fn offline_is_idempotent() {
        let nm = manager(DispatchPolicy::Random, 0);
        nm.on_node_online(1);
        nm.on_node_offline(1);
        assert_eq!(nm.connected_node_count(), 0);
        // Removing again is a no-op.
        nm.on_node_offline(1);
        assert_eq!(nm.connected_node_count(), 0);
    }

    #[test]
    fn scale_in_removes_from_routing_but_keeps_draining() {
        let nm = manager(DispatchPolicy::PerFunctionRoundRobin, 0);
        nm.on_node_online(1);
        nm.on_node_online(2);
        let picked = nm.pick_node_for_new_func_call(7, 1).unwrap();
        assert_eq!(picked, 1);

        nm.on_node_scaled(ScaleOp::ScaleIn, 1);
        // New calls avoid node 1.
        for i in 2..6 {
            assert_eq!(nm.pick_node_for_new_func_call(7, i).unwrap(), 2);
        }
        // The in-flight call still drains cleanly.
        nm.func_call_finished(1, 1);
        assert_eq!(nm.inflight_requests(1), Some(0));
    }

    #[test]
    fn finished_unknown_call_is_noop() {
        let nm = manager(DispatchPolicy::Random, 0);
        nm.on_node_online(1);
        nm.func_call_finished(99, 1);
        assert_eq!(nm.inflight_requests(1), Some(0));
    }
}
