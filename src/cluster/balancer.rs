//! Peer selection for routed queries.

use crate::core::node::{NodeDescriptor, NodeId};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastLoaded,
    Random,
}

/// Aggregate load view over the ACTIVE peers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadStatistics {
    pub total_nodes: usize,
    pub total_queries: u64,
    pub avg_queries: f64,
    pub min_queries: u64,
    pub max_queries: u64,
}

/// Stateless except for the round-robin rotation index.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    rotation: AtomicUsize,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick one ACTIVE peer by the given strategy. `exclude` filters a node
    /// out of consideration (typically the caller itself). Returns None
    /// when no ACTIVE peer remains.
    pub fn select_node(
        &self,
        nodes: &[NodeDescriptor],
        strategy: Strategy,
        exclude: Option<NodeId>,
    ) -> Option<NodeDescriptor> {
        let candidates: Vec<&NodeDescriptor> = nodes
            .iter()
            .filter(|n| n.is_active() && Some(n.node_id) != exclude)
            .collect();
        if candidates.is_empty() {
            tracing::warn!("no active node available for selection");
            return None;
        }

        let selected: &NodeDescriptor = match strategy {
            Strategy::RoundRobin => {
                let index = self.rotation.fetch_add(1, Ordering::SeqCst);
                candidates[index % candidates.len()]
            }
            Strategy::LeastLoaded => *candidates
                .iter()
                .min_by_key(|n| (n.query_count, n.node_id))?,
            Strategy::Random => *candidates.choose(&mut rand::rng())?,
        };
        tracing::debug!("selected node {} via {:?}", selected.node_id, strategy);
        Some(selected.clone())
    }

    /// Query-count summary over the ACTIVE peers.
    pub fn statistics(&self, nodes: &[NodeDescriptor]) -> LoadStatistics {
        let active: Vec<&NodeDescriptor> = nodes.iter().filter(|n| n.is_active()).collect();
        if active.is_empty() {
            return LoadStatistics {
                total_nodes: 0,
                total_queries: 0,
                avg_queries: 0.0,
                min_queries: 0,
                max_queries: 0,
            };
        }
        let total_queries: u64 = active.iter().map(|n| n.query_count).sum();
        LoadStatistics {
            total_nodes: active.len(),
            total_queries,
            avg_queries: total_queries as f64 / active.len() as f64,
            min_queries: active.iter().map(|n| n.query_count).min().unwrap_or(0),
            max_queries: active.iter().map(|n| n.query_count).max().unwrap_or(0),
        }
    }
}
