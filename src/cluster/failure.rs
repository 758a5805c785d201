//! Failure detection: periodic heartbeat emission and liveness inference
//! from last-heard timestamps. Clocks are only ever compared locally.

use crate::cluster::election::Coordinator;
use crate::cluster::registry::PeerRegistry;
use crate::config::Timings;
use crate::core::message::{Message, Payload};
use crate::core::node::{NodeId, NodeStatus};
use crate::network::Outbound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct FailureDetector {
    node_id: NodeId,
    peers: Arc<PeerRegistry>,
    outbound: Arc<dyn Outbound>,
    election: Coordinator,
    timings: Timings,
    running: Arc<AtomicBool>,
}

impl FailureDetector {
    pub fn new(
        node_id: NodeId,
        peers: Arc<PeerRegistry>,
        outbound: Arc<dyn Outbound>,
        election: Coordinator,
        timings: Timings,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            node_id,
            peers,
            outbound,
            election,
            timings,
            running,
        }
    }

    /// Broadcast a heartbeat every `heartbeat_interval` until shutdown.
    pub async fn run_heartbeat_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let beat = Message::broadcast(
                Payload::Heartbeat {
                    is_coordinator: self.election.is_coordinator(),
                },
                self.node_id,
            );
            self.outbound.dispatch(&beat).await;
            tokio::time::sleep(self.timings.heartbeat_interval).await;
        }
    }

    /// Every two heartbeat intervals, mark silent ACTIVE peers INACTIVE.
    /// Losing the coordinator triggers an election.
    pub async fn run_health_check_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.timings.heartbeat_interval * 2).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.check_peers().await;
        }
    }

    async fn check_peers(&self) {
        let stale = self
            .peers
            .stale_active_peers(self.timings.heartbeat_timeout, self.node_id);
        for node_id in stale {
            tracing::warn!("node {} missed heartbeats, marking inactive", node_id);
            self.peers.set_status(node_id, NodeStatus::Inactive);

            if self.election.current_coordinator() == Some(node_id) {
                tracing::warn!("coordinator {} failed, starting election", node_id);
                self.election.start_election().await;
            }
        }
    }
}
