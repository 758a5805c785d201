//! Bully coordinator election.
//!
//! The peer with the highest identifier among the ACTIVE nodes wins. An
//! initiator challenges every higher ACTIVE peer; silence within the
//! watchdog window means the initiator takes over, an acknowledgement means
//! a higher peer is alive and will announce itself. All election state
//! lives behind a single mutex.

use crate::cluster::registry::PeerRegistry;
use crate::core::message::{Message, Payload};
use crate::core::node::{NodeId, NodeStatus};
use crate::network::Outbound;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct ElectionState {
    current_coordinator: Option<NodeId>,
    is_coordinator: bool,
    in_progress: bool,
    responses: HashSet<NodeId>,
}

#[derive(Clone)]
pub struct Coordinator {
    node_id: NodeId,
    state: Arc<Mutex<ElectionState>>,
    election_timeout: Duration,
    peers: Arc<PeerRegistry>,
    outbound: Arc<dyn Outbound>,
}

impl Coordinator {
    pub fn new(
        node_id: NodeId,
        peers: Arc<PeerRegistry>,
        outbound: Arc<dyn Outbound>,
        election_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            state: Arc::new(Mutex::new(ElectionState::default())),
            election_timeout,
            peers,
            outbound,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.state.lock().is_coordinator
    }

    pub fn current_coordinator(&self) -> Option<NodeId> {
        self.state.lock().current_coordinator
    }

    pub fn election_in_progress(&self) -> bool {
        self.state.lock().in_progress
    }

    /// Start an election. Idempotent: a call while one is already running
    /// returns immediately.
    pub async fn start_election(&self) {
        {
            let mut state = self.state.lock();
            if state.in_progress {
                tracing::debug!("election already in progress");
                return;
            }
            state.in_progress = true;
            state.responses.clear();
        }
        tracing::info!("node {} starting election", self.node_id);

        let higher: Vec<NodeId> = self
            .peers
            .active()
            .into_iter()
            .map(|n| n.node_id)
            .filter(|id| *id > self.node_id)
            .collect();

        if higher.is_empty() {
            self.become_coordinator().await;
            return;
        }

        let challenge = Message::multicast(Payload::Election, self.node_id, higher);
        self.outbound.dispatch(&challenge).await;

        let watchdog = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(watchdog.election_timeout).await;
            watchdog.conclude_election().await;
        });
    }

    /// Watchdog expiry. No acknowledgements means every higher peer is
    /// unreachable and this node takes over; otherwise a higher peer is
    /// alive and will announce itself. An election already concluded by a
    /// COORDINATOR announcement makes the expiry a no-op.
    async fn conclude_election(&self) {
        let take_over = {
            let mut state = self.state.lock();
            if !state.in_progress {
                return;
            }
            if state.responses.is_empty() {
                true
            } else {
                tracing::info!(
                    "received {} election acks, awaiting coordinator announcement",
                    state.responses.len()
                );
                state.in_progress = false;
                false
            }
        };
        if take_over {
            self.become_coordinator().await;
        }
    }

    async fn become_coordinator(&self) {
        {
            let mut state = self.state.lock();
            state.is_coordinator = true;
            state.current_coordinator = Some(self.node_id);
            state.in_progress = false;
        }
        tracing::info!("node {} is the new coordinator", self.node_id);
        let announcement = Message::broadcast(Payload::Coordinator, self.node_id);
        self.outbound.dispatch(&announcement).await;
    }

    /// ELECTION received. A challenge from a lower identifier gets an
    /// acknowledgement and triggers our own election; a challenge from a
    /// higher identifier is their business to win.
    pub async fn handle_election(&self, sender_id: NodeId) {
        if sender_id < self.node_id {
            tracing::info!("election challenge from lower node {}", sender_id);
            let ack = Message::unicast(Payload::ElectionAck, self.node_id, sender_id);
            self.outbound.dispatch(&ack).await;
            self.start_election().await;
        } else {
            tracing::debug!("ignoring election challenge from higher node {}", sender_id);
        }
    }

    /// Election acknowledgement received.
    pub fn handle_election_ack(&self, sender_id: NodeId) {
        let mut state = self.state.lock();
        state.responses.insert(sender_id);
        tracing::info!("election ack from node {}", sender_id);
    }

    /// COORDINATOR announcement received. Accepted from any peer with a
    /// higher identifier, or from anyone when no election is running here;
    /// a lower claimant mid-election is ignored because this node will win.
    pub fn handle_coordinator_announcement(&self, sender_id: NodeId) {
        let mut state = self.state.lock();
        if sender_id >= self.node_id || !state.in_progress {
            state.current_coordinator = Some(sender_id);
            state.is_coordinator = false;
            state.in_progress = false;
            tracing::info!("node {} is now the coordinator", sender_id);
        } else {
            tracing::warn!(
                "ignoring coordinator claim from lower node {} during election",
                sender_id
            );
        }
    }

    /// Whether the currently known coordinator is ACTIVE in the registry.
    pub fn check_coordinator_alive(&self) -> bool {
        let (coordinator, is_self) = {
            let state = self.state.lock();
            match state.current_coordinator {
                None => return false,
                Some(id) => (id, state.is_coordinator && id == self.node_id),
            }
        };
        if is_self {
            return true;
        }
        matches!(self.peers.status(coordinator), Some(NodeStatus::Active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::core::message::CommunicationType;
    use async_trait::async_trait;

    struct RecordingOutbound {
        sent: Mutex<Vec<Message>>,
    }

    impl RecordingOutbound {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Message> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Outbound for RecordingOutbound {
        async fn dispatch(&self, msg: &Message) -> usize {
            self.sent.lock().push(msg.clone());
            msg.targets.as_ref().map_or(1, Vec::len)
        }
    }

    fn registry() -> Arc<PeerRegistry> {
        let config = ClusterConfig::from_json(
            r#"{
            "nodes": [
                {"node_id": 1, "network": {"host": "127.0.0.1", "port": 5001},
                 "database": {"host": "h", "user": "u", "password": "p", "database": "d"}},
                {"node_id": 2, "network": {"host": "127.0.0.1", "port": 5002},
                 "database": {"host": "h", "user": "u", "password": "p", "database": "d"}},
                {"node_id": 3, "network": {"host": "127.0.0.1", "port": 5003},
                 "database": {"host": "h", "user": "u", "password": "p", "database": "d"}}
            ]
        }"#,
        )
        .unwrap();
        Arc::new(PeerRegistry::new(&config.nodes))
    }

    fn coordinator(
        node_id: NodeId,
        peers: Arc<PeerRegistry>,
        outbound: Arc<RecordingOutbound>,
    ) -> Coordinator {
        Coordinator::new(node_id, peers, outbound, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_highest_node_takes_over_directly() {
        let outbound = RecordingOutbound::new();
        let election = coordinator(3, registry(), outbound.clone());

        election.start_election().await;

        assert!(election.is_coordinator());
        assert_eq!(election.current_coordinator(), Some(3));
        assert!(!election.election_in_progress());

        let sent = outbound.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, Payload::Coordinator);
        assert_eq!(sent[0].communication, CommunicationType::Broadcast);
    }

    #[tokio::test]
    async fn test_challenges_higher_active_peers() {
        let peers = registry();
        let outbound = RecordingOutbound::new();
        let election = coordinator(1, peers.clone(), outbound.clone());
        peers.set_status(2, NodeStatus::Inactive);

        election.start_election().await;

        assert!(election.election_in_progress());
        let sent = outbound.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, Payload::Election);
        // Only the higher ACTIVE peer is challenged.
        assert_eq!(sent[0].targets, Some(vec![3]));
    }

    #[tokio::test]
    async fn test_watchdog_coronates_without_acks() {
        let outbound = RecordingOutbound::new();
        let election = coordinator(1, registry(), outbound.clone());

        election.start_election().await;
        assert!(!election.is_coordinator());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(election.is_coordinator());
        assert_eq!(election.current_coordinator(), Some(1));
        let kinds: Vec<&str> = outbound.sent().iter().map(|m| m.payload.wire_type()).collect();
        assert_eq!(kinds, vec!["ELECTION", "COORDINATOR"]);
    }

    #[tokio::test]
    async fn test_ack_defers_to_higher_peer() {
        let outbound = RecordingOutbound::new();
        let election = coordinator(1, registry(), outbound.clone());

        election.start_election().await;
        election.handle_election_ack(3);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!election.is_coordinator());
        assert!(!election.election_in_progress());
        assert_eq!(election.current_coordinator(), None);
    }

    #[tokio::test]
    async fn test_watchdog_noop_after_announcement() {
        let outbound = RecordingOutbound::new();
        let election = coordinator(1, registry(), outbound.clone());

        election.start_election().await;
        // A higher peer announces before the watchdog fires.
        election.handle_coordinator_announcement(3);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!election.is_coordinator());
        assert_eq!(election.current_coordinator(), Some(3));
    }

    #[tokio::test]
    async fn test_election_is_idempotent_while_running() {
        let outbound = RecordingOutbound::new();
        let election = coordinator(1, registry(), outbound.clone());

        election.start_election().await;
        election.start_election().await;

        // Only one challenge went out.
        assert_eq!(outbound.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_challenge_from_lower_node_is_acked() {
        let outbound = RecordingOutbound::new();
        let election = coordinator(3, registry(), outbound.clone());

        election.handle_election(1).await;

        let sent = outbound.sent();
        // Ack to the challenger, then our own election which we win outright.
        assert_eq!(sent[0].payload, Payload::ElectionAck);
        assert_eq!(sent[0].targets, Some(vec![1]));
        assert_eq!(sent[1].payload, Payload::Coordinator);
        assert!(election.is_coordinator());
    }

    #[tokio::test]
    async fn test_challenge_from_higher_node_is_ignored() {
        let outbound = RecordingOutbound::new();
        let election = coordinator(1, registry(), outbound.clone());

        election.handle_election(3).await;

        assert!(outbound.sent().is_empty());
        assert!(!election.election_in_progress());
    }

    #[tokio::test]
    async fn test_coordinator_announcement_rules() {
        let outbound = RecordingOutbound::new();
        let election = coordinator(2, registry(), outbound.clone());

        // A lower claimant is accepted when no election is running here.
        election.handle_coordinator_announcement(1);
        assert_eq!(election.current_coordinator(), Some(1));

        // Mid-election, a lower claimant is ignored; a higher one wins.
        election.start_election().await;
        election.handle_coordinator_announcement(1);
        assert_eq!(election.current_coordinator(), Some(1));
        assert!(election.election_in_progress());
        election.handle_coordinator_announcement(3);
        assert_eq!(election.current_coordinator(), Some(3));
        assert!(!election.election_in_progress());
    }

    #[tokio::test]
    async fn test_coordinator_liveness() {
        let peers = registry();
        let outbound = RecordingOutbound::new();
        let election = coordinator(2, peers.clone(), outbound.clone());

        assert!(!election.check_coordinator_alive());

        election.handle_coordinator_announcement(3);
        assert!(election.check_coordinator_alive());

        peers.set_status(3, NodeStatus::Inactive);
        assert!(!election.check_coordinator_alive());
    }
}
