//! Two-phase commit across the ACTIVE peers.
//!
//! Not the default write path (that is the asynchronous replicator); used
//! for writes that need cross-node atomicity. The coordinator collects
//! votes inside a bounded decision window and commits only on a unanimous
//! yes from every participant. There is no recovery log: a participant
//! that dies after voting yes leaves its local transaction in limbo.

use crate::cluster::registry::PeerRegistry;
use crate::core::message::{Message, Payload};
use crate::core::node::NodeId;
use crate::core::result::QueryResult;
use crate::error::Result;
use crate::network::Outbound;
use crate::storage::StorageAdapter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Lifecycle of a distributed transaction. PREPARING may move to either
/// terminal state; terminal is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Preparing,
    Committed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub transaction_id: String,
    pub sql: String,
    pub initiator: NodeId,
    pub participants: Vec<NodeId>,
    pub status: TransactionStatus,
    pub votes: HashMap<NodeId, bool>,
}

impl Transaction {
    fn all_votes_in(&self) -> bool {
        self.participants
            .iter()
            .all(|participant| self.votes.contains_key(participant))
    }

    fn unanimous(&self) -> bool {
        self.all_votes_in() && self.votes.values().all(|vote| *vote)
    }

    /// True while no participant has voted no yet.
    fn unanimous_so_far(&self) -> bool {
        self.votes.values().all(|vote| *vote)
    }
}

pub struct TransactionManager {
    node_id: NodeId,
    storage: Arc<dyn StorageAdapter>,
    outbound: Arc<dyn Outbound>,
    peers: Arc<PeerRegistry>,
    decision_window: Duration,
    transactions: Mutex<HashMap<String, Transaction>>,
}

impl TransactionManager {
    pub fn new(
        node_id: NodeId,
        storage: Arc<dyn StorageAdapter>,
        outbound: Arc<dyn Outbound>,
        peers: Arc<PeerRegistry>,
        decision_window: Duration,
    ) -> Self {
        Self {
            node_id,
            storage,
            outbound,
            peers,
            decision_window,
            transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.transactions.lock().len()
    }

    pub fn active_transaction_ids(&self) -> Vec<String> {
        self.transactions.lock().keys().cloned().collect()
    }

    pub fn status(&self, transaction_id: &str) -> Option<TransactionStatus> {
        self.transactions
            .lock()
            .get(transaction_id)
            .map(|txn| txn.status)
    }

    /// Coordinator path: run `sql` under 2PC across every ACTIVE peer.
    /// Commit only if every participant votes yes within the decision
    /// window; any no vote or missing vote aborts.
    pub async fn execute_two_phase(&self, sql: &str) -> Result<QueryResult> {
        let transaction_id = Uuid::new_v4().to_string();
        let participants: Vec<NodeId> =
            self.peers.active().into_iter().map(|n| n.node_id).collect();

        {
            let mut transactions = self.transactions.lock();
            transactions.insert(
                transaction_id.clone(),
                Transaction {
                    transaction_id: transaction_id.clone(),
                    sql: sql.to_string(),
                    initiator: self.node_id,
                    participants: participants.clone(),
                    status: TransactionStatus::Preparing,
                    votes: HashMap::new(),
                },
            );
        }
        tracing::info!(
            "transaction {} entering prepare phase with {} participants",
            transaction_id,
            participants.len()
        );

        // Local prepare: stage the statement without committing.
        let local_vote = match self.storage.begin().await {
            Ok(()) => {
                let execution = self.storage.execute(sql).await;
                if !execution.ok {
                    tracing::warn!(
                        "local prepare failed: {}",
                        execution.error.as_deref().unwrap_or("unknown error")
                    );
                }
                execution.ok
            }
            Err(e) => {
                tracing::error!("could not open local transaction: {}", e);
                false
            }
        };
        self.record_vote(&transaction_id, self.node_id, local_vote);

        // Phase 1: ask every peer to prepare.
        let prepare = Message::broadcast(
            Payload::Prepare {
                sql: sql.to_string(),
            },
            self.node_id,
        )
        .with_transaction(&transaction_id);
        self.outbound.dispatch(&prepare).await;

        // Collect votes until unanimity is decidable or the window closes.
        let deadline = Instant::now() + self.decision_window;
        loop {
            let done = {
                let transactions = self.transactions.lock();
                transactions
                    .get(&transaction_id)
                    .map_or(true, |txn| txn.all_votes_in() || !txn.unanimous_so_far())
            };
            if done || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let commit = {
            let transactions = self.transactions.lock();
            transactions
                .get(&transaction_id)
                .map_or(false, Transaction::unanimous)
        };
        if !commit {
            tracing::warn!("transaction {} aborting", transaction_id);
        }

        // Phase 2: announce the decision, then apply it locally.
        let decision = if commit { Payload::Commit } else { Payload::Abort };
        let announcement =
            Message::broadcast(decision, self.node_id).with_transaction(&transaction_id);
        self.outbound.dispatch(&announcement).await;

        if commit {
            self.storage.commit().await?;
        } else if let Err(e) = self.storage.rollback().await {
            tracing::error!("local rollback failed: {}", e);
        }

        let status = if commit {
            TransactionStatus::Committed
        } else {
            TransactionStatus::Aborted
        };
        {
            let mut transactions = self.transactions.lock();
            if let Some(txn) = transactions.get_mut(&transaction_id) {
                txn.status = status;
            }
        }
        tracing::info!(
            "transaction {} {}",
            transaction_id,
            if commit { "committed" } else { "aborted" }
        );
        self.finalize(&transaction_id);

        if commit {
            Ok(QueryResult {
                success: true,
                data: None,
                error: None,
                node_id: Some(self.node_id),
                execution_time: None,
                rows_affected: Some(1),
            })
        } else {
            Ok(QueryResult::failure("transaction aborted", self.node_id))
        }
    }

    /// Record a participant's vote. Votes for unknown transactions are
    /// logged and discarded.
    pub fn record_vote(&self, transaction_id: &str, node_id: NodeId, vote: bool) {
        let mut transactions = self.transactions.lock();
        match transactions.get_mut(transaction_id) {
            Some(txn) => {
                txn.votes.insert(node_id, vote);
                tracing::info!(
                    "vote from node {} for transaction {}: {}",
                    node_id,
                    transaction_id,
                    if vote { "COMMIT" } else { "ABORT" }
                );
            }
            None => {
                tracing::warn!("vote for unknown transaction {}", transaction_id);
            }
        }
    }

    /// Participant path for PREPARE: stage the statement without
    /// committing and send the vote back to the coordinator. The local
    /// transaction stays open until phase 2 arrives.
    pub async fn handle_prepare(&self, sql: &str, coordinator: NodeId, transaction_id: &str) {
        let (vote, error) = match self.storage.begin().await {
            Ok(()) => {
                let execution = self.storage.execute(sql).await;
                (execution.ok, execution.error)
            }
            Err(e) => (false, Some(e.to_string())),
        };
        tracing::info!(
            "voting {} on transaction {}",
            if vote { "COMMIT" } else { "ABORT" },
            transaction_id
        );

        let reply = Message::unicast(
            Payload::PrepareVote { vote, error },
            self.node_id,
            coordinator,
        )
        .with_transaction(transaction_id);
        self.outbound.dispatch(&reply).await;
    }

    /// Participant path for COMMIT: close the transaction opened by
    /// PREPARE.
    pub async fn handle_commit(&self, transaction_id: &str) {
        match self.storage.commit().await {
            Ok(()) => tracing::info!("transaction {} committed", transaction_id),
            Err(e) => tracing::error!("commit of {} failed: {}", transaction_id, e),
        }
    }

    /// Participant path for ABORT.
    pub async fn handle_abort(&self, transaction_id: &str) {
        match self.storage.rollback().await {
            Ok(()) => tracing::info!("transaction {} aborted", transaction_id),
            Err(e) => tracing::error!("rollback of {} failed: {}", transaction_id, e),
        }
    }

    fn finalize(&self, transaction_id: &str) {
        if let Some(txn) = self.transactions.lock().remove(transaction_id) {
            tracing::info!(
                "transaction {} finalized with status {:?}",
                transaction_id,
                txn.status
            );
        }
    }

    /// Drop any transaction that already reached a terminal status.
    /// Returns how many were removed.
    pub fn cleanup_finalized(&self) -> usize {
        let mut transactions = self.transactions.lock();
        let before = transactions.len();
        transactions.retain(|_, txn| txn.status == TransactionStatus::Preparing);
        before - transactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::core::node::NodeStatus;
    use crate::storage::MemoryAdapter;
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

        fn kinds(&self) -> Vec<&'static str> {
            self.sent
                .lock()
                .iter()
                .map(|m| m.payload.wire_type())
                .collect()
        }
    }

    #[async_trait]
    impl Outbound for RecordingOutbound {
        async fn dispatch(&self, msg: &Message) -> usize {
            self.sent.lock().push(msg.clone());
            1
        }
    }

    fn registry(json: &str) -> Arc<PeerRegistry> {
        let config = ClusterConfig::from_json(json).unwrap();
        Arc::new(PeerRegistry::new(&config.nodes))
    }

    fn single_node_registry() -> Arc<PeerRegistry> {
        registry(
            r#"{"nodes": [
                {"node_id": 1, "network": {"host": "127.0.0.1", "port": 5001},
                 "database": {"host": "h", "user": "u", "password": "p", "database": "d"}}
            ]}"#,
        )
    }

    fn two_node_registry() -> Arc<PeerRegistry> {
        registry(
            r#"{"nodes": [
                {"node_id": 1, "network": {"host": "127.0.0.1", "port": 5001},
                 "database": {"host": "h", "user": "u", "password": "p", "database": "d"}},
                {"node_id": 2, "network": {"host": "127.0.0.1", "port": 5002},
                 "database": {"host": "h", "user": "u", "password": "p", "database": "d"}}
            ]}"#,
        )
    }

    async fn manager(
        peers: Arc<PeerRegistry>,
        storage: Arc<MemoryAdapter>,
        outbound: Arc<RecordingOutbound>,
        window: Duration,
    ) -> TransactionManager {
        storage.connect().await.unwrap();
        TransactionManager::new(1, storage, outbound, peers, window)
    }

    #[tokio::test]
    async fn test_unanimous_yes_commits() {
        let storage = Arc::new(MemoryAdapter::new());
        let outbound = RecordingOutbound::new();
        let txn_manager = manager(
            single_node_registry(),
            storage.clone(),
            outbound.clone(),
            Duration::from_millis(200),
        )
        .await;

        let result = txn_manager
            .execute_two_phase("INSERT INTO t VALUES (1)")
            .await
            .unwrap();

        assert!(result.success);
        assert!(storage.contains("VALUES (1)"));
        assert_eq!(outbound.kinds(), vec!["PREPARE", "COMMIT"]);
        // Terminal transactions are finalized away.
        assert_eq!(txn_manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_local_no_vote_aborts() {
        let storage = Arc::new(MemoryAdapter::failing_on(["duplicate_pk"]));
        let outbound = RecordingOutbound::new();
        let txn_manager = manager(
            single_node_registry(),
            storage.clone(),
            outbound.clone(),
            Duration::from_millis(200),
        )
        .await;

        let result = txn_manager
            .execute_two_phase("INSERT INTO t VALUES ('duplicate_pk')")
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(storage.applied_count(), 0);
        assert_eq!(outbound.kinds(), vec!["PREPARE", "ABORT"]);
    }

    #[tokio::test]
    async fn test_remote_yes_vote_commits() {
        let storage = Arc::new(MemoryAdapter::new());
        let outbound = RecordingOutbound::new();
        let txn_manager = Arc::new(
            manager(
                two_node_registry(),
                storage.clone(),
                outbound.clone(),
                Duration::from_millis(500),
            )
            .await,
        );

        let worker = txn_manager.clone();
        let run =
            tokio::spawn(async move { worker.execute_two_phase("INSERT INTO t VALUES (1)").await });

        // Let the coordinator broadcast PREPARE, then vote as node 2.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ids = txn_manager.active_transaction_ids();
        assert_eq!(ids.len(), 1);
        txn_manager.record_vote(&ids[0], 2, true);

        let result = run.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(outbound.kinds(), vec!["PREPARE", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_remote_no_vote_aborts() {
        let storage = Arc::new(MemoryAdapter::new());
        let outbound = RecordingOutbound::new();
        let txn_manager = Arc::new(
            manager(
                two_node_registry(),
                storage.clone(),
                outbound.clone(),
                Duration::from_millis(500),
            )
            .await,
        );

        let worker = txn_manager.clone();
        let run =
            tokio::spawn(async move { worker.execute_two_phase("INSERT INTO t VALUES (1)").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let ids = txn_manager.active_transaction_ids();
        txn_manager.record_vote(&ids[0], 2, false);

        let result = run.await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(storage.applied_count(), 0);
        assert_eq!(outbound.kinds(), vec!["PREPARE", "ABORT"]);
    }

    #[tokio::test]
    async fn test_missing_vote_aborts_after_window() {
        let storage = Arc::new(MemoryAdapter::new());
        let outbound = RecordingOutbound::new();
        // Node 2 never votes.
        let txn_manager = manager(
            two_node_registry(),
            storage.clone(),
            outbound.clone(),
            Duration::from_millis(100),
        )
        .await;

        let result = txn_manager
            .execute_two_phase("INSERT INTO t VALUES (1)")
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(outbound.kinds(), vec!["PREPARE", "ABORT"]);
    }

    #[tokio::test]
    async fn test_inactive_peers_are_not_participants() {
        let peers = two_node_registry();
        peers.set_status(2, NodeStatus::Inactive);
        let storage = Arc::new(MemoryAdapter::new());
        let outbound = RecordingOutbound::new();
        let txn_manager = manager(
            peers,
            storage.clone(),
            outbound.clone(),
            Duration::from_millis(200),
        )
        .await;

        let result = txn_manager
            .execute_two_phase("INSERT INTO t VALUES (1)")
            .await
            .unwrap();

        // Only the local vote was needed.
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_participant_prepare_and_phase_two() {
        let storage = Arc::new(MemoryAdapter::new());
        let outbound = RecordingOutbound::new();
        let txn_manager = manager(
            two_node_registry(),
            storage.clone(),
            outbound.clone(),
            Duration::from_millis(200),
        )
        .await;

        txn_manager
            .handle_prepare("INSERT INTO t VALUES (1)", 2, "txn-7")
            .await;
        // Vote sent, statement staged but not yet visible.
        let sent = outbound.sent.lock().clone();
        assert_eq!(
            sent[0].payload,
            Payload::PrepareVote {
                vote: true,
                error: None
            }
        );
        assert_eq!(sent[0].targets, Some(vec![2]));
        assert_eq!(storage.applied_count(), 0);

        txn_manager.handle_commit("txn-7").await;
        assert_eq!(storage.applied_count(), 1);
    }

    #[tokio::test]
    async fn test_participant_abort_rolls_back() {
        let storage = Arc::new(MemoryAdapter::new());
        let outbound = RecordingOutbound::new();
        let txn_manager = manager(
            two_node_registry(),
            storage.clone(),
            outbound.clone(),
            Duration::from_millis(200),
        )
        .await;

        txn_manager
            .handle_prepare("INSERT INTO t VALUES (1)", 2, "txn-8")
            .await;
        txn_manager.handle_abort("txn-8").await;
        assert_eq!(storage.applied_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_vote_discarded() {
        let storage = Arc::new(MemoryAdapter::new());
        let outbound = RecordingOutbound::new();
        let txn_manager = manager(
            two_node_registry(),
            storage,
            outbound,
            Duration::from_millis(100),
        )
        .await;

        txn_manager.record_vote("no-such-txn", 2, true);
        assert_eq!(txn_manager.active_count(), 0);
    }
}
