//! The node orchestrator: wires storage, transport, failure detection,
//! election, replication and transactions together, and routes every
//! inbound message to the subsystem that owns it.

use crate::cluster::balancer::LoadBalancer;
use crate::cluster::election::Coordinator;
use crate::cluster::failure::FailureDetector;
use crate::cluster::registry::PeerRegistry;
use crate::config::{ClusterConfig, NodeConfig, Timings};
use crate::core::message::{Message, Payload};
use crate::core::node::NodeId;
use crate::core::result::QueryResult;
use crate::error::Result;
use crate::network::client::NetworkOutbound;
use crate::network::server::{MessageHandler, MessageServer, Reply};
use crate::network::Outbound;
use crate::replication::{self, Replicator};
use crate::storage::{MemoryAdapter, StorageAdapter};
use crate::transaction::TransactionManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub struct MeshNode {
    node_id: NodeId,
    config: NodeConfig,
    timings: Timings,
    storage: Arc<dyn StorageAdapter>,
    peers: Arc<PeerRegistry>,
    outbound: Arc<dyn Outbound>,
    balancer: LoadBalancer,
    election: Coordinator,
    replicator: Arc<Replicator>,
    transactions: Arc<TransactionManager>,
    server: Mutex<Option<MessageServer>>,
    running: Arc<AtomicBool>,
}

impl MeshNode {
    pub fn new(
        config: &ClusterConfig,
        node_id: NodeId,
        storage: Arc<dyn StorageAdapter>,
        timings: Timings,
    ) -> Result<Arc<Self>> {
        let node_config = config.node(node_id)?.clone();
        let peers = Arc::new(PeerRegistry::new(&config.nodes));
        let outbound: Arc<dyn Outbound> = Arc::new(NetworkOutbound::new(
            node_id,
            peers.clone(),
            timings.send_timeout,
        ));
        let election = Coordinator::new(
            node_id,
            peers.clone(),
            outbound.clone(),
            timings.election_timeout,
        );
        let replicator = Arc::new(Replicator::new(
            node_id,
            storage.clone(),
            outbound.clone(),
            peers.clone(),
        ));
        let transactions = Arc::new(TransactionManager::new(
            node_id,
            storage.clone(),
            outbound.clone(),
            peers.clone(),
            timings.decision_window,
        ));

        tracing::info!(
            "node {} initialized with {} configured peers",
            node_id,
            peers.len()
        );
        Ok(Arc::new(Self {
            node_id,
            config: node_config,
            timings,
            storage,
            peers,
            outbound,
            balancer: LoadBalancer::new(),
            election,
            replicator,
            transactions,
            server: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }))
    }

    /// Bring the node up: storage, transport, the periodic tasks, and the
    /// startup election after the bootstrap delay. Storage and bind
    /// failures are fatal and propagate to the caller.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.storage.connect().await?;

        let server = MessageServer::new(
            self.config.network.host.clone(),
            self.config.network.port,
            self.clone() as Arc<dyn MessageHandler>,
        );
        server.start().await?;
        *self.server.lock() = Some(server);
        self.running.store(true, Ordering::SeqCst);

        let detector = FailureDetector::new(
            self.node_id,
            self.peers.clone(),
            self.outbound.clone(),
            self.election.clone(),
            self.timings.clone(),
            self.running.clone(),
        );
        let heartbeats = detector.clone();
        tokio::spawn(async move { heartbeats.run_heartbeat_loop().await });
        tokio::spawn(async move { detector.run_health_check_loop().await });

        let maintenance = self.clone();
        tokio::spawn(async move {
            while maintenance.running.load(Ordering::SeqCst) {
                tokio::time::sleep(maintenance.timings.replication_sweep_interval).await;
                if !maintenance.running.load(Ordering::SeqCst) {
                    break;
                }
                maintenance
                    .replicator
                    .sweep_expired(maintenance.timings.replication_timeout);
                let stats = maintenance
                    .balancer
                    .statistics(&maintenance.peers.snapshot());
                tracing::debug!(
                    "load: {} active nodes, {} queries served (min {} / max {})",
                    stats.total_nodes,
                    stats.total_queries,
                    stats.min_queries,
                    stats.max_queries
                );
            }
        });

        // Give the peers a moment to be heard from before electing.
        tokio::time::sleep(self.timings.bootstrap_delay).await;
        self.election.start_election().await;

        tracing::info!("node {} active", self.node_id);
        Ok(())
    }

    /// Cooperative shutdown: loops observe the flag between iterations and
    /// the accept task is torn down.
    pub fn stop(&self) {
        tracing::info!("stopping node {}", self.node_id);
        self.running.store(false, Ordering::SeqCst);
        if let Some(server) = self.server.lock().take() {
            server.stop();
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_coordinator(&self) -> bool {
        self.election.is_coordinator()
    }

    pub fn current_coordinator(&self) -> Option<NodeId> {
        self.election.current_coordinator()
    }

    pub fn pending_replications(&self) -> usize {
        self.replicator.pending_count()
    }

    pub fn peers(&self) -> Arc<PeerRegistry> {
        self.peers.clone()
    }

    /// Run a write under two-phase commit instead of the asynchronous
    /// replication path.
    pub async fn execute_atomic(&self, sql: &str) -> Result<QueryResult> {
        self.transactions.execute_two_phase(sql).await
    }

    /// The client QUERY path: execute locally, commit writes, answer on
    /// the inbound stream, and only then replicate.
    async fn handle_query(&self, message: &Message, sql: &str) -> Reply {
        tracing::info!("executing query: {:.60}", sql);
        let started = Instant::now();
        let execution = self.storage.execute(sql).await;
        let execution_time = started.elapsed().as_secs_f64();

        self.peers.increment_query_count(self.node_id);

        let is_write = replication::is_write_statement(sql);
        if execution.ok && is_write {
            if let Err(e) = self.storage.commit().await {
                tracing::error!("commit failed: {}", e);
            }
        }

        let result = if execution.ok {
            QueryResult {
                success: true,
                data: execution.rows,
                error: None,
                node_id: Some(self.node_id),
                execution_time: Some(execution_time),
                rows_affected: Some(execution.rows_affected),
            }
        } else {
            QueryResult::failure(
                execution
                    .error
                    .unwrap_or_else(|| "execution failed".to_string()),
                self.node_id,
            )
        };
        let success = result.success;

        let transaction_id = message
            .transaction_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let response = Message::unicast(
            Payload::QueryResponse { result },
            self.node_id,
            message.sender_id,
        )
        .with_transaction(&transaction_id);

        // The response is flushed before the fan-out starts; the client
        // never waits on replication.
        if success && is_write {
            let replicator = self.replicator.clone();
            let sql = sql.to_string();
            Reply::then(response, async move {
                replicator.replicate(&sql, &transaction_id).await;
            })
        } else {
            Reply::new(response)
        }
    }
}

#[async_trait]
impl MessageHandler for MeshNode {
    async fn handle_message(&self, message: Message) -> Option<Reply> {
        let sender_id = message.sender_id;
        match &message.payload {
            Payload::Heartbeat { .. } => {
                match self.peers.record_heartbeat(sender_id) {
                    Some(true) => tracing::info!("node {} is active again", sender_id),
                    Some(false) => {}
                    None => tracing::warn!("heartbeat from unknown node {}", sender_id),
                }
                None
            }
            Payload::Query { sql } => Some(self.handle_query(&message, sql).await),
            Payload::Prepare { sql } => {
                match message.transaction_id.as_deref() {
                    Some(transaction_id) => {
                        self.transactions
                            .handle_prepare(sql, sender_id, transaction_id)
                            .await
                    }
                    None => tracing::warn!("PREPARE without transaction id from {}", sender_id),
                }
                None
            }
            Payload::Commit => {
                if let Some(transaction_id) = message.transaction_id.as_deref() {
                    self.transactions.handle_commit(transaction_id).await;
                }
                None
            }
            Payload::Abort => {
                if let Some(transaction_id) = message.transaction_id.as_deref() {
                    self.transactions.handle_abort(transaction_id).await;
                }
                None
            }
            Payload::Replicate { sql } => {
                match message.transaction_id.as_deref() {
                    Some(transaction_id) => {
                        self.replicator
                            .apply_remote(sql, sender_id, transaction_id)
                            .await
                    }
                    None => tracing::warn!("REPLICATE without transaction id from {}", sender_id),
                }
                None
            }
            Payload::ReplicateAck { success } => {
                if let Some(transaction_id) = message.transaction_id.as_deref() {
                    self.replicator
                        .record_ack(transaction_id, sender_id, *success);
                }
                None
            }
            Payload::Election => {
                self.election.handle_election(sender_id).await;
                None
            }
            Payload::ElectionAck => {
                self.election.handle_election_ack(sender_id);
                None
            }
            Payload::PrepareVote { vote, error } => {
                if let Some(err) = error {
                    tracing::debug!("vote from node {} carried error: {}", sender_id, err);
                }
                if let Some(transaction_id) = message.transaction_id.as_deref() {
                    self.transactions.record_vote(transaction_id, sender_id, *vote);
                }
                None
            }
            Payload::Coordinator => {
                self.election.handle_coordinator_announcement(sender_id);
                None
            }
            Payload::QueryResponse { .. } => {
                tracing::debug!("ignoring stray query response from {}", sender_id);
                None
            }
        }
    }
}

/// Node entry point: construct a node over the bundled in-memory storage
/// backend and bring it up.
pub async fn start(config: ClusterConfig, node_id: NodeId) -> Result<Arc<MeshNode>> {
    let storage = Arc::new(MemoryAdapter::new());
    let node = MeshNode::new(&config, node_id, storage, Timings::default())?;
    node.clone().start().await?;
    Ok(node)
}
