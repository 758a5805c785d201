//! Asynchronous write replication.
//!
//! Writes committed locally are fanned out to every peer after the client
//! has its response; followers apply them and acknowledge. Delivery is
//! best-effort and eventually consistent: a ledger tracks outstanding
//! acknowledgements and a sweeper expires entries that never complete.

use crate::cluster::registry::PeerRegistry;
use crate::core::message::{Message, Payload};
use crate::core::node::NodeId;
use crate::network::Outbound;
use crate::storage::StorageAdapter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WRITE_PREFIXES: [&str; 7] = [
    "INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "TRUNCATE",
];

/// Whether a statement mutates data. Only writes replicate.
pub fn is_write_statement(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    WRITE_PREFIXES
        .iter()
        .any(|prefix| upper.starts_with(prefix))
}

/// Bookkeeping for one outstanding replicated write.
#[derive(Debug, Clone)]
pub struct PendingReplication {
    pub sql: String,
    pub expected_acks: usize,
    pub received_acks: usize,
    created_at: Instant,
}

pub struct Replicator {
    node_id: NodeId,
    storage: Arc<dyn StorageAdapter>,
    outbound: Arc<dyn Outbound>,
    peers: Arc<PeerRegistry>,
    pending: Mutex<HashMap<String, PendingReplication>>,
}

impl Replicator {
    pub fn new(
        node_id: NodeId,
        storage: Arc<dyn StorageAdapter>,
        outbound: Arc<dyn Outbound>,
        peers: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            node_id,
            storage,
            outbound,
            peers,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Originator path. The statement has already committed locally and
    /// the client has its response; fan it out and start tracking acks.
    /// Returns whether at least one peer received the broadcast.
    pub async fn replicate(&self, sql: &str, transaction_id: &str) -> bool {
        if !is_write_statement(sql) {
            tracing::debug!("read statement needs no replication");
            return false;
        }

        tracing::info!("replicating transaction {}", transaction_id);
        let expected_acks = self.peers.len().saturating_sub(1);
        let replicate = Message::broadcast(
            Payload::Replicate {
                sql: sql.to_string(),
            },
            self.node_id,
        )
        .with_transaction(transaction_id);

        let reached = self.outbound.dispatch(&replicate).await;
        self.pending.lock().insert(
            transaction_id.to_string(),
            PendingReplication {
                sql: sql.to_string(),
                expected_acks,
                received_acks: 0,
                created_at: Instant::now(),
            },
        );

        tracing::info!(
            "replication {} sent to {}/{} nodes",
            transaction_id,
            reached,
            expected_acks
        );
        reached > 0
    }

    /// Follower path: apply the replicated statement inside a local
    /// transaction (rolled back on failure) and acknowledge the originator
    /// either way.
    pub async fn apply_remote(&self, sql: &str, sender_id: NodeId, transaction_id: &str) {
        tracing::info!("applying replicated statement from node {}", sender_id);

        let statements = [sql.to_string()];
        let success = match self.storage.execute_transaction(&statements).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("replicated statement failed: {}", e);
                false
            }
        };

        let ack = Message::unicast(Payload::ReplicateAck { success }, self.node_id, sender_id)
            .with_transaction(transaction_id);
        self.outbound.dispatch(&ack).await;
    }

    /// Originator-side acknowledgement accounting. The entry disappears
    /// once every expected ack has arrived; acks for unknown transactions
    /// are logged and discarded. Returns whether the entry completed.
    pub fn record_ack(&self, transaction_id: &str, sender_id: NodeId, success: bool) -> bool {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(transaction_id) else {
            tracing::warn!("ack for unknown replication {}", transaction_id);
            return false;
        };

        entry.received_acks += 1;
        tracing::info!(
            "replication ack from node {} ({}) - {}/{}",
            sender_id,
            if success { "ok" } else { "failed" },
            entry.received_acks,
            entry.expected_acks
        );

        if entry.received_acks >= entry.expected_acks {
            pending.remove(transaction_id);
            tracing::info!("replication {} fully acknowledged", transaction_id);
            return true;
        }
        false
    }

    /// Expire entries older than `max_age`. Replication is best-effort:
    /// expiry is logged and nothing else happens.
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|transaction_id, entry| {
            if entry.created_at.elapsed() > max_age {
                tracing::warn!(
                    "replication {} timed out with {}/{} acks",
                    transaction_id,
                    entry.received_acks,
                    entry.expected_acks
                );
                false
            } else {
                true
            }
        });
        before - pending.len()
    }
}
