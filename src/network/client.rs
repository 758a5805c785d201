//! Outbound transport: one fresh connection per message, bounded by a
//! connect-and-send timeout. Failures are logged and counted; the caller
//! sees a per-target boolean. No retries happen at this layer.

use crate::cluster::registry::PeerRegistry;
use crate::core::message::{self, CommunicationType, Message};
use crate::core::node::NodeId;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub struct MessageClient {
    send_timeout: Duration,
    send_failures: AtomicU64,
}

impl MessageClient {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            send_timeout,
            send_failures: AtomicU64::new(0),
        }
    }

    /// Total failed sends since startup.
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    /// Deliver one message to one endpoint. Returns whether the frame was
    /// written within the timeout.
    pub async fn send(&self, msg: &Message, host: &str, port: u16, target: NodeId) -> bool {
        let frame = match message::encode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("failed to encode {}: {}", msg.payload.wire_type(), e);
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        let attempt = timeout(self.send_timeout, async {
            let mut stream = TcpStream::connect((host, port)).await?;
            stream.write_all(frame.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await?;
            std::io::Result::Ok(())
        })
        .await;

        match attempt {
            Ok(Ok(())) => {
                tracing::debug!("sent {} to node {}", msg.payload.wire_type(), target);
                true
            }
            Ok(Err(e)) => {
                tracing::warn!("send to node {} failed: {}", target, e);
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "send to node {} timed out after {:?}",
                    target,
                    self.send_timeout
                );
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Dispatch seam between the subsystems and the wire. Unit tests swap in a
/// recording implementation.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Dispatch a message according to its communication kind. Returns the
    /// number of nodes the message was delivered to.
    async fn dispatch(&self, msg: &Message) -> usize;
}

/// The real outbound path: endpoints resolved against the peer registry.
pub struct NetworkOutbound {
    node_id: NodeId,
    peers: Arc<PeerRegistry>,
    client: MessageClient,
}

impl NetworkOutbound {
    pub fn new(node_id: NodeId, peers: Arc<PeerRegistry>, send_timeout: Duration) -> Self {
        Self {
            node_id,
            peers,
            client: MessageClient::new(send_timeout),
        }
    }

    pub fn send_failures(&self) -> u64 {
        self.client.send_failures()
    }

    async fn send_to(&self, msg: &Message, target: NodeId) -> bool {
        match self.peers.endpoint(target) {
            Some((host, port)) => self.client.send(msg, &host, port, target).await,
            None => {
                tracing::warn!("no endpoint for node {}", target);
                false
            }
        }
    }
}

#[async_trait]
impl Outbound for NetworkOutbound {
    async fn dispatch(&self, msg: &Message) -> usize {
        match msg.communication {
            CommunicationType::Unicast => match msg.target() {
                Some(target) => usize::from(self.send_to(msg, target).await),
                None => {
                    tracing::warn!("unicast {} without target", msg.payload.wire_type());
                    0
                }
            },
            CommunicationType::Broadcast => {
                let targets: Vec<NodeId> = self
                    .peers
                    .node_ids()
                    .into_iter()
                    .filter(|id| *id != self.node_id)
                    .collect();
                let total = targets.len();
                let mut reached = 0;
                for target in targets {
                    if self.send_to(msg, target).await {
                        reached += 1;
                    }
                }
                tracing::debug!(
                    "broadcast {}: {}/{} nodes reached",
                    msg.payload.wire_type(),
                    reached,
                    total
                );
                reached
            }
            CommunicationType::Multicast => {
                let targets = msg.targets.clone().unwrap_or_default();
                let total = targets.len();
                let mut reached = 0;
                for target in targets {
                    if self.send_to(msg, target).await {
                        reached += 1;
                    }
                }
                tracing::debug!(
                    "multicast {}: {}/{} nodes reached",
                    msg.payload.wire_type(),
                    reached,
                    total
                );
                reached
            }
        }
    }
}
