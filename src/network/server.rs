//! Inbound transport: accept loop, framing, checksum validation.

use crate::core::message::{self, Message};
use crate::error::{DbError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Work deferred until a reply has been flushed to the requester.
pub type DeferredTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Outcome of handling one inbound message on a connection. The reply is
/// written back on the same stream; any deferred work (the write-replication
/// fan-out) runs only after the reply has been flushed.
pub struct Reply {
    pub message: Message,
    pub deferred: Option<DeferredTask>,
}

impl Reply {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            deferred: None,
        }
    }

    pub fn then(message: Message, task: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            message,
            deferred: Some(Box::pin(task)),
        }
    }
}

/// Receiver of validated inbound messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message. Dispatch may be reentrant: handlers run on
    /// independent connection tasks.
    async fn handle_message(&self, message: Message) -> Option<Reply>;
}

/// TCP server speaking the newline-framed message protocol.
pub struct MessageServer {
    host: String,
    port: u16,
    handler: Arc<dyn MessageHandler>,
    running: Arc<AtomicBool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageServer {
    pub fn new(host: String, port: u16, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            host,
            port,
            handler,
            running: Arc::new(AtomicBool::new(false)),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind the listen socket and spawn the accept loop. A bind failure is
    /// fatal to the node and is returned to the caller.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                DbError::Network(format!("failed to bind {}:{}: {}", self.host, self.port, e))
            })?;

        self.running.store(true, Ordering::SeqCst);
        tracing::info!("message server listening on {}:{}", self.host, self.port);

        let running = self.running.clone();
        let handler = self.handler.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        tracing::debug!("accepted connection from {}", addr);
                        let handler = handler.clone();
                        let running = running.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, handler, running).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        tracing::error!("accept failed: {}", e);
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(task);
        Ok(())
    }

    /// Stop accepting connections. Outstanding handlers wind down on their
    /// own when their peers disconnect.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        tracing::info!("message server on {}:{} stopped", self.host, self.port);
    }
}

/// Read frames until the peer closes. Partial frames are retained across
/// reads by the buffered reader; a frame that fails checksum or JSON
/// validation is dropped without disconnecting the peer.
async fn handle_connection(
    stream: TcpStream,
    handler: Arc<dyn MessageHandler>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    while running.load(Ordering::SeqCst) {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| DbError::Network(e.to_string()))?;
        if n == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let message = match message::decode(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("dropping invalid frame: {}", e);
                continue;
            }
        };
        tracing::debug!(
            "received {} from node {}",
            message.payload.wire_type(),
            message.sender_id
        );

        if let Some(reply) = handler.handle_message(message).await {
            let frame = message::encode(&reply.message)?;
            write_half
                .write_all(frame.as_bytes())
                .await
                .map_err(|e| DbError::Network(e.to_string()))?;
            write_half
                .write_all(b"\n")
                .await
                .map_err(|e| DbError::Network(e.to_string()))?;
            write_half
                .flush()
                .await
                .map_err(|e| DbError::Network(e.to_string()))?;
            if let Some(task) = reply.deferred {
                tokio::spawn(task);
            }
        }
    }

    Ok(())
}
