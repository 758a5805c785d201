//! In-process statement-log backend.
//!
//! Statements execute into a staging area and only reach the applied log on
//! commit, mirroring a connection with autocommit off. Reads answer with
//! empty row sets. Statements containing a configured fragment fail, which
//! is how the test suite exercises vote-NO and rollback paths.

use crate::error::Result;
use crate::storage::{Execution, StorageAdapter};
use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct MemoryState {
    connected: bool,
    applied: Vec<String>,
    staged: Vec<String>,
    in_transaction: bool,
}

#[derive(Debug, Default)]
pub struct MemoryAdapter {
    state: Mutex<MemoryState>,
    fail_on: Vec<String>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter that rejects any statement containing one of the given
    /// fragments.
    pub fn failing_on<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Mutex::new(MemoryState::default()),
            fail_on: fragments.into_iter().map(Into::into).collect(),
        }
    }

    /// Statements that have been committed, in application order.
    pub fn applied_statements(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    pub fn applied_count(&self) -> usize {
        self.state.lock().applied.len()
    }

    /// Whether any committed statement contains the given fragment.
    pub fn contains(&self, fragment: &str) -> bool {
        self.state
            .lock()
            .applied
            .iter()
            .any(|sql| sql.contains(fragment))
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn connect(&self) -> Result<()> {
        self.state.lock().connected = true;
        tracing::info!("memory storage backend ready");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn execute(&self, sql: &str) -> Execution {
        let mut state = self.state.lock();
        if !state.connected {
            return Execution::failed("storage backend not connected");
        }
        if self.fail_on.iter().any(|fragment| sql.contains(fragment)) {
            tracing::debug!("rejecting statement: {}", sql);
            return Execution::failed(format!("statement rejected: {}", sql));
        }
        if sql.trim_start().to_uppercase().starts_with("SELECT") {
            Execution::rows(Vec::new())
        } else {
            state.staged.push(sql.to_string());
            Execution::affected(1)
        }
    }

    async fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.in_transaction = true;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut staged = std::mem::take(&mut state.staged);
        state.applied.append(&mut staged);
        state.in_transaction = false;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.staged.clear();
        state.in_transaction = false;
        Ok(())
    }
}
