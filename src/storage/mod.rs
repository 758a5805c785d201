//! The narrow seam between a node and its local relational backend.
//!
//! The engine itself is an external collaborator; the node only needs to
//! execute opaque SQL strings and drive manual transaction control. The
//! bundled [`memory::MemoryAdapter`] stands in for a real engine during
//! development and in the test suite.

pub mod memory;

pub use memory::MemoryAdapter;

use crate::core::result::Row;
use crate::error::{DbError, Result};
use async_trait::async_trait;

/// Outcome of executing a single statement. SQL failures are data, not
/// transport errors: they cross the wire inside query results and prepare
/// votes.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub ok: bool,
    pub rows: Option<Vec<Row>>,
    pub error: Option<String>,
    pub rows_affected: u64,
}

impl Execution {
    /// A successful read.
    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            ok: true,
            rows_affected: rows.len() as u64,
            rows: Some(rows),
            error: None,
        }
    }

    /// A successful write.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            ok: true,
            rows: None,
            error: None,
            rows_affected,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            rows: None,
            error: Some(error.into()),
            rows_affected: 0,
        }
    }
}

/// Narrow interface over the local SQL engine. Implementations serialize
/// access to their connection internally; callers drive transaction
/// boundaries explicitly (autocommit is off).
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn execute(&self, sql: &str) -> Execution;

    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    /// Run several statements inside one local transaction, rolling back
    /// on the first failure.
    async fn execute_transaction(&self, statements: &[String]) -> Result<()> {
        self.begin().await?;
        for sql in statements {
            let execution = self.execute(sql).await;
            if !execution.ok {
                self.rollback().await?;
                return Err(DbError::Storage(
                    execution
                        .error
                        .unwrap_or_else(|| "statement failed".to_string()),
                ));
            }
        }
        self.commit().await
    }
}
