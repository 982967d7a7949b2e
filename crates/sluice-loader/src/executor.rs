//! The downstream execution seam.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::model::Statement;

/// Downstream failure, split along the retry boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecuteError {
    /// Deadlock, lock timeout, connection blip: retry with backoff.
    #[error("retryable downstream error: {0}")]
    Retryable(String),

    /// Syntax error, missing table, constraint violation outside safe
    /// mode: operator intervention expected.
    #[error("permanent downstream error: {0}")]
    Permanent(String),
}

/// Applies batches of statements to the downstream database.
///
/// `execute_dml` must apply the whole batch inside one transaction;
/// dialect concerns live entirely behind this trait.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs the batch as `BEGIN; …; COMMIT`.
    async fn execute_dml(&self, stmts: Vec<Statement>) -> Result<(), ExecuteError>;

    /// Runs one schema change on the primary connection.
    async fn execute_ddl(&self, database: &str, sql: &str) -> Result<(), ExecuteError>;
}

/// Entry recorded by [`MemoryExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// One committed DML batch.
    Dml(Vec<Statement>),
    /// One schema change.
    Ddl { database: String, sql: String },
}

/// Test executor: records everything applied, in order, and can be
/// scripted to fail.
#[derive(Default)]
pub struct MemoryExecutor {
    applied: Mutex<Vec<Applied>>,
    failures: Mutex<VecDeque<ExecuteError>>,
}

impl MemoryExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error; each execute call consumes at most one.
    pub fn push_failure(&self, err: ExecuteError) {
        self.failures.lock().push_back(err);
    }

    /// Everything applied so far.
    #[must_use]
    pub fn applied(&self) -> Vec<Applied> {
        self.applied.lock().clone()
    }

    /// Count of committed DML batches.
    #[must_use]
    pub fn batches(&self) -> usize {
        self.applied
            .lock()
            .iter()
            .filter(|a| matches!(a, Applied::Dml(_)))
            .count()
    }

    fn take_failure(&self) -> Option<ExecuteError> {
        self.failures.lock().pop_front()
    }
}

#[async_trait]
impl Executor for MemoryExecutor {
    async fn execute_dml(&self, stmts: Vec<Statement>) -> Result<(), ExecuteError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.applied.lock().push(Applied::Dml(stmts));
        Ok(())
    }

    async fn execute_ddl(&self, database: &str, sql: &str) -> Result<(), ExecuteError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.applied.lock().push(Applied::Ddl {
            database: database.to_string(),
            sql: sql.to_string(),
        });
        Ok(())
    }
}
