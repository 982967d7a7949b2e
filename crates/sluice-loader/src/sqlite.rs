//! SQLite-backed [`Executor`].
//!
//! Used by the integration suites to validate end-state semantics against
//! a real database, and usable as a lightweight standalone sink. The
//! connection is owned behind a blocking mutex; statements run on the
//! blocking thread pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::ToSqlOutput;
use rusqlite::{Connection, ToSql};

use crate::executor::{ExecuteError, Executor};
use crate::model::{Statement, Value};

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
            Value::I64(v) => ToSqlOutput::from(*v),
            Value::U64(v) => match i64::try_from(*v) {
                Ok(v) => ToSqlOutput::from(v),
                Err(_) => ToSqlOutput::from(v.to_string()),
            },
            Value::F64(v) => ToSqlOutput::from(*v),
            Value::Bytes(v) => ToSqlOutput::from(v.as_slice()),
            Value::Text(v) => ToSqlOutput::from(v.as_str()),
        })
    }
}

/// [`Executor`] over a single SQLite connection.
pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutor {
    /// In-memory database, private to this executor.
    pub fn open_in_memory() -> Result<Self, ExecuteError> {
        let conn = Connection::open_in_memory().map_err(permanent)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// File-backed database.
    pub fn open(path: &Path) -> Result<Self, ExecuteError> {
        let conn = Connection::open(path).map_err(permanent)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs one ad-hoc statement, for test setup.
    pub fn exec_raw(&self, sql: &str) -> Result<(), ExecuteError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute_batch(sql).map_err(classify)
    }

    /// Reads all rows of a query as integer pairs, for test assertions.
    pub fn query_i64_pairs(&self, sql: &str) -> Result<Vec<(i64, i64)>, ExecuteError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn.prepare(sql).map_err(classify)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(classify)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(classify)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl Executor for SqliteExecutor {
    async fn execute_dml(&self, stmts: Vec<Statement>) -> Result<(), ExecuteError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(poisoned)?;
            let tx = conn.transaction().map_err(classify)?;
            for stmt in &stmts {
                let params = rusqlite::params_from_iter(stmt.args.iter());
                tx.execute(&stmt.sql, params).map_err(classify)?;
            }
            tx.commit().map_err(classify)
        })
        .await
        .map_err(|e| ExecuteError::Permanent(e.to_string()))?
    }

    async fn execute_ddl(&self, _database: &str, sql: &str) -> Result<(), ExecuteError> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(poisoned)?;
            conn.execute_batch(&sql).map_err(classify)
        })
        .await
        .map_err(|e| ExecuteError::Permanent(e.to_string()))?
    }
}

fn classify(e: rusqlite::Error) -> ExecuteError {
    use rusqlite::ErrorCode;
    match &e {
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(
                inner.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            ExecuteError::Retryable(e.to_string())
        }
        _ => ExecuteError::Permanent(e.to_string()),
    }
}

fn permanent(e: rusqlite::Error) -> ExecuteError {
    ExecuteError::Permanent(e.to_string())
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> ExecuteError {
    ExecuteError::Permanent("sqlite connection poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(sql: &str, args: Vec<Value>) -> Statement {
        Statement {
            sql: sql.to_string(),
            args,
        }
    }

    #[tokio::test]
    async fn test_batch_is_transactional() {
        let ex = SqliteExecutor::open_in_memory().unwrap();
        ex.exec_raw("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)")
            .unwrap();

        // Second statement violates the primary key; the first must roll back.
        let result = ex
            .execute_dml(vec![
                stmt("INSERT INTO t VALUES (?,?)", vec![Value::I64(1), Value::I64(1)]),
                stmt("INSERT INTO t VALUES (?,?)", vec![Value::I64(1), Value::I64(2)]),
            ])
            .await;
        assert!(matches!(result, Err(ExecuteError::Permanent(_))));
        assert!(ex.query_i64_pairs("SELECT id, v FROM t").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_is_idempotent() {
        let ex = SqliteExecutor::open_in_memory().unwrap();
        ex.exec_raw("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)")
            .unwrap();
        let batch = vec![stmt(
            "REPLACE INTO t VALUES (?,?)",
            vec![Value::I64(1), Value::I64(7)],
        )];
        ex.execute_dml(batch.clone()).await.unwrap();
        ex.execute_dml(batch).await.unwrap();
        assert_eq!(ex.query_i64_pairs("SELECT id, v FROM t").unwrap(), vec![(1, 7)]);
    }

    #[tokio::test]
    async fn test_ddl_executes() {
        let ex = SqliteExecutor::open_in_memory().unwrap();
        ex.execute_ddl("main", "CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .await
            .unwrap();
        ex.execute_dml(vec![stmt("INSERT INTO t VALUES (?)", vec![Value::I64(3)])])
            .await
            .unwrap();
    }
}
