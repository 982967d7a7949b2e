//! Table-backed checkpoint: one JSON row keyed by a stable identifier.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};

use super::{CheckPoint, CheckpointError, CheckpointRecord};

const MIN_SAVE_INTERVAL: Duration = Duration::from_secs(3);

/// Checkpoint stored in a `(id TEXT PRIMARY KEY, payload TEXT)` table,
/// replaced atomically on every save.
pub struct SqliteCheckpoint {
    conn: Arc<Mutex<Connection>>,
    table: String,
    id: String,
    last_save: parking_lot::Mutex<Option<Instant>>,
}

impl SqliteCheckpoint {
    /// Opens (or creates) the checkpoint table in the given database.
    /// `id` is the stable row key, typically the cluster or topic name.
    pub fn open(
        path: &Path,
        table: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, CheckpointError> {
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::with_connection(conn, table, id)
    }

    /// In-memory variant for tests.
    pub fn open_in_memory(
        table: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, CheckpointError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::with_connection(conn, table, id)
    }

    fn with_connection(
        conn: Connection,
        table: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, CheckpointError> {
        let table = table.into();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS `{table}` (id TEXT PRIMARY KEY, payload TEXT)"
        ))
        .map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table,
            id: id.into(),
            last_save: parking_lot::Mutex::new(None),
        })
    }
}

#[async_trait]
impl CheckPoint for SqliteCheckpoint {
    async fn load(&self) -> Result<CheckpointRecord, CheckpointError> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let payload: Option<String> = conn
            .query_row(
                &format!("SELECT payload FROM `{}` WHERE id = ?1", self.table),
                [&self.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        let Some(payload) = payload else {
            return Err(CheckpointError::NotFound);
        };
        serde_json::from_str(&payload).map_err(|e| CheckpointError::Encode(e.to_string()))
    }

    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let payload =
            serde_json::to_string(record).map_err(|e| CheckpointError::Encode(e.to_string()))?;
        {
            let conn = self.conn.lock().map_err(|_| poisoned())?;
            conn.execute(
                &format!(
                    "REPLACE INTO `{}` (id, payload) VALUES (?1, ?2)",
                    self.table
                ),
                [&self.id, &payload],
            )
            .map_err(sql_err)?;
        }
        *self.last_save.lock() = Some(Instant::now());
        Ok(())
    }

    fn check(&self) -> bool {
        self.last_save
            .lock()
            .map_or(true, |t| t.elapsed() >= MIN_SAVE_INTERVAL)
    }
}

fn sql_err(e: rusqlite::Error) -> CheckpointError {
    CheckpointError::Sql(e.to_string())
}

fn poisoned() -> CheckpointError {
    CheckpointError::Sql("checkpoint connection poisoned".to_string())
}
