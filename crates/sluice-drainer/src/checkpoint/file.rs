//! File-backed checkpoint: TOML via tmp + fsync + atomic rename.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CheckPoint, CheckpointError, CheckpointRecord};

/// Minimum interval between background saves.
const MIN_SAVE_INTERVAL: Duration = Duration::from_secs(3);

/// Checkpoint stored as a TOML file next to the drainer's data.
pub struct FileCheckpoint {
    path: PathBuf,
    last_save: Mutex<Option<Instant>>,
}

impl FileCheckpoint {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_save: Mutex::new(None),
        }
    }

    fn io(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CheckPoint for FileCheckpoint {
    async fn load(&self) -> Result<CheckpointRecord, CheckpointError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound)
            }
            Err(e) => return Err(self.io(e)),
        };
        toml::from_str(&raw).map_err(|e| CheckpointError::Encode(e.to_string()))
    }

    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let encoded =
            toml::to_string_pretty(record).map_err(|e| CheckpointError::Encode(e.to_string()))?;

        // Write-to-temp then rename keeps the record atomic; fsync first
        // so the rename never publishes a torn file.
        let tmp = self.path.with_extension("tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp).map_err(|e| self.io(e))?;
            file.write_all(encoded.as_bytes()).map_err(|e| self.io(e))?;
            file.sync_all().map_err(|e| self.io(e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io(e))?;

        *self.last_save.lock() = Some(Instant::now());
        Ok(())
    }

    fn check(&self) -> bool {
        self.last_save
            .lock()
            .map_or(true, |t| t.elapsed() >= MIN_SAVE_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStatus, PosRecord};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let cp = FileCheckpoint::new(tmp.path().join("savepoint"));
        assert!(matches!(cp.load().await, Err(CheckpointError::NotFound)));
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let cp = FileCheckpoint::new(tmp.path().join("savepoint"));

        let mut record = CheckpointRecord::new(777, CheckpointStatus::Running);
        record
            .positions
            .insert("pump-1".to_string(), PosRecord { suffix: 1, offset: 26 });
        cp.save(&record).await.unwrap();

        let back = cp.load().await.unwrap();
        assert_eq!(back, record);

        // Overwrite with a clean-shutdown record.
        cp.save(&CheckpointRecord::new(900, CheckpointStatus::Normal))
            .await
            .unwrap();
        let back = cp.load().await.unwrap();
        assert_eq!(back.commit_ts, 900);
        assert_eq!(back.status, CheckpointStatus::Normal);
    }

    #[tokio::test]
    async fn test_check_gates_on_save_interval() {
        let tmp = TempDir::new().unwrap();
        let cp = FileCheckpoint::new(tmp.path().join("savepoint"));
        assert!(cp.check());
        cp.save(&CheckpointRecord::new(1, CheckpointStatus::Running))
            .await
            .unwrap();
        assert!(!cp.check());
    }

    #[tokio::test]
    async fn test_no_tmp_file_left_behind() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("savepoint");
        let cp = FileCheckpoint::new(&path);
        cp.save(&CheckpointRecord::new(5, CheckpointStatus::Normal))
            .await
            .unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
