//! Historical schema tracking.
//!
//! The tracker owns the `(schema, table) → columns` snapshot as of the
//! current replay point. It is constructed by replaying the full job
//! history and then mutated exactly once per DDL item coming off the
//! merger, always on the single apply task, so it needs no locking.
//! Other components hold plain ids and resolve through the tracker on
//! each access; nothing keeps pointers into it.

use std::collections::HashSet;

use rustc_hash::FxHashMap;

use sluice_proto::{ColumnInfo, DdlJob, FieldType, IndexInfo, JobState, JobType, SchemaInfo, TableInfo};

/// Schema tracking failures. All of them indicate a gap or duplicate in
/// the job log and are fatal to the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema {0} already exists")]
    SchemaExists(i64),
    #[error("schema {0} not found")]
    SchemaNotFound(i64),
    #[error("table {0} already exists")]
    TableExists(i64),
    #[error("table {0} not found")]
    TableNotFound(i64),
    #[error("column {column} of table {table} already exists")]
    ColumnExists { table: i64, column: i64 },
    #[error("column {column} of table {table} not found")]
    ColumnNotFound { table: i64, column: i64 },
    #[error("index {index} of table {table} already exists")]
    IndexExists { table: i64, index: String },
    #[error("ddl job {0} applied twice")]
    DuplicateJob(i64),
    #[error("ddl job {id} is malformed: {reason}")]
    MalformedJob { id: i64, reason: String },
}

/// Column metadata, keyed by the upstream column id.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub id: i64,
    pub name: String,
    pub field_type: FieldType,
    pub primary_key: bool,
    pub default_value: Option<String>,
}

/// Index metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
}

/// Table snapshot as of the current replay point.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub id: i64,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub indices: Vec<IndexDef>,
    /// The integer primary key doubles as the row handle.
    pub pk_is_handle: bool,
}

impl TableDef {
    /// Column lookup by upstream id.
    #[must_use]
    pub fn column_by_id(&self, id: i64) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Primary key column names, in declaration order.
    #[must_use]
    pub fn primary_keys(&self) -> Vec<String> {
        if let Some(pk) = self.indices.iter().find(|i| i.primary) {
            return pk.columns.clone();
        }
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Column tuples of the unique, non-primary indices.
    #[must_use]
    pub fn unique_keys(&self) -> Vec<Vec<String>> {
        self.indices
            .iter()
            .filter(|i| i.unique && !i.primary)
            .map(|i| i.columns.clone())
            .collect()
    }

    /// The column the integer row handle maps to, when the table uses
    /// handle-as-primary-key.
    #[must_use]
    pub fn handle_column(&self) -> Option<&ColumnDef> {
        if !self.pk_is_handle {
            return None;
        }
        self.columns.iter().find(|c| c.primary_key)
    }
}

impl From<&ColumnInfo> for ColumnDef {
    fn from(c: &ColumnInfo) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            field_type: c.field_type(),
            primary_key: c.primary_key,
            default_value: c.default_value.clone(),
        }
    }
}

impl From<&IndexInfo> for IndexDef {
    fn from(i: &IndexInfo) -> Self {
        Self {
            name: i.name.clone(),
            columns: i.columns.clone(),
            unique: i.unique,
            primary: i.primary,
        }
    }
}

impl From<&TableInfo> for TableDef {
    fn from(t: &TableInfo) -> Self {
        Self {
            id: t.id,
            name: t.name.clone(),
            columns: t.columns.iter().map(ColumnDef::from).collect(),
            indices: t.indices.iter().map(IndexDef::from).collect(),
            pk_is_handle: t.pk_is_handle,
        }
    }
}

#[derive(Debug, Clone)]
struct SchemaEntry {
    name: String,
    tables: Vec<i64>,
}

/// The schema tracker.
#[derive(Debug, Default)]
pub struct SchemaTracker {
    schemas: FxHashMap<i64, SchemaEntry>,
    tables: FxHashMap<i64, TableDef>,
    table_schema: FxHashMap<i64, i64>,
    ignored: HashSet<String>,
    applied: HashSet<i64>,
}

impl SchemaTracker {
    /// Builds the tracker by replaying committed, non-cancelled jobs in
    /// job-id order.
    pub fn new(
        mut history: Vec<DdlJob>,
        ignored: impl IntoIterator<Item = String>,
    ) -> Result<Self, SchemaError> {
        let mut tracker = Self {
            ignored: ignored.into_iter().collect(),
            ..Self::default()
        };
        history.sort_by_key(|j| j.id);
        for job in &history {
            tracker.apply_job(job)?;
        }
        Ok(tracker)
    }

    /// True when mutations against this schema are configured away.
    #[must_use]
    pub fn is_ignored(&self, schema_name: &str) -> bool {
        self.ignored.contains(schema_name)
    }

    /// Whether a job id has already been applied; used to skip history
    /// replayed out of the binlog during checkpoint catch-up.
    #[must_use]
    pub fn has_applied(&self, job_id: i64) -> bool {
        self.applied.contains(&job_id)
    }

    pub fn table_by_id(&self, id: i64) -> Result<&TableDef, SchemaError> {
        self.tables.get(&id).ok_or(SchemaError::TableNotFound(id))
    }

    pub fn schema_by_id(&self, id: i64) -> Result<&str, SchemaError> {
        self.schemas
            .get(&id)
            .map(|s| s.name.as_str())
            .ok_or(SchemaError::SchemaNotFound(id))
    }

    /// `(schema name, table name)` for a table id.
    pub fn schema_and_table_name(&self, table_id: i64) -> Result<(String, String), SchemaError> {
        let table = self.table_by_id(table_id)?;
        let schema_id = self
            .table_schema
            .get(&table_id)
            .ok_or(SchemaError::TableNotFound(table_id))?;
        let schema = self.schema_by_id(*schema_id)?;
        Ok((schema.to_string(), table.name.clone()))
    }

    pub fn create_schema(&mut self, schema: &SchemaInfo) -> Result<(), SchemaError> {
        if self.schemas.contains_key(&schema.id) {
            return Err(SchemaError::SchemaExists(schema.id));
        }
        self.schemas.insert(
            schema.id,
            SchemaEntry {
                name: schema.name.clone(),
                tables: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn drop_schema(&mut self, schema_id: i64) -> Result<(), SchemaError> {
        let entry = self
            .schemas
            .remove(&schema_id)
            .ok_or(SchemaError::SchemaNotFound(schema_id))?;
        for table_id in entry.tables {
            self.tables.remove(&table_id);
            self.table_schema.remove(&table_id);
        }
        Ok(())
    }

    pub fn create_table(&mut self, schema_id: i64, table: TableDef) -> Result<(), SchemaError> {
        if self.tables.contains_key(&table.id) {
            return Err(SchemaError::TableExists(table.id));
        }
        let entry = self
            .schemas
            .get_mut(&schema_id)
            .ok_or(SchemaError::SchemaNotFound(schema_id))?;
        entry.tables.push(table.id);
        self.table_schema.insert(table.id, schema_id);
        self.tables.insert(table.id, table);
        Ok(())
    }

    pub fn drop_table(&mut self, table_id: i64) -> Result<(), SchemaError> {
        self.tables
            .remove(&table_id)
            .ok_or(SchemaError::TableNotFound(table_id))?;
        if let Some(schema_id) = self.table_schema.remove(&table_id) {
            if let Some(entry) = self.schemas.get_mut(&schema_id) {
                entry.tables.retain(|id| *id != table_id);
            }
        }
        Ok(())
    }

    /// Truncation rebinds the name to a fresh table id with empty data;
    /// the old id disappears from the snapshot.
    pub fn truncate_table(&mut self, old_id: i64, table: TableDef) -> Result<(), SchemaError> {
        let schema_id = *self
            .table_schema
            .get(&old_id)
            .ok_or(SchemaError::TableNotFound(old_id))?;
        self.drop_table(old_id)?;
        self.create_table(schema_id, table)
    }

    pub fn add_column(&mut self, table_id: i64, column: ColumnDef) -> Result<(), SchemaError> {
        let table = self
            .tables
            .get_mut(&table_id)
            .ok_or(SchemaError::TableNotFound(table_id))?;
        if table.columns.iter().any(|c| c.id == column.id) {
            return Err(SchemaError::ColumnExists {
                table: table_id,
                column: column.id,
            });
        }
        table.columns.push(column);
        Ok(())
    }

    pub fn drop_column(&mut self, table_id: i64, column_id: i64) -> Result<(), SchemaError> {
        let table = self
            .tables
            .get_mut(&table_id)
            .ok_or(SchemaError::TableNotFound(table_id))?;
        let before = table.columns.len();
        table.columns.retain(|c| c.id != column_id);
        if table.columns.len() == before {
            return Err(SchemaError::ColumnNotFound {
                table: table_id,
                column: column_id,
            });
        }
        Ok(())
    }

    pub fn add_index(&mut self, table_id: i64, index: IndexDef) -> Result<(), SchemaError> {
        let table = self
            .tables
            .get_mut(&table_id)
            .ok_or(SchemaError::TableNotFound(table_id))?;
        if table.indices.iter().any(|i| i.name == index.name) {
            return Err(SchemaError::IndexExists {
                table: table_id,
                index: index.name,
            });
        }
        table.indices.push(index);
        Ok(())
    }

    /// Replaces a table wholesale with the job's post-state; used for
    /// generic alters and renames.
    pub fn replace_table(&mut self, table: TableDef) -> Result<(), SchemaError> {
        if !self.tables.contains_key(&table.id) {
            return Err(SchemaError::TableNotFound(table.id));
        }
        self.tables.insert(table.id, table);
        Ok(())
    }

    /// Applies one historical job. Cancelled jobs are skipped; a job id
    /// seen twice is an error.
    pub fn apply_job(&mut self, job: &DdlJob) -> Result<(), SchemaError> {
        if job.state() == JobState::Cancelled {
            return Ok(());
        }
        if !self.applied.insert(job.id) {
            return Err(SchemaError::DuplicateJob(job.id));
        }

        match job.tp() {
            JobType::CreateSchema => {
                let schema = require_schema_info(job)?;
                self.create_schema(schema)
            }
            JobType::DropSchema => self.drop_schema(job.schema_id),
            JobType::CreateTable => {
                let table = require_table_info(job)?;
                self.create_table(job.schema_id, TableDef::from(table))
            }
            JobType::DropTable => self.drop_table(job.table_id),
            JobType::TruncateTable => {
                let table = require_table_info(job)?;
                self.truncate_table(job.table_id, TableDef::from(table))
            }
            JobType::AddColumn => {
                let post = TableDef::from(require_table_info(job)?);
                let current = self.table_by_id(job.table_id)?;
                let added = post
                    .columns
                    .iter()
                    .find(|c| current.column_by_id(c.id).is_none())
                    .cloned()
                    .ok_or(SchemaError::MalformedJob {
                        id: job.id,
                        reason: "add-column job adds no column".to_string(),
                    })?;
                self.add_column(job.table_id, added)
            }
            JobType::DropColumn => {
                let post = TableDef::from(require_table_info(job)?);
                let current = self.table_by_id(job.table_id)?;
                let dropped = current
                    .columns
                    .iter()
                    .find(|c| post.column_by_id(c.id).is_none())
                    .map(|c| c.id)
                    .ok_or(SchemaError::MalformedJob {
                        id: job.id,
                        reason: "drop-column job drops no column".to_string(),
                    })?;
                self.drop_column(job.table_id, dropped)
            }
            JobType::AddIndex => {
                let post = TableDef::from(require_table_info(job)?);
                let current = self.table_by_id(job.table_id)?;
                let added = post
                    .indices
                    .iter()
                    .find(|i| !current.indices.iter().any(|c| c.name == i.name))
                    .cloned()
                    .ok_or(SchemaError::MalformedJob {
                        id: job.id,
                        reason: "add-index job adds no index".to_string(),
                    })?;
                self.add_index(job.table_id, added)
            }
            JobType::AlterTable | JobType::RenameTable => {
                let table = require_table_info(job)?;
                self.replace_table(TableDef::from(table))
            }
        }
    }
}

fn require_schema_info(job: &DdlJob) -> Result<&SchemaInfo, SchemaError> {
    job.schema_info.as_ref().ok_or(SchemaError::MalformedJob {
        id: job.id,
        reason: "missing schema info".to_string(),
    })
}

fn require_table_info(job: &DdlJob) -> Result<&TableInfo, SchemaError> {
    job.table_info.as_ref().ok_or(SchemaError::MalformedJob {
        id: job.id,
        reason: "missing table info".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_proto::{ColumnInfo, IndexInfo};

    pub(crate) fn column(id: i64, name: &str, pk: bool) -> ColumnInfo {
        ColumnInfo {
            id,
            name: name.to_string(),
            field_type: FieldType::Longlong as i32,
            primary_key: pk,
            default_value: None,
        }
    }

    fn table_info(id: i64, name: &str, columns: Vec<ColumnInfo>) -> TableInfo {
        TableInfo {
            id,
            name: name.to_string(),
            columns,
            indices: vec![],
            pk_is_handle: true,
        }
    }

    fn job(id: i64, tp: JobType, schema_id: i64, table_id: i64) -> DdlJob {
        DdlJob {
            id,
            tp: tp as i32,
            state: JobState::Done as i32,
            schema_id,
            table_id,
            schema_info: None,
            table_info: None,
        }
    }

    fn create_schema_job(id: i64, schema_id: i64, name: &str) -> DdlJob {
        DdlJob {
            schema_info: Some(SchemaInfo {
                id: schema_id,
                name: name.to_string(),
            }),
            ..job(id, JobType::CreateSchema, schema_id, 0)
        }
    }

    fn create_table_job(id: i64, schema_id: i64, table: TableInfo) -> DdlJob {
        DdlJob {
            table_info: Some(table.clone()),
            ..job(id, JobType::CreateTable, schema_id, table.id)
        }
    }

    fn base_history() -> Vec<DdlJob> {
        vec![
            create_schema_job(1, 10, "orders"),
            create_table_job(
                2,
                10,
                table_info(100, "uindex", vec![column(1, "id", true), column(2, "a1", false)]),
            ),
        ]
    }

    #[test]
    fn test_replay_builds_snapshot() {
        let tracker = SchemaTracker::new(base_history(), []).unwrap();
        let table = tracker.table_by_id(100).unwrap();
        assert_eq!(table.name, "uindex");
        assert_eq!(table.columns.len(), 2);
        assert_eq!(
            tracker.schema_and_table_name(100).unwrap(),
            ("orders".to_string(), "uindex".to_string())
        );
    }

    #[test]
    fn test_cancelled_job_is_skipped() {
        let mut history = base_history();
        history.push(DdlJob {
            state: JobState::Cancelled as i32,
            ..job(3, JobType::DropTable, 10, 100)
        });
        let tracker = SchemaTracker::new(history, []).unwrap();
        assert!(tracker.table_by_id(100).is_ok());
    }

    #[test]
    fn test_drop_table_then_lookup_is_not_found() {
        let mut history = base_history();
        history.push(job(3, JobType::DropTable, 10, 100));
        let tracker = SchemaTracker::new(history, []).unwrap();
        assert!(matches!(
            tracker.table_by_id(100),
            Err(SchemaError::TableNotFound(100))
        ));
    }

    #[test]
    fn test_create_existing_schema_fails() {
        let mut tracker = SchemaTracker::new(base_history(), []).unwrap();
        let err = tracker
            .apply_job(&create_schema_job(9, 10, "orders"))
            .unwrap_err();
        assert!(matches!(err, SchemaError::SchemaExists(10)));
    }

    #[test]
    fn test_duplicate_job_id_fails() {
        let mut tracker = SchemaTracker::new(base_history(), []).unwrap();
        let err = tracker
            .apply_job(&create_schema_job(1, 99, "other"))
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateJob(1)));
    }

    #[test]
    fn test_truncate_rebinds_to_new_id() {
        let mut tracker = SchemaTracker::new(base_history(), []).unwrap();
        tracker
            .apply_job(&DdlJob {
                table_info: Some(table_info(
                    101,
                    "uindex",
                    vec![column(1, "id", true), column(2, "a1", false)],
                )),
                ..job(3, JobType::TruncateTable, 10, 100)
            })
            .unwrap();
        assert!(tracker.table_by_id(100).is_err());
        assert_eq!(tracker.table_by_id(101).unwrap().name, "uindex");
    }

    #[test]
    fn test_add_and_drop_column_via_post_state() {
        let mut tracker = SchemaTracker::new(base_history(), []).unwrap();

        tracker
            .apply_job(&DdlJob {
                table_info: Some(table_info(
                    100,
                    "uindex",
                    vec![
                        column(1, "id", true),
                        column(2, "a1", false),
                        column(3, "note", false),
                    ],
                )),
                ..job(3, JobType::AddColumn, 10, 100)
            })
            .unwrap();
        assert!(tracker.table_by_id(100).unwrap().column_by_id(3).is_some());

        tracker
            .apply_job(&DdlJob {
                table_info: Some(table_info(
                    100,
                    "uindex",
                    vec![column(1, "id", true), column(3, "note", false)],
                )),
                ..job(4, JobType::DropColumn, 10, 100)
            })
            .unwrap();
        let table = tracker.table_by_id(100).unwrap();
        assert!(table.column_by_id(2).is_none());
        assert!(table.column_by_id(3).is_some());
    }

    #[test]
    fn test_add_index_diff() {
        let mut tracker = SchemaTracker::new(base_history(), []).unwrap();
        let mut post = table_info(100, "uindex", vec![column(1, "id", true), column(2, "a1", false)]);
        post.indices.push(IndexInfo {
            name: "a1_uk".to_string(),
            columns: vec!["a1".to_string()],
            unique: true,
            primary: false,
        });
        tracker
            .apply_job(&DdlJob {
                table_info: Some(post),
                ..job(3, JobType::AddIndex, 10, 100)
            })
            .unwrap();
        let table = tracker.table_by_id(100).unwrap();
        assert_eq!(table.unique_keys(), vec![vec!["a1".to_string()]]);
    }

    #[test]
    fn test_drop_schema_drops_its_tables() {
        let mut tracker = SchemaTracker::new(base_history(), []).unwrap();
        tracker.apply_job(&job(3, JobType::DropSchema, 10, 0)).unwrap();
        assert!(tracker.table_by_id(100).is_err());
        assert!(tracker.schema_by_id(10).is_err());
    }

    #[test]
    fn test_rename_table_replaces_post_state() {
        let mut tracker = SchemaTracker::new(base_history(), []).unwrap();
        tracker
            .apply_job(&DdlJob {
                table_info: Some(table_info(
                    100,
                    "uindex_renamed",
                    vec![column(1, "id", true), column(2, "a1", false)],
                )),
                ..job(3, JobType::RenameTable, 10, 100)
            })
            .unwrap();
        assert_eq!(tracker.table_by_id(100).unwrap().name, "uindex_renamed");
    }

    #[test]
    fn test_ignored_schema() {
        let tracker =
            SchemaTracker::new(base_history(), ["metrics_internal".to_string()]).unwrap();
        assert!(tracker.is_ignored("metrics_internal"));
        assert!(!tracker.is_ignored("orders"));
    }
}
