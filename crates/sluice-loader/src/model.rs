//! The loader's transaction model and SQL statement building.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A decoded column value, normalized away from any wire representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    I64(i64),
    U64(u64),
    F64(f64),
    Bytes(Vec<u8>),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::Bytes(v) => write!(f, "0x{}", hex(v)),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Kind of a row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmlType {
    Insert,
    Update,
    Delete,
}

/// Key structure of a table, captured when the mutation was translated so
/// the loader never consults the schema tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    /// Primary key column names, in index order.
    pub primary_keys: Vec<String>,
    /// Column name tuples of the unique (non-primary) indices.
    pub unique_keys: Vec<Vec<String>>,
}

/// One row mutation against one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dml {
    pub database: String,
    pub table: String,
    pub tp: DmlType,
    /// New column values for insert/update.
    pub values: BTreeMap<String, Value>,
    /// Old column values for update/delete.
    pub old_values: BTreeMap<String, Value>,
    /// Key structure for causality and WHERE clauses.
    pub info: TableMeta,
}

/// A schema change, replayed on the primary connection behind a barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ddl {
    pub database: String,
    pub sql: String,
}

/// One upstream transaction in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Txn {
    pub dmls: Vec<Dml>,
    pub ddl: Option<Ddl>,
    /// Commit timestamp, carried through for checkpointing.
    pub commit_ts: i64,
}

impl Txn {
    /// A transaction holding a single schema change.
    #[must_use]
    pub fn ddl(database: impl Into<String>, sql: impl Into<String>, commit_ts: i64) -> Self {
        Self {
            dmls: Vec::new(),
            ddl: Some(Ddl {
                database: database.into(),
                sql: sql.into(),
            }),
            commit_ts,
        }
    }

    /// A transaction holding row mutations.
    #[must_use]
    pub fn dml(dmls: Vec<Dml>, commit_ts: i64) -> Self {
        Self {
            dmls,
            ddl: None,
            commit_ts,
        }
    }

    #[must_use]
    pub fn is_ddl(&self) -> bool {
        self.ddl.is_some()
    }

    /// All causality keys of the transaction's mutations.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for dml in &self.dmls {
            dml.append_keys(&mut keys);
        }
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}

/// One parameterized SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<Value>,
}

impl Dml {
    fn qualified(&self) -> String {
        format!("`{}`.`{}`", self.database, self.table)
    }

    /// Appends the causality keys of this mutation: one per key tuple per
    /// touched row image. A table without any key serializes on a single
    /// table-wide key.
    pub(crate) fn append_keys(&self, out: &mut Vec<String>) {
        let mut tuples: Vec<&[String]> = Vec::new();
        if !self.info.primary_keys.is_empty() {
            tuples.push(&self.info.primary_keys);
        }
        for uk in &self.info.unique_keys {
            tuples.push(uk);
        }
        if tuples.is_empty() {
            out.push(format!("{}.{}", self.database, self.table));
            return;
        }

        let images: &[&BTreeMap<String, Value>] = match self.tp {
            DmlType::Insert => &[&self.values],
            DmlType::Delete => &[&self.old_values],
            DmlType::Update => &[&self.old_values, &self.values],
        };
        for image in images {
            for tuple in &tuples {
                if let Some(key) = self.format_key(tuple, image) {
                    out.push(key);
                }
            }
        }
    }

    fn format_key(&self, cols: &[String], image: &BTreeMap<String, Value>) -> Option<String> {
        let mut parts = Vec::with_capacity(cols.len());
        for col in cols {
            let value = image.get(col)?;
            parts.push(format!("{col}={value}"));
        }
        Some(format!(
            "{}.{}:{}",
            self.database,
            self.table,
            parts.join(",")
        ))
    }

    /// The WHERE-clause column set: the primary key when the table has
    /// one, every old column otherwise.
    fn where_image(&self) -> Vec<(&String, &Value)> {
        let image = match self.tp {
            DmlType::Insert => &self.values,
            DmlType::Update | DmlType::Delete => &self.old_values,
        };
        if !self.info.primary_keys.is_empty() {
            self.info
                .primary_keys
                .iter()
                .filter_map(|pk| image.get_key_value(pk))
                .collect()
        } else {
            image.iter().collect()
        }
    }

    fn where_clause(&self) -> (String, Vec<Value>) {
        let mut parts = Vec::new();
        let mut args = Vec::new();
        for (col, value) in self.where_image() {
            if matches!(value, Value::Null) {
                parts.push(format!("`{col}` IS NULL"));
            } else {
                parts.push(format!("`{col}` = ?"));
                args.push(value.clone());
            }
        }
        (parts.join(" AND "), args)
    }

    fn insert_stmt(&self, verb: &str) -> Statement {
        let cols: Vec<String> = self.values.keys().map(|c| format!("`{c}`")).collect();
        let holes: Vec<&str> = self.values.keys().map(|_| "?").collect();
        Statement {
            sql: format!(
                "{verb} INTO {} ({}) VALUES ({})",
                self.qualified(),
                cols.join(","),
                holes.join(",")
            ),
            args: self.values.values().cloned().collect(),
        }
    }

    fn update_stmt(&self) -> Statement {
        let sets: Vec<String> = self.values.keys().map(|c| format!("`{c}` = ?")).collect();
        let mut args: Vec<Value> = self.values.values().cloned().collect();
        let (cond, mut where_args) = self.where_clause();
        args.append(&mut where_args);
        Statement {
            sql: format!(
                "UPDATE {} SET {} WHERE {}",
                self.qualified(),
                sets.join(", "),
                cond
            ),
            args,
        }
    }

    fn delete_stmt(&self) -> Statement {
        let (cond, args) = self.where_clause();
        Statement {
            sql: format!("DELETE FROM {} WHERE {}", self.qualified(), cond),
            args,
        }
    }

    /// Lowers the mutation to SQL. In safe mode every form is idempotent:
    /// inserts become REPLACE, updates become DELETE-old plus REPLACE-new.
    #[must_use]
    pub fn statements(&self, safe_mode: bool) -> Vec<Statement> {
        match (self.tp, safe_mode) {
            (DmlType::Insert, false) => vec![self.insert_stmt("INSERT")],
            (DmlType::Insert, true) => vec![self.insert_stmt("REPLACE")],
            (DmlType::Update, false) => vec![self.update_stmt()],
            (DmlType::Update, true) => {
                vec![self.delete_stmt(), self.insert_stmt("REPLACE")]
            }
            (DmlType::Delete, _) => vec![self.delete_stmt()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn meta() -> TableMeta {
        TableMeta {
            primary_keys: vec!["id".to_string()],
            unique_keys: vec![vec!["a1".to_string()]],
        }
    }

    fn insert(id: i64, a1: i64) -> Dml {
        Dml {
            database: "main".to_string(),
            table: "uindex".to_string(),
            tp: DmlType::Insert,
            values: row(&[("id", Value::I64(id)), ("a1", Value::I64(a1))]),
            old_values: BTreeMap::new(),
            info: meta(),
        }
    }

    #[test]
    fn test_insert_statement() {
        let stmt = &insert(1, 10).statements(false)[0];
        assert_eq!(
            stmt.sql,
            "INSERT INTO `main`.`uindex` (`a1`,`id`) VALUES (?,?)"
        );
        assert_eq!(stmt.args, vec![Value::I64(10), Value::I64(1)]);
    }

    #[test]
    fn test_safe_mode_insert_is_replace() {
        let stmt = &insert(1, 10).statements(true)[0];
        assert!(stmt.sql.starts_with("REPLACE INTO"));
    }

    #[test]
    fn test_update_statement_filters_on_primary_key() {
        let dml = Dml {
            tp: DmlType::Update,
            values: row(&[("id", Value::I64(1)), ("a1", Value::I64(30))]),
            old_values: row(&[("id", Value::I64(1)), ("a1", Value::I64(10))]),
            ..insert(0, 0)
        };
        let stmts = dml.statements(false);
        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0].sql,
            "UPDATE `main`.`uindex` SET `a1` = ?, `id` = ? WHERE `id` = ?"
        );
        assert_eq!(
            stmts[0].args,
            vec![Value::I64(30), Value::I64(1), Value::I64(1)]
        );
    }

    #[test]
    fn test_safe_mode_update_is_delete_plus_replace() {
        let dml = Dml {
            tp: DmlType::Update,
            values: row(&[("id", Value::I64(1)), ("a1", Value::I64(30))]),
            old_values: row(&[("id", Value::I64(1)), ("a1", Value::I64(10))]),
            ..insert(0, 0)
        };
        let stmts = dml.statements(true);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].sql.starts_with("DELETE FROM"));
        assert!(stmts[1].sql.starts_with("REPLACE INTO"));
    }

    #[test]
    fn test_delete_without_keys_filters_on_all_columns() {
        let dml = Dml {
            database: "main".to_string(),
            table: "bare".to_string(),
            tp: DmlType::Delete,
            values: BTreeMap::new(),
            old_values: row(&[("a", Value::I64(1)), ("b", Value::Null)]),
            info: TableMeta::default(),
        };
        let stmts = dml.statements(false);
        assert_eq!(
            stmts[0].sql,
            "DELETE FROM `main`.`bare` WHERE `a` = ? AND `b` IS NULL"
        );
        assert_eq!(stmts[0].args, vec![Value::I64(1)]);
    }

    #[test]
    fn test_keys_cover_primary_and_unique_tuples() {
        let txn = Txn::dml(vec![insert(1, 10)], 100);
        let keys = txn.keys();
        assert!(keys.contains(&"main.uindex:id=1".to_string()));
        assert!(keys.contains(&"main.uindex:a1=10".to_string()));
    }

    #[test]
    fn test_update_keys_cover_both_images() {
        let dml = Dml {
            tp: DmlType::Update,
            values: row(&[("id", Value::I64(1)), ("a1", Value::I64(30))]),
            old_values: row(&[("id", Value::I64(1)), ("a1", Value::I64(10))]),
            ..insert(0, 0)
        };
        let txn = Txn::dml(vec![dml], 100);
        let keys = txn.keys();
        assert!(keys.contains(&"main.uindex:a1=10".to_string()));
        assert!(keys.contains(&"main.uindex:a1=30".to_string()));
    }

    #[test]
    fn test_keyless_table_gets_table_wide_key() {
        let dml = Dml {
            database: "main".to_string(),
            table: "bare".to_string(),
            tp: DmlType::Insert,
            values: row(&[("a", Value::I64(1))]),
            old_values: BTreeMap::new(),
            info: TableMeta::default(),
        };
        assert_eq!(Txn::dml(vec![dml], 1).keys(), vec!["main.bare".to_string()]);
    }
}
