//! Translation from prewrite row bytes into the loader's row model.
//!
//! Column identity is the upstream column id, so mutations decode
//! correctly even when columns were added or dropped between the write
//! and the replay. The apply stage keeps the snapshot at the row's own
//! commit ts, never ahead of it.

use std::collections::BTreeMap;

use prost::Message;

use sluice_loader::{Dml, DmlType, TableMeta, Value};
use sluice_proto::{ColumnValue, MutationType, PrewriteValue, RowValue, TableMutation};

use crate::schema::{SchemaTracker, TableDef};
use crate::DrainerError;

/// Lowers one committed prewrite into loader mutations.
///
/// Mutations against ignored schemas are dropped. The emitted model is
/// dialect-agnostic; concrete encoders live behind the loader's executor
/// seam.
pub fn translate(
    tracker: &SchemaTracker,
    prewrite: &PrewriteValue,
    commit_ts: i64,
) -> Result<Vec<Dml>, DrainerError> {
    let mut out = Vec::with_capacity(prewrite.mutations.len());
    for mutation in &prewrite.mutations {
        if let Some(dml) = translate_mutation(tracker, mutation, commit_ts)? {
            out.push(dml);
        }
    }
    Ok(out)
}

fn translate_mutation(
    tracker: &SchemaTracker,
    mutation: &TableMutation,
    commit_ts: i64,
) -> Result<Option<Dml>, DrainerError> {
    let (database, table_name) = tracker.schema_and_table_name(mutation.table_id)?;
    if tracker.is_ignored(&database) {
        tracing::debug!(schema = %database, table = %table_name, commit_ts, "skipping ignored schema");
        return Ok(None);
    }
    let table = tracker.table_by_id(mutation.table_id)?;

    let info = TableMeta {
        primary_keys: table.primary_keys(),
        unique_keys: table.unique_keys(),
    };

    let (tp, values, old_values) = match mutation.tp() {
        MutationType::Insert => {
            let row = decode_row(table, &database, &mutation.row)?;
            (DmlType::Insert, row, BTreeMap::new())
        }
        MutationType::Update => {
            let new_row = decode_row(table, &database, &mutation.row)?;
            let old_row = decode_row(table, &database, &mutation.change_row)?;
            (DmlType::Update, new_row, old_row)
        }
        MutationType::Delete => {
            let old_row = decode_row(table, &database, &mutation.row)?;
            (DmlType::Delete, BTreeMap::new(), old_row)
        }
    };

    Ok(Some(Dml {
        database,
        table: table_name,
        tp,
        values,
        old_values,
        info,
    }))
}

/// Decodes encoded row bytes against the table snapshot.
fn decode_row(
    table: &TableDef,
    database: &str,
    bytes: &[u8],
) -> Result<BTreeMap<String, Value>, DrainerError> {
    let row = RowValue::decode(bytes)?;
    let mut out = BTreeMap::new();

    // An explicit integer primary key rides as the row handle, decoded
    // separately from the column list.
    if let (Some(handle), Some(col)) = (row.handle, table.handle_column()) {
        out.insert(col.name.clone(), Value::I64(handle));
    }

    for column in &row.columns {
        let def = table.column_by_id(column.column_id).ok_or_else(|| {
            DrainerError::UnknownColumn {
                table: format!("{database}.{}", table.name),
                column_id: column.column_id,
            }
        })?;
        out.insert(def.name.clone(), decode_value(column));
    }
    Ok(out)
}

fn decode_value(column: &ColumnValue) -> Value {
    if column.is_null {
        return Value::Null;
    }
    if let Some(v) = column.int64_value {
        return Value::I64(v);
    }
    if let Some(v) = column.uint64_value {
        return Value::U64(v);
    }
    if let Some(v) = column.double_value {
        return Value::F64(v);
    }
    if let Some(v) = &column.bytes_value {
        return Value::Bytes(v.clone());
    }
    if let Some(v) = &column.string_value {
        return Value::Text(v.clone());
    }
    Value::Null
}

/// Encodes a row for the wire; the write-side mirror of [`decode_row`],
/// also used heavily by the test suites to fabricate prewrites.
#[must_use]
pub fn encode_row(handle: Option<i64>, columns: Vec<ColumnValue>) -> Vec<u8> {
    RowValue { handle, columns }.encode_to_vec()
}

/// Convenience constructors for [`ColumnValue`].
pub mod col {
    use sluice_proto::ColumnValue;

    #[must_use]
    pub fn i64(column_id: i64, v: i64) -> ColumnValue {
        ColumnValue {
            column_id,
            int64_value: Some(v),
            ..ColumnValue::default()
        }
    }

    #[must_use]
    pub fn text(column_id: i64, v: &str) -> ColumnValue {
        ColumnValue {
            column_id,
            string_value: Some(v.to_string()),
            ..ColumnValue::default()
        }
    }

    #[must_use]
    pub fn null(column_id: i64) -> ColumnValue {
        ColumnValue {
            column_id,
            is_null: true,
            ..ColumnValue::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_proto::{
        ColumnInfo, DdlJob, FieldType, IndexInfo, JobState, JobType, SchemaInfo, TableInfo,
    };

    fn column(id: i64, name: &str, pk: bool) -> ColumnInfo {
        ColumnInfo {
            id,
            name: name.to_string(),
            field_type: FieldType::Longlong as i32,
            primary_key: pk,
            default_value: None,
        }
    }

    fn tracker() -> SchemaTracker {
        let history = vec![
            DdlJob {
                id: 1,
                tp: JobType::CreateSchema as i32,
                state: JobState::Done as i32,
                schema_id: 10,
                table_id: 0,
                schema_info: Some(SchemaInfo {
                    id: 10,
                    name: "orders".to_string(),
                }),
                table_info: None,
            },
            DdlJob {
                id: 2,
                tp: JobType::CreateTable as i32,
                state: JobState::Done as i32,
                schema_id: 10,
                table_id: 100,
                schema_info: None,
                table_info: Some(TableInfo {
                    id: 100,
                    name: "uindex".to_string(),
                    columns: vec![column(1, "id", true), column(2, "a1", false)],
                    indices: vec![IndexInfo {
                        name: "a1_uk".to_string(),
                        columns: vec!["a1".to_string()],
                        unique: true,
                        primary: false,
                    }],
                    pk_is_handle: true,
                }),
            },
        ];
        SchemaTracker::new(history, []).unwrap()
    }

    fn mutation(tp: MutationType, row: Vec<u8>, change_row: Vec<u8>) -> TableMutation {
        TableMutation {
            schema_id: 10,
            table_id: 100,
            tp: tp as i32,
            row,
            change_row,
        }
    }

    #[test]
    fn test_insert_decodes_handle_as_primary_key() {
        let t = tracker();
        let prewrite = PrewriteValue {
            mutations: vec![mutation(
                MutationType::Insert,
                encode_row(Some(1), vec![col::i64(2, 10)]),
                vec![],
            )],
        };
        let dmls = translate(&t, &prewrite, 1000).unwrap();
        assert_eq!(dmls.len(), 1);
        let dml = &dmls[0];
        assert_eq!(dml.tp, DmlType::Insert);
        assert_eq!(dml.database, "orders");
        assert_eq!(dml.table, "uindex");
        assert_eq!(dml.values.get("id"), Some(&Value::I64(1)));
        assert_eq!(dml.values.get("a1"), Some(&Value::I64(10)));
        assert_eq!(dml.info.primary_keys, vec!["id".to_string()]);
        assert_eq!(dml.info.unique_keys, vec![vec!["a1".to_string()]]);
    }

    #[test]
    fn test_update_carries_both_images() {
        let t = tracker();
        let prewrite = PrewriteValue {
            mutations: vec![mutation(
                MutationType::Update,
                encode_row(Some(1), vec![col::i64(2, 30)]),
                encode_row(Some(1), vec![col::i64(2, 10)]),
            )],
        };
        let dml = &translate(&t, &prewrite, 1000).unwrap()[0];
        assert_eq!(dml.tp, DmlType::Update);
        assert_eq!(dml.values.get("a1"), Some(&Value::I64(30)));
        assert_eq!(dml.old_values.get("a1"), Some(&Value::I64(10)));
        assert_eq!(dml.old_values.get("id"), Some(&Value::I64(1)));
    }

    #[test]
    fn test_delete_carries_old_image_only() {
        let t = tracker();
        let prewrite = PrewriteValue {
            mutations: vec![mutation(
                MutationType::Delete,
                encode_row(Some(2), vec![col::i64(2, 20)]),
                vec![],
            )],
        };
        let dml = &translate(&t, &prewrite, 1000).unwrap()[0];
        assert_eq!(dml.tp, DmlType::Delete);
        assert!(dml.values.is_empty());
        assert_eq!(dml.old_values.get("id"), Some(&Value::I64(2)));
    }

    #[test]
    fn test_unknown_column_id_is_an_invariant_violation() {
        let t = tracker();
        let prewrite = PrewriteValue {
            mutations: vec![mutation(
                MutationType::Insert,
                encode_row(Some(1), vec![col::i64(77, 5)]),
                vec![],
            )],
        };
        let err = translate(&t, &prewrite, 1000).unwrap_err();
        assert!(matches!(err, DrainerError::UnknownColumn { column_id: 77, .. }));
    }

    #[test]
    fn test_column_identity_survives_column_add() {
        let mut t = tracker();
        // A column added after the row was written: decode by id still works.
        t.apply_job(&DdlJob {
            id: 3,
            tp: JobType::AddColumn as i32,
            state: JobState::Done as i32,
            schema_id: 10,
            table_id: 100,
            schema_info: None,
            table_info: Some(TableInfo {
                id: 100,
                name: "uindex".to_string(),
                columns: vec![
                    column(1, "id", true),
                    column(2, "a1", false),
                    column(3, "note", false),
                ],
                indices: vec![],
                pk_is_handle: true,
            }),
        })
        .unwrap();

        let prewrite = PrewriteValue {
            mutations: vec![mutation(
                MutationType::Insert,
                encode_row(Some(1), vec![col::i64(2, 10), col::null(3)]),
                vec![],
            )],
        };
        let dml = &translate(&t, &prewrite, 2000).unwrap()[0];
        assert_eq!(dml.values.get("a1"), Some(&Value::I64(10)));
        assert_eq!(dml.values.get("note"), Some(&Value::Null));
    }

    #[test]
    fn test_ignored_schema_is_dropped() {
        let history = vec![
            DdlJob {
                id: 1,
                tp: JobType::CreateSchema as i32,
                state: JobState::Done as i32,
                schema_id: 20,
                table_id: 0,
                schema_info: Some(SchemaInfo {
                    id: 20,
                    name: "scratch".to_string(),
                }),
                table_info: None,
            },
            DdlJob {
                id: 2,
                tp: JobType::CreateTable as i32,
                state: JobState::Done as i32,
                schema_id: 20,
                table_id: 200,
                schema_info: None,
                table_info: Some(TableInfo {
                    id: 200,
                    name: "t".to_string(),
                    columns: vec![column(1, "id", true)],
                    indices: vec![],
                    pk_is_handle: true,
                }),
            },
        ];
        let t = SchemaTracker::new(history, ["scratch".to_string()]).unwrap();
        let prewrite = PrewriteValue {
            mutations: vec![TableMutation {
                schema_id: 20,
                table_id: 200,
                tp: MutationType::Insert as i32,
                row: encode_row(Some(1), vec![]),
                change_row: vec![],
            }],
        };
        assert!(translate(&t, &prewrite, 1000).unwrap().is_empty());
    }
}
