//! Wire protocol for the sluice binlog pipeline.
//!
//! Generated prost/tonic types for the binlog payload schema and the Pump
//! gRPC service, plus the handful of helpers every other crate needs:
//! position ordering and hybrid-logical-clock timestamp math.

#![warn(clippy::all)]

use std::cmp::Ordering;
use std::fmt;

/// Binlog payload messages (`sluice.binlog`).
pub mod binlog {
    tonic::include_proto!("sluice.binlog");
}

/// Pump RPC surface (`sluice.pump`).
pub mod pump {
    tonic::include_proto!("sluice.pump");
}

pub use binlog::{
    Binlog, BinlogType, ColumnInfo, ColumnValue, DdlJob, Entity, FieldType, IndexInfo, JobState,
    JobType, MutationType, Pos, PrewriteValue, RowValue, SchemaInfo, TableInfo, TableMutation,
};

/// Number of low bits of a commit timestamp holding the logical counter.
pub const LOGICAL_BITS: u32 = 18;

/// Compose a hybrid-logical-clock timestamp from physical milliseconds and
/// a logical counter.
#[must_use]
pub fn compose_ts(physical_ms: i64, logical: i64) -> i64 {
    (physical_ms << LOGICAL_BITS) | logical
}

/// Extract the physical millisecond component of a commit timestamp.
#[must_use]
pub fn extract_physical(ts: i64) -> i64 {
    ts >> LOGICAL_BITS
}

/// Total order over positions: lexicographic on (suffix, offset).
#[must_use]
pub fn compare_pos(a: &Pos, b: &Pos) -> Ordering {
    a.suffix.cmp(&b.suffix).then(a.offset.cmp(&b.offset))
}

impl Pos {
    /// Position at the start of the log.
    #[must_use]
    pub fn zero() -> Self {
        Self { suffix: 0, offset: 0 }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.suffix, self.offset)
    }
}

impl Binlog {
    /// A rollback-typed record with no mutations: the idle-clock heartbeat.
    #[must_use]
    pub fn fake(ts: i64) -> Self {
        Self {
            tp: BinlogType::Rollback as i32,
            start_ts: ts,
            commit_ts: ts,
            ..Self::default()
        }
    }

    /// True for rollback records carrying no mutations.
    #[must_use]
    pub fn is_fake(&self) -> bool {
        self.tp() == BinlogType::Rollback && self.prewrite_value.is_empty()
    }
}
