//! Statement-level counter rows and point-in-time snapshots.
//!
//! Each database family has its own row type mirroring the columns of its
//! statistics relation. All counters are cumulative and non-decreasing on a
//! stable server; a decrease between two snapshots means the server reset
//! its counters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Database family a snapshot was taken from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbSystem {
    Mysql,
    Postgresql,
}

impl DbSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbSystem::Mysql => "mysql",
            DbSystem::Postgresql => "postgresql",
        }
    }
}

/// Builds the canonical instance identifier, used as the snapshot-store key
/// and as the `resource.instance.id` attribute.
pub fn instance_id(system: DbSystem, endpoint: &str, database: &str) -> String {
    format!("{}://{}/{}", system.as_str(), endpoint, database)
}

/// One row of `performance_schema.events_statements_summary_by_digest`.
///
/// Counter columns are BIGINT UNSIGNED on the wire, kept as `u64`.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MysqlStatementRow {
    /// Normalized statement digest hash. Unique key within a snapshot.
    pub digest: String,
    /// Schema name; empty when the server reports NULL.
    pub schema: String,
    /// Normalized statement sample text.
    pub sample: String,
    pub calls: u64,
    /// Total execution time in picoseconds.
    pub total_timer_wait: u64,
    /// Total lock wait time in picoseconds.
    pub lock_time: u64,
    pub errors: u64,
    pub warnings: u64,
    pub rows_affected: u64,
    pub rows_sent: u64,
    pub rows_examined: u64,
    pub created_tmp_tables: u64,
    pub created_tmp_disk_tables: u64,
    pub sort_rows: u64,
    pub no_index_used: u64,
    pub no_good_index_used: u64,
}

/// One row of `pg_stat_statements`.
///
/// `queryid`, `userid` and `dbid` are selected as text; timing counters are
/// milliseconds as reported by the extension.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PgStatementRow {
    /// Query identifier. Unique key within a snapshot.
    pub queryid: String,
    /// OID of the executing role; empty when the server reports NULL.
    pub userid: String,
    /// OID of the database; empty when the server reports NULL.
    pub dbid: String,
    /// Normalized statement text.
    pub sample: String,
    pub calls: i64,
    pub total_plan_time: f64,
    pub total_exec_time: f64,
    pub rows: i64,
    pub shared_blks_hit: i64,
    pub shared_blks_read: i64,
    pub shared_blks_dirtied: i64,
    pub shared_blks_written: i64,
    pub local_blks_hit: i64,
    pub local_blks_read: i64,
    pub local_blks_dirtied: i64,
    pub local_blks_written: i64,
    pub temp_blks_read: i64,
    pub temp_blks_written: i64,
    pub blk_read_time: f64,
    pub blk_write_time: f64,
}

/// Point-in-time materialization of all statement counters for one instance.
///
/// Immutable after publication: stored and passed around behind `Arc`.
/// All rows share the snapshot's `taken_at`; keys are unique.
#[derive(Clone, Debug)]
pub struct Snapshot<R> {
    pub instance_id: String,
    /// Wall clock captured once, before row materialization.
    pub taken_at: DateTime<Utc>,
    pub rows: HashMap<String, R>,
}

impl<R> Snapshot<R> {
    pub fn new(instance_id: impl Into<String>, taken_at: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.into(),
            taken_at,
            rows: HashMap::new(),
        }
    }
}
