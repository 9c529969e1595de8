//! Interval delta computation over statement-counter snapshots.
//!
//! This module is the single source of truth for turning two consecutive
//! snapshots of cumulative counters into per-interval delta records. Both
//! the MySQL and PostgreSQL paths use the same reset-aware subtraction:
//! a counter that went backwards is assumed to have been reset on the
//! server, and its current value is attributed to this interval.

use crate::model::{MysqlStatementRow, PgStatementRow, Snapshot};

// ---------------------------------------------------------------------------
// Reset-aware subtraction
// ---------------------------------------------------------------------------

/// u64 delta; on counter regression the current value is the delta.
pub fn du64(curr: u64, prev: u64) -> u64 {
    if curr >= prev { curr - prev } else { curr }
}

/// i64 delta; on counter regression the current value is the delta.
pub fn di64(curr: i64, prev: i64) -> i64 {
    if curr >= prev { curr - prev } else { curr }
}

/// f64 delta; on counter regression the current value is the delta.
pub fn df64(curr: f64, prev: f64) -> f64 {
    if curr >= prev { curr - prev } else { curr }
}

/// Seconds covered by the (prev, curr) pair. Falls back to 1.0 when the
/// clock did not advance so downstream rate divisions stay defined.
fn period_secs<R>(prev: &Snapshot<R>, curr: &Snapshot<R>) -> f64 {
    let dt = (curr.taken_at - prev.taken_at).num_milliseconds() as f64 / 1000.0;
    if dt <= 0.0 { 1.0 } else { dt }
}

// ---------------------------------------------------------------------------
// Delta records
// ---------------------------------------------------------------------------

/// Per-interval deltas for one MySQL statement digest.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MysqlDelta {
    pub digest: String,
    pub schema: String,
    pub sample: String,
    pub time_period_secs: f64,
    pub calls: u64,
    pub total_timer_wait: u64,
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

/// Per-interval deltas for one PostgreSQL queryid.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PgDelta {
    pub queryid: String,
    pub userid: String,
    pub dbid: String,
    pub sample: String,
    pub time_period_secs: f64,
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

// ---------------------------------------------------------------------------
// MySQL diff
// ---------------------------------------------------------------------------

/// Computes delta records between two MySQL snapshots of the same instance.
///
/// A digest absent from `prev` is treated as new: its current counters are
/// the deltas. Digests absent from `curr` fell out of the server's digest
/// table and are dropped. Only digests with a positive calls delta are
/// emitted. Output order is unspecified.
pub fn mysql_deltas(
    prev: &Snapshot<MysqlStatementRow>,
    curr: &Snapshot<MysqlStatementRow>,
) -> Vec<MysqlDelta> {
    let dt = period_secs(prev, curr);
    let mut out = Vec::new();

    for (digest, row) in &curr.rows {
        let delta = match prev.rows.get(digest) {
            None => MysqlDelta {
                digest: row.digest.clone(),
                schema: row.schema.clone(),
                sample: row.sample.clone(),
                time_period_secs: dt,
                calls: row.calls,
                total_timer_wait: row.total_timer_wait,
                lock_time: row.lock_time,
                errors: row.errors,
                warnings: row.warnings,
                rows_affected: row.rows_affected,
                rows_sent: row.rows_sent,
                rows_examined: row.rows_examined,
                created_tmp_tables: row.created_tmp_tables,
                created_tmp_disk_tables: row.created_tmp_disk_tables,
                sort_rows: row.sort_rows,
                no_index_used: row.no_index_used,
                no_good_index_used: row.no_good_index_used,
            },
            Some(p) => MysqlDelta {
                digest: row.digest.clone(),
                schema: row.schema.clone(),
                sample: row.sample.clone(),
                time_period_secs: dt,
                calls: du64(row.calls, p.calls),
                total_timer_wait: du64(row.total_timer_wait, p.total_timer_wait),
                lock_time: du64(row.lock_time, p.lock_time),
                errors: du64(row.errors, p.errors),
                warnings: du64(row.warnings, p.warnings),
                rows_affected: du64(row.rows_affected, p.rows_affected),
                rows_sent: du64(row.rows_sent, p.rows_sent),
                rows_examined: du64(row.rows_examined, p.rows_examined),
                created_tmp_tables: du64(row.created_tmp_tables, p.created_tmp_tables),
                created_tmp_disk_tables: du64(
                    row.created_tmp_disk_tables,
                    p.created_tmp_disk_tables,
                ),
                sort_rows: du64(row.sort_rows, p.sort_rows),
                no_index_used: du64(row.no_index_used, p.no_index_used),
                no_good_index_used: du64(row.no_good_index_used, p.no_good_index_used),
            },
        };

        // Digests with no execution activity in the interval produce no output.
        if delta.calls > 0 {
            out.push(delta);
        }
    }

    out
}

// ---------------------------------------------------------------------------
// PostgreSQL diff
// ---------------------------------------------------------------------------

/// Computes delta records between two PostgreSQL snapshots of the same
/// instance. Same policy as [`mysql_deltas`].
pub fn postgres_deltas(
    prev: &Snapshot<PgStatementRow>,
    curr: &Snapshot<PgStatementRow>,
) -> Vec<PgDelta> {
    let dt = period_secs(prev, curr);
    let mut out = Vec::new();

    for (queryid, row) in &curr.rows {
        let delta = match prev.rows.get(queryid) {
            None => PgDelta {
                queryid: row.queryid.clone(),
                userid: row.userid.clone(),
                dbid: row.dbid.clone(),
                sample: row.sample.clone(),
                time_period_secs: dt,
                calls: row.calls,
                total_plan_time: row.total_plan_time,
                total_exec_time: row.total_exec_time,
                rows: row.rows,
                shared_blks_hit: row.shared_blks_hit,
                shared_blks_read: row.shared_blks_read,
                shared_blks_dirtied: row.shared_blks_dirtied,
                shared_blks_written: row.shared_blks_written,
                local_blks_hit: row.local_blks_hit,
                local_blks_read: row.local_blks_read,
                local_blks_dirtied: row.local_blks_dirtied,
                local_blks_written: row.local_blks_written,
                temp_blks_read: row.temp_blks_read,
                temp_blks_written: row.temp_blks_written,
                blk_read_time: row.blk_read_time,
                blk_write_time: row.blk_write_time,
            },
            Some(p) => PgDelta {
                queryid: row.queryid.clone(),
                userid: row.userid.clone(),
                dbid: row.dbid.clone(),
                sample: row.sample.clone(),
                time_period_secs: dt,
                calls: di64(row.calls, p.calls),
                total_plan_time: df64(row.total_plan_time, p.total_plan_time),
                total_exec_time: df64(row.total_exec_time, p.total_exec_time),
                rows: di64(row.rows, p.rows),
                shared_blks_hit: di64(row.shared_blks_hit, p.shared_blks_hit),
                shared_blks_read: di64(row.shared_blks_read, p.shared_blks_read),
                shared_blks_dirtied: di64(row.shared_blks_dirtied, p.shared_blks_dirtied),
                shared_blks_written: di64(row.shared_blks_written, p.shared_blks_written),
                local_blks_hit: di64(row.local_blks_hit, p.local_blks_hit),
                local_blks_read: di64(row.local_blks_read, p.local_blks_read),
                local_blks_dirtied: di64(row.local_blks_dirtied, p.local_blks_dirtied),
                local_blks_written: di64(row.local_blks_written, p.local_blks_written),
                temp_blks_read: di64(row.temp_blks_read, p.temp_blks_read),
                temp_blks_written: di64(row.temp_blks_written, p.temp_blks_written),
                blk_read_time: df64(row.blk_read_time, p.blk_read_time),
                blk_write_time: df64(row.blk_write_time, p.blk_write_time),
            },
        };

        if delta.calls > 0 {
            out.push(delta);
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
