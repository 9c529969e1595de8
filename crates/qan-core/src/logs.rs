//! Log batch construction for delta records.
//!
//! Delta records are mapped to one resource-scoped batch per tick with a
//! stable attribute key set per database family. The transport behind
//! [`LogsSink`] is out of scope here; the daemon ships a JSON-lines sink and
//! production deployments plug in an OTLP exporter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::delta::{MysqlDelta, PgDelta};
use crate::error::CollectError;
use crate::model::DbSystem;

/// `service.name` resource attribute on every batch.
pub const SERVICE_NAME: &str = "obsidian-core";
/// Instrumentation scope name on every batch.
pub const SCOPE_NAME: &str = "qanprocessor";
/// OTel severity number for INFO.
const SEVERITY_INFO: i32 = 9;

/// Attribute value; statement counters are integers, timing counters and
/// the interval length are doubles.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Double(f64),
}

/// Ordered attribute set serialized as a JSON object.
#[derive(Clone, Debug, Default)]
pub struct AttrMap(pub Vec<(&'static str, AttrValue)>);

impl AttrMap {
    fn push_str(&mut self, key: &'static str, value: impl Into<String>) {
        self.0.push((key, AttrValue::Str(value.into())));
    }

    fn push_int(&mut self, key: &'static str, value: i64) {
        self.0.push((key, AttrValue::Int(value)));
    }

    fn push_double(&mut self, key: &'static str, value: f64) {
        self.0.push((key, AttrValue::Double(value)));
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

impl Serialize for AttrMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// One log record per delta record.
#[derive(Clone, Debug, Serialize)]
pub struct LogRecord {
    /// Wall clock at emission (end of the aggregation interval).
    pub observed_at: DateTime<Utc>,
    pub severity_number: i32,
    pub severity_text: &'static str,
    /// The statement sample text, passed through verbatim.
    pub body: String,
    pub attributes: AttrMap,
}

/// Resource-level attributes shared by every record in a batch.
#[derive(Clone, Debug, Serialize)]
pub struct ResourceAttrs {
    #[serde(rename = "service.name")]
    pub service_name: &'static str,
    #[serde(rename = "db.system")]
    pub db_system: &'static str,
    #[serde(rename = "resource.instance.id")]
    pub instance_id: String,
}

/// A resource-scoped batch of log records for one instance and one tick.
#[derive(Clone, Debug, Serialize)]
pub struct LogBatch {
    pub resource: ResourceAttrs,
    pub scope: &'static str,
    pub records: Vec<LogRecord>,
}

impl LogBatch {
    fn new(system: DbSystem, instance_id: &str) -> Self {
        Self {
            resource: ResourceAttrs {
                service_name: SERVICE_NAME,
                db_system: system.as_str(),
                instance_id: instance_id.to_string(),
            },
            scope: SCOPE_NAME,
            records: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Downstream consumer of built batches. Shared across scheduler workers,
/// so implementations must tolerate concurrent calls; ordering across
/// instances is not preserved.
#[async_trait]
pub trait LogsSink: Send + Sync {
    async fn consume(&self, batch: LogBatch) -> Result<(), CollectError>;
}

fn record(body: &str, attributes: AttrMap) -> LogRecord {
    LogRecord {
        observed_at: Utc::now(),
        severity_number: SEVERITY_INFO,
        severity_text: "INFO",
        body: body.to_string(),
        attributes,
    }
}

/// Builds a MySQL batch. Empty input yields an empty batch; callers should
/// not forward empty batches to the sink.
pub fn mysql_batch(instance_id: &str, records: &[MysqlDelta]) -> LogBatch {
    let mut batch = LogBatch::new(DbSystem::Mysql, instance_id);

    for d in records {
        let mut attrs = AttrMap::default();
        attrs.push_str("db.statement.digest", d.digest.clone());
        attrs.push_str("db.statement.sample", d.sample.clone());
        attrs.push_str("db.schema", d.schema.clone());
        attrs.push_int("db.query.calls.delta", d.calls as i64);
        attrs.push_int("db.query.total_timer_wait.delta", d.total_timer_wait as i64);
        attrs.push_int("db.query.lock_time.delta", d.lock_time as i64);
        attrs.push_int("db.query.errors.delta", d.errors as i64);
        attrs.push_int("db.query.warnings.delta", d.warnings as i64);
        attrs.push_int("db.query.rows_affected.delta", d.rows_affected as i64);
        attrs.push_int("db.query.rows_sent.delta", d.rows_sent as i64);
        attrs.push_int("db.query.rows_examined.delta", d.rows_examined as i64);
        attrs.push_int("db.query.created_tmp_tables.delta", d.created_tmp_tables as i64);
        attrs.push_int(
            "db.query.created_tmp_disk_tables.delta",
            d.created_tmp_disk_tables as i64,
        );
        attrs.push_int("db.query.sort_rows.delta", d.sort_rows as i64);
        attrs.push_int("db.query.no_index_used.delta", d.no_index_used as i64);
        attrs.push_int("db.query.no_good_index_used.delta", d.no_good_index_used as i64);
        attrs.push_double("db.query.time_period_seconds", d.time_period_secs);

        batch.records.push(record(&d.sample, attrs));
    }

    batch
}

/// Builds a PostgreSQL batch. `db.query.rows_examined.delta` mirrors
/// `db.query.rows.delta` so both families expose the same key.
pub fn postgres_batch(instance_id: &str, records: &[PgDelta]) -> LogBatch {
    let mut batch = LogBatch::new(DbSystem::Postgresql, instance_id);

    for d in records {
        let mut attrs = AttrMap::default();
        attrs.push_str("db.query.id", d.queryid.clone());
        attrs.push_str("db.statement.sample", d.sample.clone());
        attrs.push_str("db.user.id", d.userid.clone());
        attrs.push_str("db.name.id", d.dbid.clone());
        attrs.push_int("db.query.calls.delta", d.calls);
        attrs.push_double("db.query.total_plan_time.delta", d.total_plan_time);
        attrs.push_double("db.query.total_exec_time.delta", d.total_exec_time);
        attrs.push_int("db.query.rows.delta", d.rows);
        attrs.push_int("db.query.shared_blks_hit.delta", d.shared_blks_hit);
        attrs.push_int("db.query.shared_blks_read.delta", d.shared_blks_read);
        attrs.push_int("db.query.shared_blks_dirtied.delta", d.shared_blks_dirtied);
        attrs.push_int("db.query.shared_blks_written.delta", d.shared_blks_written);
        attrs.push_int("db.query.local_blks_hit.delta", d.local_blks_hit);
        attrs.push_int("db.query.local_blks_read.delta", d.local_blks_read);
        attrs.push_int("db.query.local_blks_dirtied.delta", d.local_blks_dirtied);
        attrs.push_int("db.query.local_blks_written.delta", d.local_blks_written);
        attrs.push_int("db.query.temp_blks_read.delta", d.temp_blks_read);
        attrs.push_int("db.query.temp_blks_written.delta", d.temp_blks_written);
        attrs.push_double("db.query.blk_read_time.delta", d.blk_read_time);
        attrs.push_double("db.query.blk_write_time.delta", d.blk_write_time);
        attrs.push_int("db.query.rows_examined.delta", d.rows);
        attrs.push_double("db.query.time_period_seconds", d.time_period_secs);

        batch.records.push(record(&d.sample, attrs));
    }

    batch
}
