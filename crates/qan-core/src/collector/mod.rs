//! Statement-counter fetchers and the per-tick collection pipeline.
//!
//! A [`Fetcher`] knows how to verify server prerequisites and materialize
//! one [`Snapshot`] per call. The pipeline types wrap a fetcher together
//! with the snapshot store and the family's delta/log-building functions
//! into a single `collect()` step driven by the scheduler.

pub mod mysql;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::delta;
use crate::error::CollectError;
use crate::logs::{self, LogBatch};
use crate::model::{MysqlStatementRow, PgStatementRow, Snapshot};
use crate::store::SnapshotStore;

/// Produces point-in-time snapshots for one database instance.
///
/// Preflight and I/O errors propagate unchanged; on failure the caller
/// discards the attempt and must not advance the snapshot store.
#[async_trait]
pub trait Fetcher: Send + Sync {
    type Row: Clone + Send + Sync + 'static;

    fn instance_id(&self) -> &str;

    /// Cheap per-call verification that the server exposes the required
    /// statistics (performance_schema consumers, pg_stat_statements).
    async fn preflight(&self) -> Result<(), CollectError>;

    /// Bulk-reads the statement catalog into a snapshot. The snapshot's
    /// wall clock is captured once, before rows are materialized.
    async fn snapshot(&self) -> Result<Snapshot<Self::Row>, CollectError>;

    /// Releases the underlying connections.
    async fn close(&self);
}

/// One collection step: fetch, swap the stored snapshot, diff, build.
///
/// Implemented per family so the scheduler stays family-agnostic.
#[async_trait]
pub trait QanCollector: Send {
    fn instance_id(&self) -> &str;

    /// Runs one collection cycle. `Ok(None)` means nothing to emit: either
    /// the first snapshot of the instance, or no statement saw activity.
    async fn collect(&mut self) -> Result<Option<LogBatch>, CollectError>;

    async fn close(&mut self);
}

/// MySQL collection pipeline over any digest-row fetcher.
pub struct MysqlQan<F: Fetcher<Row = MysqlStatementRow>> {
    fetcher: F,
    store: Arc<SnapshotStore<MysqlStatementRow>>,
}

impl<F: Fetcher<Row = MysqlStatementRow>> MysqlQan<F> {
    pub fn new(fetcher: F, store: Arc<SnapshotStore<MysqlStatementRow>>) -> Self {
        Self { fetcher, store }
    }
}

#[async_trait]
impl<F: Fetcher<Row = MysqlStatementRow>> QanCollector for MysqlQan<F> {
    fn instance_id(&self) -> &str {
        self.fetcher.instance_id()
    }

    async fn collect(&mut self) -> Result<Option<LogBatch>, CollectError> {
        self.fetcher.preflight().await?;
        let curr = Arc::new(self.fetcher.snapshot().await?);

        let prev = self.store.get(self.fetcher.instance_id());
        self.store.put(curr.clone());

        let Some(prev) = prev else {
            debug!(
                instance = self.fetcher.instance_id(),
                digests = curr.rows.len(),
                "first snapshot captured, deltas available on next cycle"
            );
            return Ok(None);
        };

        let records = delta::mysql_deltas(&prev, &curr);
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(logs::mysql_batch(self.fetcher.instance_id(), &records)))
    }

    async fn close(&mut self) {
        self.fetcher.close().await;
    }
}

/// PostgreSQL collection pipeline over any queryid-row fetcher.
pub struct PostgresQan<F: Fetcher<Row = PgStatementRow>> {
    fetcher: F,
    store: Arc<SnapshotStore<PgStatementRow>>,
}

impl<F: Fetcher<Row = PgStatementRow>> PostgresQan<F> {
    pub fn new(fetcher: F, store: Arc<SnapshotStore<PgStatementRow>>) -> Self {
        Self { fetcher, store }
    }
}

#[async_trait]
impl<F: Fetcher<Row = PgStatementRow>> QanCollector for PostgresQan<F> {
    fn instance_id(&self) -> &str {
        self.fetcher.instance_id()
    }

    async fn collect(&mut self) -> Result<Option<LogBatch>, CollectError> {
        self.fetcher.preflight().await?;
        let curr = Arc::new(self.fetcher.snapshot().await?);

        let prev = self.store.get(self.fetcher.instance_id());
        self.store.put(curr.clone());

        let Some(prev) = prev else {
            debug!(
                instance = self.fetcher.instance_id(),
                queries = curr.rows.len(),
                "first snapshot captured, deltas available on next cycle"
            );
            return Ok(None);
        };

        let records = delta::postgres_deltas(&prev, &curr);
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(logs::postgres_batch(
            self.fetcher.instance_id(),
            &records,
        )))
    }

    async fn close(&mut self) {
        self.fetcher.close().await;
    }
}

/// Splits a `host:port` endpoint, falling back to `default_port` when the
/// port is missing or unparsable.
pub(crate) fn split_endpoint(endpoint: &str, default_port: u16) -> (String, u16) {
    match endpoint.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (endpoint.to_string(), default_port),
        },
        None => (endpoint.to_string(), default_port),
    }
}

/// Scripted fetcher for pipeline and scheduler tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::model::DbSystem;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed sequence of MySQL snapshots; the last one repeats.
    pub(crate) struct ScriptedFetcher {
        instance: String,
        snaps: Mutex<VecDeque<Snapshot<MysqlStatementRow>>>,
    }

    impl ScriptedFetcher {
        pub(crate) fn new(rows_per_tick: Vec<Vec<(&str, u64, u64)>>) -> Self {
            let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
            let instance = crate::model::instance_id(DbSystem::Mysql, "db1:3306", "test");
            let snaps = rows_per_tick
                .into_iter()
                .enumerate()
                .map(|(i, rows)| {
                    let mut snap =
                        Snapshot::new(instance.clone(), base + Duration::seconds(10 * i as i64));
                    for (digest, calls, timer) in rows {
                        snap.rows.insert(
                            digest.to_string(),
                            MysqlStatementRow {
                                digest: digest.to_string(),
                                schema: "sbtest".to_string(),
                                sample: format!("SELECT {}", digest),
                                calls,
                                total_timer_wait: timer,
                                ..Default::default()
                            },
                        );
                    }
                    snap
                })
                .collect();
            Self {
                instance,
                snaps: Mutex::new(snaps),
            }
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        type Row = MysqlStatementRow;

        fn instance_id(&self) -> &str {
            &self.instance
        }

        async fn preflight(&self) -> Result<(), CollectError> {
            Ok(())
        }

        async fn snapshot(&self) -> Result<Snapshot<MysqlStatementRow>, CollectError> {
            let mut snaps = self.snaps.lock().unwrap();
            if snaps.len() > 1 {
                Ok(snaps.pop_front().unwrap())
            } else {
                // Keep replaying the final snapshot.
                snaps
                    .front()
                    .cloned()
                    .ok_or_else(|| CollectError::Query("script exhausted".to_string()))
            }
        }

        async fn close(&self) {}
    }
}
