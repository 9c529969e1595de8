//! MySQL statement-digest collection via performance_schema.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row as _;
use tracing::{debug, error, info};

use super::{split_endpoint, Fetcher};
use crate::adaptive::LoadProbe;
use crate::error::CollectError;
use crate::model::{instance_id, DbSystem, MysqlStatementRow, Snapshot};

/// Database used for the connection when none is configured.
const DEFAULT_DATABASE: &str = "information_schema";
const DEFAULT_PORT: u16 = 3306;

const DIGEST_QUERY: &str = "\
SELECT
    SCHEMA_NAME,
    DIGEST,
    DIGEST_TEXT,
    COUNT_STAR,
    SUM_TIMER_WAIT,
    SUM_LOCK_TIME,
    SUM_ERRORS,
    SUM_WARNINGS,
    SUM_ROWS_AFFECTED,
    SUM_ROWS_SENT,
    SUM_ROWS_EXAMINED,
    SUM_CREATED_TMP_TABLES,
    SUM_CREATED_TMP_DISK_TABLES,
    SUM_SORT_ROWS,
    SUM_NO_INDEX_USED,
    SUM_NO_GOOD_INDEX_USED
FROM performance_schema.events_statements_summary_by_digest
WHERE SCHEMA_NAME IS NOT NULL";

const GLOBAL_STATUS_QUERY: &str = "\
SELECT VARIABLE_NAME, VARIABLE_VALUE
FROM performance_schema.global_status
WHERE VARIABLE_NAME IN (
    'Threads_running',
    'Threads_connected',
    'Questions',
    'Slow_queries',
    'Innodb_row_lock_time',
    'Uptime'
)";

/// Fetches statement-digest snapshots from one MySQL instance.
pub struct MysqlFetcher {
    pool: MySqlPool,
    instance: String,
}

impl MysqlFetcher {
    /// Opens a small connection pool and verifies it with a ping.
    /// Connection failure here is fatal for the scheduler being built.
    pub async fn connect(
        endpoint: &str,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, CollectError> {
        let database = if database.is_empty() {
            DEFAULT_DATABASE
        } else {
            database
        };
        let (host, port) = split_endpoint(endpoint, DEFAULT_PORT);

        let options = MySqlConnectOptions::new()
            .host(&host)
            .port(port)
            .username(username)
            .password(password)
            .database(database);
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        info!(endpoint, database, "connected to MySQL");
        Ok(Self {
            pool,
            instance: instance_id(DbSystem::Mysql, endpoint, database),
        })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl Fetcher for MysqlFetcher {
    type Row = MysqlStatementRow;

    fn instance_id(&self) -> &str {
        &self.instance
    }

    async fn preflight(&self) -> Result<(), CollectError> {
        let row = sqlx::query("SHOW VARIABLES LIKE 'performance_schema'")
            .fetch_optional(&self.pool)
            .await?;
        let status = match &row {
            Some(r) => r.try_get::<String, _>(1)?,
            None => "missing".to_string(),
        };
        if status != "ON" {
            return Err(CollectError::Preflight(format!(
                "performance_schema is not enabled (status: {})",
                status
            )));
        }

        let row = sqlx::query(
            "SELECT ENABLED FROM performance_schema.setup_consumers \
             WHERE NAME = 'statements_digest'",
        )
        .fetch_optional(&self.pool)
        .await?;
        let enabled = match &row {
            Some(r) => r.try_get::<String, _>(0)?,
            None => "missing".to_string(),
        };
        if enabled != "YES" {
            return Err(CollectError::Preflight(
                "statements_digest consumer is not enabled".to_string(),
            ));
        }

        Ok(())
    }

    async fn snapshot(&self) -> Result<Snapshot<MysqlStatementRow>, CollectError> {
        let rows = sqlx::query(DIGEST_QUERY).fetch_all(&self.pool).await?;

        let mut snapshot = Snapshot::new(self.instance.clone(), Utc::now());
        for row in &rows {
            match digest_row(row) {
                // Rows without a digest carry no usable key.
                Ok(None) => continue,
                Ok(Some(parsed)) => {
                    snapshot.rows.insert(parsed.digest.clone(), parsed);
                }
                Err(e) => {
                    error!(error = %e, "failed to scan digest row");
                }
            }
        }

        debug!(
            instance = %self.instance,
            digests = snapshot.rows.len(),
            "collected MySQL snapshot"
        );
        Ok(snapshot)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn digest_row(row: &MySqlRow) -> Result<Option<MysqlStatementRow>, sqlx::Error> {
    let Some(digest) = row.try_get::<Option<String>, _>("DIGEST")? else {
        return Ok(None);
    };

    Ok(Some(MysqlStatementRow {
        digest,
        schema: row
            .try_get::<Option<String>, _>("SCHEMA_NAME")?
            .unwrap_or_default(),
        sample: row
            .try_get::<Option<String>, _>("DIGEST_TEXT")?
            .unwrap_or_default(),
        calls: row.try_get("COUNT_STAR")?,
        total_timer_wait: row.try_get("SUM_TIMER_WAIT")?,
        lock_time: row.try_get("SUM_LOCK_TIME")?,
        errors: row.try_get("SUM_ERRORS")?,
        warnings: row.try_get("SUM_WARNINGS")?,
        rows_affected: row.try_get("SUM_ROWS_AFFECTED")?,
        rows_sent: row.try_get("SUM_ROWS_SENT")?,
        rows_examined: row.try_get("SUM_ROWS_EXAMINED")?,
        created_tmp_tables: row.try_get("SUM_CREATED_TMP_TABLES")?,
        created_tmp_disk_tables: row.try_get("SUM_CREATED_TMP_DISK_TABLES")?,
        sort_rows: row.try_get("SUM_SORT_ROWS")?,
        no_index_used: row.try_get("SUM_NO_INDEX_USED")?,
        no_good_index_used: row.try_get("SUM_NO_GOOD_INDEX_USED")?,
    }))
}

// ---------------------------------------------------------------------------
// Load probe
// ---------------------------------------------------------------------------

/// Server status counters used to estimate load.
#[derive(Clone, Debug, Default)]
struct ServerStatus {
    threads_running: i64,
    threads_connected: i64,
    questions: i64,
    slow_queries: i64,
    innodb_row_lock_time: i64,
    uptime: i64,
}

fn apply_status_var(status: &mut ServerStatus, name: &str, value: &str) {
    let parsed = value.trim().parse::<i64>().unwrap_or(0);
    match name {
        "Threads_running" => status.threads_running = parsed,
        "Threads_connected" => status.threads_connected = parsed,
        "Questions" => status.questions = parsed,
        "Slow_queries" => status.slow_queries = parsed,
        "Innodb_row_lock_time" => status.innodb_row_lock_time = parsed,
        "Uptime" => status.uptime = parsed,
        _ => {}
    }
}

/// Load estimate before any history exists: running/connected thread ratio.
fn initial_load(threads_running: i64, threads_connected: i64) -> f64 {
    if threads_connected <= 0 {
        return 0.0;
    }
    (threads_running as f64 / threads_connected as f64).clamp(0.0, 1.0)
}

/// Composite load over two consecutive readings. The thread ratio carries
/// most of the weight; slow queries as a share of total queries add the
/// rest.
fn diff_load(curr: &ServerStatus, prev: &ServerStatus) -> f64 {
    if curr.threads_connected <= 0 {
        return 0.0;
    }

    let thread_ratio =
        (curr.threads_running as f64 / curr.threads_connected as f64).min(1.0);
    let d_questions = curr.questions - prev.questions;
    let d_slow = curr.slow_queries - prev.slow_queries;
    let slow_ratio = (d_slow as f64 / d_questions.max(1) as f64).min(1.0);

    (0.7 * thread_ratio + 0.3 * slow_ratio).clamp(0.0, 1.0)
}

/// Reads MySQL global status and turns it into a normalized load in
/// `[0, 1]`. Owns the previous reading; one probe per instance.
pub struct MysqlLoadProbe {
    pool: MySqlPool,
    last: Option<ServerStatus>,
}

impl MysqlLoadProbe {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool, last: None }
    }
}

#[async_trait]
impl LoadProbe for MysqlLoadProbe {
    async fn measure(&mut self) -> Result<f64, CollectError> {
        let rows = sqlx::query(GLOBAL_STATUS_QUERY).fetch_all(&self.pool).await?;

        let mut status = ServerStatus::default();
        for row in &rows {
            let name: String = row.try_get(0)?;
            let value: String = row.try_get(1)?;
            apply_status_var(&mut status, &name, &value);
        }

        let load = match &self.last {
            None => initial_load(status.threads_running, status.threads_connected),
            Some(prev) => diff_load(&status, prev),
        };

        debug!(
            threads_running = status.threads_running,
            threads_connected = status.threads_connected,
            row_lock_time_ms = status.innodb_row_lock_time,
            uptime_secs = status.uptime,
            load,
            "probed MySQL load"
        );

        self.last = Some(status);
        Ok(load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_status_var_parses_known_names() {
        let mut status = ServerStatus::default();
        apply_status_var(&mut status, "Threads_running", "12");
        apply_status_var(&mut status, "Threads_connected", "40");
        apply_status_var(&mut status, "Questions", "100000");
        apply_status_var(&mut status, "Slow_queries", "37");
        apply_status_var(&mut status, "Innodb_row_lock_time", "420");
        apply_status_var(&mut status, "Uptime", "86400");
        apply_status_var(&mut status, "Something_else", "99");

        assert_eq!(status.threads_running, 12);
        assert_eq!(status.threads_connected, 40);
        assert_eq!(status.questions, 100000);
        assert_eq!(status.slow_queries, 37);
        assert_eq!(status.innodb_row_lock_time, 420);
        assert_eq!(status.uptime, 86400);
    }

    #[test]
    fn apply_status_var_tolerates_garbage() {
        let mut status = ServerStatus::default();
        apply_status_var(&mut status, "Questions", "not-a-number");
        assert_eq!(status.questions, 0);
    }

    #[test]
    fn initial_load_is_thread_ratio() {
        assert_eq!(initial_load(5, 10), 0.5);
        assert_eq!(initial_load(0, 10), 0.0);
        // More running than connected is clamped.
        assert_eq!(initial_load(20, 10), 1.0);
        // No connections means no load signal.
        assert_eq!(initial_load(5, 0), 0.0);
    }

    #[test]
    fn diff_load_weights_threads_and_slow_queries() {
        let prev = ServerStatus {
            questions: 1000,
            slow_queries: 10,
            ..Default::default()
        };
        let curr = ServerStatus {
            threads_running: 5,
            threads_connected: 10,
            questions: 2000,
            slow_queries: 110,
            ..Default::default()
        };

        // thread_ratio = 0.5, slow_ratio = 100/1000 = 0.1
        let load = diff_load(&curr, &prev);
        assert!((load - (0.7 * 0.5 + 0.3 * 0.1)).abs() < 1e-12);
    }

    #[test]
    fn diff_load_caps_slow_ratio() {
        let prev = ServerStatus::default();
        let curr = ServerStatus {
            threads_running: 10,
            threads_connected: 10,
            questions: 1,
            slow_queries: 50,
            ..Default::default()
        };
        // Both components saturate at 1.0.
        assert_eq!(diff_load(&curr, &prev), 1.0);
    }

    #[test]
    fn diff_load_without_connections_is_zero() {
        let prev = ServerStatus::default();
        let curr = ServerStatus {
            threads_running: 3,
            threads_connected: 0,
            ..Default::default()
        };
        assert_eq!(diff_load(&curr, &prev), 0.0);
    }
}
