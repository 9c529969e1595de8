//! PostgreSQL statement collection via pg_stat_statements.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::Row as _;
use tracing::{debug, error, info};

use super::{split_endpoint, Fetcher};
use crate::error::CollectError;
use crate::model::{instance_id, DbSystem, PgStatementRow, Snapshot};

const DEFAULT_PORT: u16 = 5432;

// Identity columns are selected as text so a snapshot key is always a plain
// string, matching the digest key on the MySQL side.
const STATEMENTS_QUERY: &str = "\
SELECT
    queryid::text,
    userid::text,
    dbid::text,
    query,
    calls,
    total_plan_time,
    total_exec_time,
    rows,
    shared_blks_hit,
    shared_blks_read,
    shared_blks_dirtied,
    shared_blks_written,
    local_blks_hit,
    local_blks_read,
    local_blks_dirtied,
    local_blks_written,
    temp_blks_read,
    temp_blks_written,
    blk_read_time,
    blk_write_time
FROM pg_stat_statements";

const EXTENSION_QUERY: &str =
    "SELECT EXISTS(SELECT 1 FROM pg_extension WHERE extname = 'pg_stat_statements')";

/// Fetches pg_stat_statements snapshots from one PostgreSQL instance.
pub struct PostgresFetcher {
    pool: PgPool,
    instance: String,
}

impl PostgresFetcher {
    /// Opens a small connection pool and verifies it with a ping.
    /// Connection failure here is fatal for the scheduler being built.
    pub async fn connect(
        endpoint: &str,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, CollectError> {
        let (host, port) = split_endpoint(endpoint, DEFAULT_PORT);

        let options = PgConnectOptions::new()
            .host(&host)
            .port(port)
            .username(username)
            .password(password)
            .database(database);
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        info!(endpoint, database, "connected to PostgreSQL");
        Ok(Self {
            pool,
            instance: instance_id(DbSystem::Postgresql, endpoint, database),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Fetcher for PostgresFetcher {
    type Row = PgStatementRow;

    fn instance_id(&self) -> &str {
        &self.instance
    }

    async fn preflight(&self) -> Result<(), CollectError> {
        let row = sqlx::query(EXTENSION_QUERY).fetch_one(&self.pool).await?;
        let installed: bool = row.try_get(0)?;
        if !installed {
            return Err(CollectError::Preflight(
                "pg_stat_statements extension is not installed".to_string(),
            ));
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<Snapshot<PgStatementRow>, CollectError> {
        let rows = sqlx::query(STATEMENTS_QUERY).fetch_all(&self.pool).await?;

        let mut snapshot = Snapshot::new(self.instance.clone(), Utc::now());
        for row in &rows {
            match statement_row(row) {
                // Rows without a queryid carry no usable key.
                Ok(None) => continue,
                Ok(Some(parsed)) => {
                    snapshot.rows.insert(parsed.queryid.clone(), parsed);
                }
                Err(e) => {
                    error!(error = %e, "failed to scan pg_stat_statements row");
                }
            }
        }

        debug!(
            instance = %self.instance,
            queries = snapshot.rows.len(),
            "collected PostgreSQL snapshot"
        );
        Ok(snapshot)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn statement_row(row: &PgRow) -> Result<Option<PgStatementRow>, sqlx::Error> {
    let Some(queryid) = row.try_get::<Option<String>, _>("queryid")? else {
        return Ok(None);
    };

    Ok(Some(PgStatementRow {
        queryid,
        userid: row
            .try_get::<Option<String>, _>("userid")?
            .unwrap_or_default(),
        dbid: row.try_get::<Option<String>, _>("dbid")?.unwrap_or_default(),
        sample: row
            .try_get::<Option<String>, _>("query")?
            .unwrap_or_default(),
        calls: row.try_get("calls")?,
        total_plan_time: row.try_get("total_plan_time")?,
        total_exec_time: row.try_get("total_exec_time")?,
        rows: row.try_get("rows")?,
        shared_blks_hit: row.try_get("shared_blks_hit")?,
        shared_blks_read: row.try_get("shared_blks_read")?,
        shared_blks_dirtied: row.try_get("shared_blks_dirtied")?,
        shared_blks_written: row.try_get("shared_blks_written")?,
        local_blks_hit: row.try_get("local_blks_hit")?,
        local_blks_read: row.try_get("local_blks_read")?,
        local_blks_dirtied: row.try_get("local_blks_dirtied")?,
        local_blks_written: row.try_get("local_blks_written")?,
        temp_blks_read: row.try_get("temp_blks_read")?,
        temp_blks_written: row.try_get("temp_blks_written")?,
        blk_read_time: row.try_get("blk_read_time")?,
        blk_write_time: row.try_get("blk_write_time")?,
    }))
}
