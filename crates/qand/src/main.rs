//! qand - query-analytics collector daemon.
//!
//! Samples per-statement counters from MySQL and PostgreSQL instances,
//! computes interval deltas and emits them as JSON-lines log batches on
//! stdout for the downstream telemetry pipeline. Diagnostics go to stderr.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use qan_core::adaptive::AdaptiveGovernor;
use qan_core::collector::mysql::{MysqlFetcher, MysqlLoadProbe};
use qan_core::collector::postgres::PostgresFetcher;
use qan_core::collector::{MysqlQan, PostgresQan};
use qan_core::config::{AdaptiveConfig, Config, IntervalSpec, MysqlConfig, PostgresConfig};
use qan_core::error::CollectError;
use qan_core::logs::{LogBatch, LogsSink};
use qan_core::scheduler::{PollMode, Scheduler};
use qan_core::store::SnapshotStore;

/// Query-analytics collector daemon.
#[derive(Parser)]
#[command(name = "qand", about = "Query-analytics collector daemon", version)]
struct Args {
    /// Enable MySQL collection.
    #[arg(long)]
    mysql: bool,

    /// MySQL target in host:port form.
    #[arg(long, default_value = "127.0.0.1:3306")]
    mysql_endpoint: String,

    /// MySQL username.
    #[arg(long, default_value = "root")]
    mysql_username: String,

    /// MySQL password.
    #[arg(long, env = "MYSQL_PWD", default_value = "", hide_env_values = true)]
    mysql_password: String,

    /// MySQL database for the connection.
    #[arg(long, default_value = "information_schema")]
    mysql_database: String,

    /// MySQL collection interval: whole seconds or "adaptive".
    #[arg(long, default_value = "10")]
    mysql_interval: IntervalSpec,

    /// Force adaptive MySQL polling regardless of --mysql-interval.
    #[arg(long)]
    mysql_adaptive: bool,

    /// Governor base interval in seconds (adaptive mode).
    #[arg(long, default_value = "1")]
    mysql_base_interval: u64,

    /// Directory for governor state persistence. Unset disables it.
    #[arg(long, value_name = "PATH")]
    mysql_state_dir: Option<PathBuf>,

    /// Enable PostgreSQL collection.
    #[arg(long)]
    postgres: bool,

    /// PostgreSQL target in host:port form.
    #[arg(long, default_value = "127.0.0.1:5432")]
    postgres_endpoint: String,

    /// PostgreSQL username.
    #[arg(long, default_value = "postgres")]
    postgres_username: String,

    /// PostgreSQL password.
    #[arg(long, env = "PGPASSWORD", default_value = "", hide_env_values = true)]
    postgres_password: String,

    /// PostgreSQL database.
    #[arg(long, default_value = "postgres")]
    postgres_database: String,

    /// PostgreSQL collection interval in seconds.
    #[arg(long, default_value = "10")]
    postgres_interval: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            mysql: MysqlConfig {
                enabled: self.mysql,
                endpoint: self.mysql_endpoint,
                username: self.mysql_username,
                password: self.mysql_password,
                database: self.mysql_database,
                collection_interval: self.mysql_interval,
                adaptive: AdaptiveConfig {
                    enabled: self.mysql_adaptive,
                    base_interval: self.mysql_base_interval,
                    state_directory: self.mysql_state_dir,
                },
            },
            postgresql: PostgresConfig {
                enabled: self.postgres,
                endpoint: self.postgres_endpoint,
                username: self.postgres_username,
                password: self.postgres_password,
                database: self.postgres_database,
                collection_interval: self.postgres_interval,
            },
        }
    }
}

/// Initializes the tracing subscriber on stderr; stdout carries batches.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("qand={}", level).parse().unwrap())
        .add_directive(format!("qan_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Serializes each batch as one JSON line on stdout.
struct JsonLinesSink;

#[async_trait]
impl LogsSink for JsonLinesSink {
    async fn consume(&self, batch: LogBatch) -> Result<(), CollectError> {
        let line =
            serde_json::to_string(&batch).map_err(|e| CollectError::Sink(e.to_string()))?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", line).map_err(|e| CollectError::Sink(e.to_string()))?;
        Ok(())
    }
}

async fn build_mysql_scheduler(
    cfg: &MysqlConfig,
    sink: Arc<dyn LogsSink>,
    shutdown: &CancellationToken,
) -> Result<Scheduler, CollectError> {
    let fetcher =
        MysqlFetcher::connect(&cfg.endpoint, &cfg.username, &cfg.password, &cfg.database).await?;

    let mode = if cfg.adaptive_mode() {
        info!(
            endpoint = %cfg.endpoint,
            base_interval_secs = cfg.base_interval().as_secs(),
            state_dir = ?cfg.adaptive.state_dir(),
            "MySQL collection uses adaptive polling"
        );
        let probe = MysqlLoadProbe::new(fetcher.pool().clone());
        let governor = AdaptiveGovernor::new(cfg.base_interval(), cfg.adaptive.state_dir());
        PollMode::Adaptive {
            governor,
            probe: Box::new(probe),
        }
    } else {
        let period = match cfg.collection_interval {
            IntervalSpec::Fixed(secs) => Duration::from_secs(secs),
            IntervalSpec::Adaptive => cfg.base_interval(),
        };
        info!(
            endpoint = %cfg.endpoint,
            interval_secs = period.as_secs(),
            "MySQL collection uses fixed interval"
        );
        PollMode::Fixed(period)
    };

    let store = Arc::new(SnapshotStore::new());
    Ok(Scheduler::new(
        MysqlQan::new(fetcher, store),
        sink,
        mode,
        shutdown,
    ))
}

async fn build_postgres_scheduler(
    cfg: &PostgresConfig,
    sink: Arc<dyn LogsSink>,
    shutdown: &CancellationToken,
) -> Result<Scheduler, CollectError> {
    let fetcher =
        PostgresFetcher::connect(&cfg.endpoint, &cfg.username, &cfg.password, &cfg.database)
            .await?;

    info!(
        endpoint = %cfg.endpoint,
        interval_secs = cfg.collection_interval,
        "PostgreSQL collection uses fixed interval"
    );

    let store = Arc::new(SnapshotStore::new());
    Ok(Scheduler::new(
        PostgresQan::new(fetcher, store),
        sink,
        PollMode::Fixed(Duration::from_secs(cfg.collection_interval)),
        shutdown,
    ))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = args.into_config();
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }
    if !config.mysql.enabled && !config.postgresql.enabled {
        error!("no collection targets enabled, pass --mysql and/or --postgres");
        std::process::exit(1);
    }

    info!("qand {} starting", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let sink: Arc<dyn LogsSink> = Arc::new(JsonLinesSink);
    let mut schedulers = Vec::new();

    if config.mysql.enabled {
        match build_mysql_scheduler(&config.mysql, sink.clone(), &shutdown).await {
            Ok(scheduler) => schedulers.push(scheduler),
            Err(e) => {
                error!(endpoint = %config.mysql.endpoint, error = %e, "MySQL setup failed");
                std::process::exit(1);
            }
        }
    }

    if config.postgresql.enabled {
        match build_postgres_scheduler(&config.postgresql, sink.clone(), &shutdown).await {
            Ok(scheduler) => schedulers.push(scheduler),
            Err(e) => {
                error!(endpoint = %config.postgresql.endpoint, error = %e, "PostgreSQL setup failed");
                std::process::exit(1);
            }
        }
    }

    for scheduler in &mut schedulers {
        scheduler.start();
    }
    info!(instances = schedulers.len(), "collection started");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    shutdown.cancel();
    for scheduler in &mut schedulers {
        scheduler.stop().await;
    }

    info!("shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_map_onto_config() {
        let args = Args::parse_from([
            "qand",
            "--mysql",
            "--mysql-endpoint",
            "db1:3306",
            "--mysql-interval",
            "adaptive",
            "--mysql-state-dir",
            "/var/lib/qan",
            "--postgres",
            "--postgres-interval",
            "30",
        ]);
        let config = args.into_config();

        assert!(config.mysql.enabled);
        assert!(config.mysql.adaptive_mode());
        assert_eq!(config.mysql.endpoint, "db1:3306");
        assert_eq!(
            config.mysql.adaptive.state_dir(),
            Some(PathBuf::from("/var/lib/qan"))
        );
        assert!(config.postgresql.enabled);
        assert_eq!(config.postgresql.collection_interval, 30);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_malformed_interval() {
        let result = Args::try_parse_from(["qand", "--mysql-interval", "soon"]);
        assert!(result.is_err());
    }
}
