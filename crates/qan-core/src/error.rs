//! Error type for QAN collection.

/// Error type for snapshot collection, delta emission and governor state.
#[derive(Debug)]
pub enum CollectError {
    /// A required server feature is disabled (performance_schema,
    /// statements_digest consumer, pg_stat_statements extension).
    /// Re-checked on every tick; never retried with backoff.
    Preflight(String),
    /// Transient database error during snapshot or load probe.
    Query(String),
    /// The downstream sink rejected a batch.
    Sink(String),
    /// Governor state read/write failure. Never fatal.
    State(String),
    /// The per-tick deadline expired.
    Deadline,
    /// The scheduler was stopped or the outer context cancelled.
    Cancelled,
}

impl CollectError {
    /// True for errors that are expected during shutdown and should not
    /// be logged when the stop signal is already set.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, CollectError::Deadline | CollectError::Cancelled)
    }
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::Preflight(msg) => write!(f, "preflight failed: {}", msg),
            CollectError::Query(msg) => write!(f, "query error: {}", msg),
            CollectError::Sink(msg) => write!(f, "sink error: {}", msg),
            CollectError::State(msg) => write!(f, "state file error: {}", msg),
            CollectError::Deadline => write!(f, "collection deadline exceeded"),
            CollectError::Cancelled => write!(f, "collection cancelled"),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<sqlx::Error> for CollectError {
    fn from(e: sqlx::Error) -> Self {
        CollectError::Query(e.to_string())
    }
}
