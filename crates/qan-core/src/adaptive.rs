//! Adaptive polling governor.
//!
//! Tracks observed server load with a pair of exponentially-weighted moving
//! averages and maps the fast average onto a collection interval. The
//! scheduler only ever asks [`AdaptiveGovernor::request_interval`] and
//! registers a change callback, so the policy (thresholds, alpha values,
//! deadband) can be exercised against synthetic load sequences without a
//! database.
//!
//! Learned state survives restarts via a small JSON file written atomically
//! into the configured state directory.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CollectError;

/// Load above this starts exponential backoff of the interval.
pub const HIGH_LOAD_THRESHOLD: f64 = 0.7;
/// Load above this pins the interval at [`MAX_INTERVAL`].
pub const CRITICAL_LOAD_THRESHOLD: f64 = 0.9;

/// Alpha for the fast-reacting average.
pub const FAST_EMA_ALPHA: f64 = 0.3;
/// Alpha for the long-term trend average.
pub const SLOW_EMA_ALPHA: f64 = 0.05;

/// Lower bound for any collection interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(500);
/// Upper bound for any collection interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Default jitter fraction applied by [`AdaptiveGovernor::request_interval`].
pub const DEFAULT_JITTER_FRACTION: f64 = 0.1;

/// Name of the persisted state file inside the state directory.
pub const STATE_FILE_NAME: &str = "governor_state";

/// Interval changes smaller than this fraction of the current interval are
/// ignored to prevent timer churn.
const INTERVAL_DEADBAND: f64 = 0.1;
/// Minimum time between state-file writes, in seconds.
const PERSIST_EVERY_SECS: i64 = 60;
/// State files older than this are ignored on restore.
const STATE_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Source of a normalized server-load sample in `[0, 1]`.
///
/// Implementations own their previous reading; concurrent probes on the
/// same instance are not supported.
#[async_trait]
pub trait LoadProbe: Send {
    async fn measure(&mut self) -> Result<f64, CollectError>;
}

// ---------------------------------------------------------------------------
// EMA
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Default)]
struct EmaState {
    value: f64,
    initialized: bool,
}

/// Single-value exponentially-weighted moving average.
///
/// The first observation seeds the state; afterwards
/// `v <- v + alpha * (x - v)`. Safe for concurrent readers and one writer.
pub struct Ema {
    alpha: f64,
    state: RwLock<EmaState>,
}

impl Ema {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            state: RwLock::new(EmaState::default()),
        }
    }

    pub fn update(&self, x: f64) {
        let mut state = self.state.write().expect("ema lock poisoned");
        if !state.initialized {
            state.value = x;
            state.initialized = true;
            return;
        }
        state.value += self.alpha * (x - state.value);
    }

    pub fn value(&self) -> f64 {
        self.state.read().expect("ema lock poisoned").value
    }

    /// Overwrites the value directly; used for state restoration.
    pub fn set(&self, value: f64) {
        let mut state = self.state.write().expect("ema lock poisoned");
        state.value = value;
        state.initialized = true;
    }

    pub fn reset(&self) {
        *self.state.write().expect("ema lock poisoned") = EmaState::default();
    }
}

// ---------------------------------------------------------------------------
// Persisted state
// ---------------------------------------------------------------------------

/// On-disk form of the governor's learned state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GovernorState {
    pub fast_ema_value: f64,
    pub slow_ema_value: f64,
    pub interval_ns: u64,
    pub timestamp: DateTime<Utc>,
}

/// A state file counts as restorable only while its mtime is recent;
/// anything older reflects a long-dead process and is discarded.
pub(crate) fn state_is_fresh(modified: SystemTime, now: SystemTime) -> bool {
    match now.duration_since(modified) {
        Ok(age) => age <= STATE_MAX_AGE,
        // Modified in the future (clock skew): keep it.
        Err(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

type IntervalChangeFn = Box<dyn Fn(Duration) + Send + Sync>;

/// Maps observed load onto the MySQL collection interval.
pub struct AdaptiveGovernor {
    fast: Ema,
    slow: Ema,
    base_interval: Duration,
    /// Current interval in nanoseconds.
    current_ns: AtomicU64,
    jitter_fraction: f64,
    state_dir: Option<PathBuf>,
    last_persisted: Mutex<Option<DateTime<Utc>>>,
    on_change: Option<IntervalChangeFn>,
    rng: Mutex<SmallRng>,
}

impl AdaptiveGovernor {
    /// Creates a governor with `base_interval` clamped to
    /// `[MIN_INTERVAL, MAX_INTERVAL]`, restoring persisted state from
    /// `state_dir` when present and fresh.
    pub fn new(base_interval: Duration, state_dir: Option<PathBuf>) -> Self {
        let base_interval = base_interval.clamp(MIN_INTERVAL, MAX_INTERVAL);

        let governor = Self {
            fast: Ema::new(FAST_EMA_ALPHA),
            slow: Ema::new(SLOW_EMA_ALPHA),
            base_interval,
            current_ns: AtomicU64::new(base_interval.as_nanos() as u64),
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            state_dir,
            last_persisted: Mutex::new(None),
            on_change: None,
            rng: Mutex::new(SmallRng::from_entropy()),
        };
        governor.restore_state();
        governor
    }

    /// Sets the jitter fraction, clamped to `[0, 0.5]`.
    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 0.5);
        self
    }

    /// Registers the interval-change callback (builder form).
    pub fn with_interval_change(mut self, cb: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Box::new(cb));
        self
    }

    /// Registers the interval-change callback after construction.
    pub fn set_interval_change(&mut self, cb: impl Fn(Duration) + Send + Sync + 'static) {
        self.on_change = Some(Box::new(cb));
    }

    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    /// Current interval without jitter.
    pub fn raw_interval(&self) -> Duration {
        Duration::from_nanos(self.current_ns.load(Ordering::Relaxed))
    }

    pub fn fast_ema(&self) -> f64 {
        self.fast.value()
    }

    pub fn slow_ema(&self) -> f64 {
        self.slow.value()
    }

    /// Feeds a load observation in `[0, 1]` (clamped), adjusts the interval
    /// and periodically persists state.
    pub fn update(&self, load: f64) {
        let load = load.clamp(0.0, 1.0);

        self.fast.update(load);
        self.slow.update(load);

        debug!(
            load,
            fast_ema = self.fast.value(),
            slow_ema = self.slow.value(),
            "updated load metrics"
        );

        self.adjust_interval();

        let now = Utc::now();
        let mut last = self.last_persisted.lock().expect("persist lock poisoned");
        let due = last.map_or(true, |t| now - t > chrono::Duration::seconds(PERSIST_EVERY_SECS));
        if due {
            if let Err(e) = self.save_state() {
                warn!(error = %e, "failed to persist governor state");
            }
            *last = Some(now);
        }
    }

    fn adjust_interval(&self) {
        let fast = self.fast.value();
        let current = self.raw_interval();
        let candidate = candidate_interval(self.base_interval, fast);

        let relative_change = (candidate.as_secs_f64() - current.as_secs_f64()).abs()
            / current.as_secs_f64();
        if relative_change > INTERVAL_DEADBAND {
            info!(
                old_interval_ms = current.as_millis() as u64,
                new_interval_ms = candidate.as_millis() as u64,
                fast_ema = fast,
                slow_ema = self.slow.value(),
                "adjusting collection interval"
            );
            self.current_ns
                .store(candidate.as_nanos() as u64, Ordering::Relaxed);
            if let Some(cb) = &self.on_change {
                cb(candidate);
            }
        }
    }

    /// Current interval with uniform jitter of up to half the jitter
    /// fraction in either direction, floored at [`MIN_INTERVAL`].
    pub fn request_interval(&self) -> Duration {
        let current = self.raw_interval();
        if self.jitter_fraction <= 0.0 {
            return current;
        }

        let range = current.as_secs_f64() * self.jitter_fraction;
        let offset = {
            let mut rng = self.rng.lock().expect("rng lock poisoned");
            range * (rng.gen::<f64>() - 0.5)
        };
        Duration::from_secs_f64(current.as_secs_f64() + offset).max(MIN_INTERVAL)
    }

    /// Drops all learned state: clears both averages, restores the base
    /// interval, removes the state file and fires the change callback.
    pub fn reset(&self) {
        self.fast.reset();
        self.slow.reset();
        self.current_ns
            .store(self.base_interval.as_nanos() as u64, Ordering::Relaxed);
        *self.last_persisted.lock().expect("persist lock poisoned") = None;

        if let Some(dir) = &self.state_dir {
            let _ = fs::remove_file(dir.join(STATE_FILE_NAME));
        }

        if let Some(cb) = &self.on_change {
            cb(self.base_interval);
        }
    }

    /// Writes the current state atomically (temp file + rename). A missing
    /// state directory disables persistence.
    fn save_state(&self) -> Result<(), CollectError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };

        fs::create_dir_all(dir).map_err(|e| CollectError::State(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o755));
        }

        let state = GovernorState {
            fast_ema_value: self.fast.value(),
            slow_ema_value: self.slow.value(),
            interval_ns: self.current_ns.load(Ordering::Relaxed),
            timestamp: Utc::now(),
        };
        let data = serde_json::to_vec(&state).map_err(|e| CollectError::State(e.to_string()))?;

        let path = dir.join(STATE_FILE_NAME);
        let tmp = dir.join(format!("{}.tmp", STATE_FILE_NAME));
        fs::write(&tmp, &data).map_err(|e| CollectError::State(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644));
        }
        fs::rename(&tmp, &path).map_err(|e| CollectError::State(e.to_string()))?;

        debug!(path = %path.display(), "saved governor state");
        Ok(())
    }

    /// Restores state from disk if the file exists, parses, and is fresh.
    /// Any failure starts the governor cold.
    fn restore_state(&self) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        let path = dir.join(STATE_FILE_NAME);

        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => return,
        };
        match meta.modified() {
            Ok(modified) if state_is_fresh(modified, SystemTime::now()) => {}
            Ok(_) => {
                info!(path = %path.display(), "governor state file is stale, starting cold");
                return;
            }
            Err(_) => return,
        }

        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to read governor state");
                return;
            }
        };
        let state: GovernorState = match serde_json::from_slice(&data) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "malformed governor state, starting cold");
                return;
            }
        };

        self.fast.set(state.fast_ema_value);
        self.slow.set(state.slow_ema_value);
        let interval = Duration::from_nanos(state.interval_ns).clamp(MIN_INTERVAL, MAX_INTERVAL);
        self.current_ns
            .store(interval.as_nanos() as u64, Ordering::Relaxed);
        *self.last_persisted.lock().expect("persist lock poisoned") = Some(state.timestamp);

        info!(
            fast_ema = state.fast_ema_value,
            slow_ema = state.slow_ema_value,
            interval_ms = interval.as_millis() as u64,
            "restored governor state"
        );
    }
}

/// Load-to-interval policy over the fast average.
fn candidate_interval(base: Duration, fast: f64) -> Duration {
    if fast > CRITICAL_LOAD_THRESHOLD {
        MAX_INTERVAL
    } else if fast > HIGH_LOAD_THRESHOLD {
        let multiplier = 2f64.powf(fast / HIGH_LOAD_THRESHOLD - 1.0);
        let backed_off = base.as_secs_f64() * multiplier;
        Duration::from_secs_f64(backed_off.min(MAX_INTERVAL.as_secs_f64()))
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ema_first_observation_seeds_value() {
        let ema = Ema::new(0.3);
        ema.update(0.8);
        assert_eq!(ema.value(), 0.8);
    }

    #[test]
    fn ema_converges_towards_input() {
        let ema = Ema::new(0.3);
        ema.update(0.0);
        ema.update(1.0);
        assert!((ema.value() - 0.3).abs() < 1e-12);
        ema.update(1.0);
        assert!((ema.value() - 0.51).abs() < 1e-12);
    }

    #[test]
    fn candidate_interval_thresholds() {
        let base = Duration::from_secs(1);
        assert_eq!(candidate_interval(base, 0.0), base);
        assert_eq!(candidate_interval(base, 0.7), base);
        assert_eq!(candidate_interval(base, 0.95), MAX_INTERVAL);

        // Between the thresholds: base * 2^(fast/0.7 - 1).
        let mid = candidate_interval(base, 0.84);
        let expected = 2f64.powf(0.84 / 0.7 - 1.0);
        assert!((mid.as_secs_f64() - expected).abs() < 1e-9);

        // Large base saturates at the maximum.
        let big = Duration::from_secs(50);
        assert_eq!(candidate_interval(big, 0.89), MAX_INTERVAL);
    }

    #[test]
    fn low_load_keeps_base_interval() {
        let governor = AdaptiveGovernor::new(Duration::from_secs(1), None);
        for load in [0.1, 0.2, 0.3] {
            governor.update(load);
        }
        assert_eq!(governor.raw_interval(), Duration::from_secs(1));
    }

    #[test]
    fn sustained_critical_load_pins_max_interval_and_recovers() {
        let changes: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = changes.clone();
        let governor = AdaptiveGovernor::new(Duration::from_secs(1), None)
            .with_jitter_fraction(0.0)
            .with_interval_change(move |d| seen.lock().unwrap().push(d));

        for load in [0.1, 0.2, 0.3] {
            governor.update(load);
        }

        let mut rounds = 0;
        while governor.raw_interval() != MAX_INTERVAL {
            governor.update(0.95);
            rounds += 1;
            assert!(rounds < 50, "governor never reached MAX_INTERVAL");
        }
        assert_eq!(changes.lock().unwrap().last(), Some(&MAX_INTERVAL));

        let mut rounds = 0;
        while governor.raw_interval() != Duration::from_secs(1) {
            governor.update(0.0);
            rounds += 1;
            assert!(rounds < 100, "governor never recovered to base");
        }
        assert!(governor.fast_ema() <= HIGH_LOAD_THRESHOLD);
    }

    #[test]
    fn deadband_suppresses_small_changes() {
        let changes: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = changes.clone();
        let governor = AdaptiveGovernor::new(Duration::from_secs(1), None)
            .with_interval_change(move |d| seen.lock().unwrap().push(d));

        // Force the fast average right to the policy's knee: the candidate
        // stays within 10% of the current interval, so nothing commits.
        governor.fast.set(0.72);
        governor.adjust_interval();
        assert!(changes.lock().unwrap().is_empty());
        assert_eq!(governor.raw_interval(), Duration::from_secs(1));

        // Well past the deadband the commit happens exactly once per change.
        governor.fast.set(0.89);
        governor.adjust_interval();
        governor.adjust_interval();
        assert_eq!(changes.lock().unwrap().len(), 1);
    }

    #[test]
    fn interval_stays_within_bounds() {
        let governor = AdaptiveGovernor::new(Duration::from_millis(1), None);
        assert_eq!(governor.base_interval(), MIN_INTERVAL);
        assert!(governor.raw_interval() >= MIN_INTERVAL);

        for _ in 0..20 {
            governor.update(1.0);
            assert!(governor.raw_interval() <= MAX_INTERVAL);
            assert!(governor.request_interval() >= MIN_INTERVAL);
        }

        let governor = AdaptiveGovernor::new(Duration::from_secs(600), None);
        assert_eq!(governor.base_interval(), MAX_INTERVAL);
    }

    #[test]
    fn jitter_is_bounded_and_centered() {
        let governor =
            AdaptiveGovernor::new(Duration::from_secs(10), None).with_jitter_fraction(0.5);

        for _ in 0..200 {
            let d = governor.request_interval().as_secs_f64();
            assert!(d >= 7.5 && d <= 12.5, "jittered interval {} out of range", d);
        }
    }

    #[test]
    fn zero_jitter_returns_raw_interval() {
        let governor =
            AdaptiveGovernor::new(Duration::from_secs(3), None).with_jitter_fraction(0.0);
        assert_eq!(governor.request_interval(), Duration::from_secs(3));
    }

    #[test]
    fn jitter_fraction_is_capped() {
        let governor = AdaptiveGovernor::new(Duration::from_secs(1), None).with_jitter_fraction(0.9);
        assert_eq!(governor.jitter_fraction, 0.5);
        let governor =
            AdaptiveGovernor::new(Duration::from_secs(1), None).with_jitter_fraction(-1.0);
        assert_eq!(governor.jitter_fraction, 0.0);
    }

    #[test]
    fn state_round_trips_bitwise() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = Some(dir.path().to_path_buf());

        let governor = AdaptiveGovernor::new(Duration::from_secs(1), state_dir.clone());
        governor.update(0.37);
        governor.update(0.81);
        // First update persists immediately; force one more write so the
        // file reflects both observations.
        governor.save_state().unwrap();

        let fast = governor.fast_ema();
        let slow = governor.slow_ema();
        let interval = governor.raw_interval();

        let restored = AdaptiveGovernor::new(Duration::from_secs(1), state_dir);
        assert_eq!(restored.fast_ema(), fast);
        assert_eq!(restored.slow_ema(), slow);
        assert_eq!(restored.raw_interval(), interval);
    }

    #[test]
    fn malformed_state_starts_cold() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STATE_FILE_NAME), b"{not json").unwrap();

        let governor =
            AdaptiveGovernor::new(Duration::from_secs(2), Some(dir.path().to_path_buf()));
        assert_eq!(governor.raw_interval(), Duration::from_secs(2));
        assert_eq!(governor.fast_ema(), 0.0);
    }

    #[test]
    fn missing_state_dir_disables_persistence() {
        let governor = AdaptiveGovernor::new(Duration::from_secs(1), None);
        governor.update(0.5);
        assert!(governor.save_state().is_ok());
    }

    #[test]
    fn stale_state_is_rejected_by_mtime_cutoff() {
        let now = SystemTime::now();
        assert!(state_is_fresh(now, now));
        assert!(state_is_fresh(now - Duration::from_secs(59 * 60), now));
        assert!(!state_is_fresh(now - Duration::from_secs(61 * 60), now));
        // Clock skew: a file from the "future" still counts.
        assert!(state_is_fresh(now + Duration::from_secs(300), now));
    }

    #[test]
    fn restored_interval_is_clamped_to_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let state = GovernorState {
            fast_ema_value: 0.1,
            slow_ema_value: 0.1,
            interval_ns: 1, // far below MIN_INTERVAL
            timestamp: Utc::now(),
        };
        fs::write(
            dir.path().join(STATE_FILE_NAME),
            serde_json::to_vec(&state).unwrap(),
        )
        .unwrap();

        let governor =
            AdaptiveGovernor::new(Duration::from_secs(1), Some(dir.path().to_path_buf()));
        assert_eq!(governor.raw_interval(), MIN_INTERVAL);
    }

    #[test]
    fn reset_restores_base_and_removes_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let changes: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = changes.clone();
        let governor =
            AdaptiveGovernor::new(Duration::from_secs(1), Some(dir.path().to_path_buf()))
                .with_interval_change(move |d| seen.lock().unwrap().push(d));

        for _ in 0..20 {
            governor.update(1.0);
        }
        assert_eq!(governor.raw_interval(), MAX_INTERVAL);
        assert!(dir.path().join(STATE_FILE_NAME).exists());

        governor.reset();
        assert_eq!(governor.raw_interval(), Duration::from_secs(1));
        assert_eq!(governor.fast_ema(), 0.0);
        assert!(!dir.path().join(STATE_FILE_NAME).exists());
        assert_eq!(changes.lock().unwrap().last(), Some(&Duration::from_secs(1)));
    }

    #[test]
    fn state_file_is_written_without_leftover_temp() {
        let dir = tempfile::tempdir().unwrap();
        let governor =
            AdaptiveGovernor::new(Duration::from_secs(1), Some(dir.path().to_path_buf()));
        governor.update(0.4);

        assert!(dir.path().join(STATE_FILE_NAME).exists());
        assert!(!dir.path().join(format!("{}.tmp", STATE_FILE_NAME)).exists());

        let data = fs::read(dir.path().join(STATE_FILE_NAME)).unwrap();
        let state: GovernorState = serde_json::from_slice(&data).unwrap();
        assert_eq!(state.fast_ema_value, 0.4);
    }
}
