//! Per-instance collection scheduler.
//!
//! Each configured instance gets one worker task driving
//! fetch -> delta -> build -> sink on a timer. The worker performs an
//! immediate first tick, then waits on the earliest of: the rearm timer, an
//! interval-change notification from the governor, or cancellation. Ticks
//! are single-flighted and bounded by a 30 second deadline that also
//! cancels in-flight database I/O.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adaptive::{AdaptiveGovernor, LoadProbe};
use crate::collector::QanCollector;
use crate::error::CollectError;
use crate::logs::LogsSink;

/// Upper bound on one tick's database work and delivery.
pub const TICK_DEADLINE: Duration = Duration::from_secs(30);

/// Lifecycle of a scheduler. `Stopped` is terminal: construct a new
/// scheduler instead of restarting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

fn decode_state(v: u8) -> SchedulerState {
    match v {
        0 => SchedulerState::Idle,
        1 => SchedulerState::Running,
        2 => SchedulerState::Stopping,
        _ => SchedulerState::Stopped,
    }
}

/// How the worker picks the delay before the next tick.
pub enum PollMode {
    Fixed(Duration),
    Adaptive {
        governor: AdaptiveGovernor,
        probe: Box<dyn LoadProbe>,
    },
}

/// Outcome of one tick, handed to the optional per-tick callback.
#[derive(Debug)]
pub struct TickReport {
    pub instance_id: String,
    pub records: usize,
    pub error: Option<CollectError>,
}

pub type TickCallback = Box<dyn Fn(&TickReport) + Send + Sync>;

struct Pending {
    collector: Box<dyn QanCollector>,
    sink: Arc<dyn LogsSink>,
    mode: PollMode,
    on_tick: Option<TickCallback>,
}

/// Owns one instance's worker task.
pub struct Scheduler {
    instance_id: String,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    pending: Option<Pending>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Builds a scheduler for one collector. `shutdown` is the outer
    /// shutdown signal; cancelling it has the same effect as [`stop`].
    ///
    /// [`stop`]: Scheduler::stop
    pub fn new(
        collector: impl QanCollector + 'static,
        sink: Arc<dyn LogsSink>,
        mode: PollMode,
        shutdown: &CancellationToken,
    ) -> Self {
        let instance_id = collector.instance_id().to_string();
        Self {
            instance_id,
            state: Arc::new(AtomicU8::new(SchedulerState::Idle as u8)),
            cancel: shutdown.child_token(),
            pending: Some(Pending {
                collector: Box::new(collector),
                sink,
                mode,
                on_tick: None,
            }),
            handle: None,
        }
    }

    /// Registers a callback invoked after every tick with its outcome.
    pub fn with_tick_callback(mut self, cb: impl Fn(&TickReport) + Send + Sync + 'static) -> Self {
        if let Some(pending) = &mut self.pending {
            pending.on_tick = Some(Box::new(cb));
        }
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn state(&self) -> SchedulerState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    /// Spawns the worker. Only valid from `Idle`; a stopped scheduler
    /// cannot be restarted.
    pub fn start(&mut self) {
        if self.state() != SchedulerState::Idle {
            warn!(
                instance = %self.instance_id,
                state = ?self.state(),
                "ignoring start on non-idle scheduler"
            );
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };

        self.state
            .store(SchedulerState::Running as u8, Ordering::SeqCst);
        self.handle = Some(tokio::spawn(run_worker(
            pending.collector,
            pending.sink,
            pending.mode,
            self.cancel.clone(),
            pending.on_tick,
            self.state.clone(),
        )));
    }

    /// Cancels the in-flight tick, waits for the worker to exit and closes
    /// the collector's database handles.
    pub async fn stop(&mut self) {
        match self.state() {
            SchedulerState::Running => {
                self.state
                    .store(SchedulerState::Stopping as u8, Ordering::SeqCst);
                self.cancel.cancel();
                if let Some(handle) = self.handle.take() {
                    let _ = handle.await;
                }
            }
            SchedulerState::Idle => {
                // Never started: release the prepared collector.
                if let Some(mut pending) = self.pending.take() {
                    pending.collector.close().await;
                }
                self.state
                    .store(SchedulerState::Stopped as u8, Ordering::SeqCst);
            }
            SchedulerState::Stopping | SchedulerState::Stopped => {}
        }
    }
}

async fn run_worker(
    mut collector: Box<dyn QanCollector>,
    sink: Arc<dyn LogsSink>,
    mut mode: PollMode,
    cancel: CancellationToken,
    on_tick: Option<TickCallback>,
    state: Arc<AtomicU8>,
) {
    // The governor rearms the timer through this channel whenever it
    // commits a new interval mid-sleep. The sender is kept alive here so
    // the fixed-interval path never observes a closed channel.
    let (rearm_tx, mut rearm_rx) = watch::channel(());
    let rearm_tx = Arc::new(rearm_tx);
    if let PollMode::Adaptive { governor, .. } = &mut mode {
        let tx = rearm_tx.clone();
        governor.set_interval_change(move |_| {
            let _ = tx.send(());
        });
    }

    info!(instance = collector.instance_id(), "scheduler worker started");

    loop {
        run_tick(collector.as_mut(), &sink, &mut mode, &cancel, on_tick.as_ref()).await;
        if cancel.is_cancelled() {
            break;
        }

        // Interval changes that landed during the tick are already
        // reflected in the delay computed below.
        rearm_rx.borrow_and_update();

        loop {
            let delay = match &mode {
                PollMode::Fixed(d) => *d,
                PollMode::Adaptive { governor, .. } => governor.request_interval(),
            };
            tokio::select! {
                _ = sleep(delay) => break,
                _ = rearm_rx.changed() => {
                    debug!(
                        instance = collector.instance_id(),
                        "collection interval changed, rearming timer"
                    );
                }
                _ = cancel.cancelled() => break,
            }
        }
        if cancel.is_cancelled() {
            break;
        }
    }

    state.store(SchedulerState::Stopping as u8, Ordering::SeqCst);
    collector.close().await;
    state.store(SchedulerState::Stopped as u8, Ordering::SeqCst);
    info!(instance = collector.instance_id(), "scheduler worker stopped");
}

async fn run_tick(
    collector: &mut dyn QanCollector,
    sink: &Arc<dyn LogsSink>,
    mode: &mut PollMode,
    cancel: &CancellationToken,
    on_tick: Option<&TickCallback>,
) {
    let instance_id = collector.instance_id().to_string();

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CollectError::Cancelled),
        res = timeout(TICK_DEADLINE, tick(collector, sink, mode)) => {
            res.unwrap_or(Err(CollectError::Deadline))
        }
    };

    match &outcome {
        Ok(records) => {
            debug!(instance = %instance_id, records, "tick completed");
        }
        Err(e) if e.is_shutdown() && cancel.is_cancelled() => {}
        Err(e) => {
            error!(instance = %instance_id, error = %e, "tick failed");
        }
    }

    if let Some(cb) = on_tick {
        let records = *outcome.as_ref().unwrap_or(&0);
        cb(&TickReport {
            instance_id,
            records,
            error: outcome.err(),
        });
    }
}

/// One collection cycle. The load probe runs first so the governor sees
/// fresh load even when the snapshot fails; probe failures only cost the
/// adaptation, never the tick.
async fn tick(
    collector: &mut dyn QanCollector,
    sink: &Arc<dyn LogsSink>,
    mode: &mut PollMode,
) -> Result<usize, CollectError> {
    if let PollMode::Adaptive { governor, probe } = mode {
        match probe.measure().await {
            Ok(load) => governor.update(load),
            Err(e) => warn!(error = %e, "load probe failed, keeping current interval"),
        }
    }

    let Some(batch) = collector.collect().await? else {
        return Ok(0);
    };

    let records = batch.records.len();
    if let Err(e) = sink.consume(batch).await {
        // At-most-once delivery: dropped batches are not retried.
        error!(error = %e, "failed to deliver batch");
    }
    Ok(records)
}
