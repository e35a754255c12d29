//! Scheduling, shutdown, and the watchdog
//!
//! Every worker in the process shares one [`StopFlag`]: an atomic read
//! for tight loops plus a broadcast channel to wake blocked waits. The
//! [`Scheduler`] owns the worker handles and turns the first
//! non-recoverable worker error into a raised stop flag; the
//! [`Watchdog`] samples pipeline states and progress and raises the flag
//! on a dead pipeline or a stall.

use crate::error::{Result, SiltError};
use crate::metrics::PipelineRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Process-wide cooperative stop signal.
#[derive(Clone)]
pub struct StopFlag {
    inner: Arc<StopInner>,
}

struct StopInner {
    raised: AtomicBool,
    tx: broadcast::Sender<()>,
}

impl StopFlag {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(StopInner {
                raised: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Raise the flag and wake every subscribed wait. Idempotent.
    pub fn raise(&self) {
        if !self.inner.raised.swap(true, Ordering::SeqCst) {
            info!("stop flag raised");
            let _ = self.inner.tx.send(());
        }
    }

    /// Non-blocking check for tight loops.
    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Wait until the flag is raised.
    pub async fn notified(&self) {
        let mut rx = self.inner.tx.subscribe();
        if self.is_raised() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns every spawned worker and propagates the first failure.
pub struct Scheduler {
    workers: JoinSet<Result<()>>,
    stop: StopFlag,
}

impl Scheduler {
    pub fn new(stop: StopFlag) -> Self {
        Self {
            workers: JoinSet::new(),
            stop,
        }
    }

    /// The set pipelines spawn their workers into.
    pub fn workers_mut(&mut self) -> &mut JoinSet<Result<()>> {
        &mut self.workers
    }

    /// Wait for every worker to finish.
    ///
    /// The first non-recoverable error raises the stop flag so its peers
    /// drain, and is returned once they have.
    pub async fn join(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(SiltError::WatchdogStop)) => {}
                Ok(Err(e)) => {
                    error!("worker failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    self.stop.raise();
                }
                Err(e) => {
                    error!("worker terminated abnormally: {e}");
                    if first_error.is_none() {
                        first_error = Some(SiltError::source(format!("worker panic: {e}")));
                    }
                    self.stop.raise();
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Periodically samples pipeline health.
///
/// Raises the global stop when a pipeline reached its terminal state
/// outside an orderly shutdown, or when work is in flight but no load
/// progress happened for the stall timeout.
pub struct Watchdog {
    registry: Arc<PipelineRegistry>,
    stop: StopFlag,
    interval: Duration,
    stall_timeout: Duration,
}

impl Watchdog {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        stop: StopFlag,
        interval: Duration,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            stop,
            interval,
            stall_timeout,
        }
    }

    pub async fn run(self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_progress = self.registry.progress();
        let mut last_change = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stop.notified() => return Ok(()),
            }

            let stopped = self.registry.stopped();
            if !stopped.is_empty() {
                error!(pipelines = ?stopped, "pipeline entered terminal state, stopping");
                self.stop.raise();
                return Err(SiltError::WatchdogStop);
            }

            let progress = self.registry.progress();
            if progress != last_progress {
                last_progress = progress;
                last_change = Instant::now();
            } else if self.registry.rows_in_flight() > 0
                && last_change.elapsed() >= self.stall_timeout
            {
                warn!(
                    in_flight = self.registry.rows_in_flight(),
                    stalled_secs = last_change.elapsed().as_secs(),
                    "no load progress with work in flight, stopping"
                );
                self.stop.raise();
                return Err(SiltError::WatchdogStop);
            }
        }
    }
}
