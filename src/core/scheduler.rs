//! Wall-clock aligned heartbeat that drives one beat per minute boundary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::clock::{epoch_minute, Clock, TimeAligner};
use crate::error::SchedulerError;
use crate::metrics::Metrics;

/// Work executed on each beat. Returns the number of failed units.
#[async_trait]
pub trait BeatHandler: Send + Sync {
    async fn on_beat(&self, beat: u64, tick: DateTime<Utc>, cancel: &CancellationToken) -> usize;
}

#[derive(Debug, Clone, Default)]
struct HeartbeatState {
    beats_executed: u64,
    beats_failed: u64,
    boundaries_skipped: u64,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    last_tick: Option<DateTime<Utc>>,
}

/// Counters exposed by [`HeartbeatScheduler::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatStats {
    pub beats_executed: u64,
    pub beats_failed: u64,
    pub boundaries_skipped: u64,
    pub uptime_seconds: i64,
    pub last_tick: Option<DateTime<Utc>>,
    pub running: bool,
}

/// Runs beats at `boundary + buffer` until stopped.
///
/// The next trigger is always recomputed from the clock after a beat, so a
/// slow beat shifts nothing; a boundary that passed while a beat was running
/// is skipped.
pub struct HeartbeatScheduler {
    aligner: TimeAligner,
    clock: Arc<dyn Clock>,
    handler: Arc<dyn BeatHandler>,
    grace: Duration,
    shutdown: CancellationToken,
    state: Arc<RwLock<HeartbeatState>>,
    metrics: Option<Arc<Metrics>>,
    handle: Arc<RwLock<Option<JoinHandle<Result<(), SchedulerError>>>>>,
}

impl HeartbeatScheduler {
    pub fn new(
        aligner: TimeAligner,
        clock: Arc<dyn Clock>,
        handler: Arc<dyn BeatHandler>,
        grace: Duration,
    ) -> Self {
        Self {
            aligner,
            clock,
            handler,
            grace,
            shutdown: CancellationToken::new(),
            state: Arc::new(RwLock::new(HeartbeatState::default())),
            metrics: None,
            handle: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Token cancelled when the scheduler shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the beat loop.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut handle = self.handle.write().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(SchedulerError::AlreadyRunning);
        }
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::Task("scheduler was already stopped".to_string()));
        }

        let beat_loop = BeatLoop {
            aligner: self.aligner,
            clock: self.clock.clone(),
            handler: self.handler.clone(),
            grace: self.grace,
            shutdown: self.shutdown.clone(),
            state: self.state.clone(),
            metrics: self.metrics.clone(),
        };
        *handle = Some(tokio::spawn(async move { beat_loop.run().await }));

        info!(
            target: "heartbeat",
            buffer_secs = self.aligner.buffer().num_seconds(),
            "HeartbeatScheduler: started"
        );
        Ok(())
    }

    /// Signal shutdown and wait for the loop. The current beat gets the grace
    /// period to finish; the loop itself enforces the cut-off.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.shutdown.cancel();
        let handle = self.handle.write().await.take();
        let Some(mut handle) = handle else {
            return Ok(());
        };

        let deadline = self.grace + Duration::from_secs(1);
        let result = match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SchedulerError::Task(e.to_string())),
            Err(_) => {
                warn!(target: "heartbeat", "HeartbeatScheduler: loop did not stop in time, aborting");
                handle.abort();
                Ok(())
            }
        };
        info!(target: "heartbeat", "HeartbeatScheduler: stopped");
        result
    }

    /// Wait until the loop exits on its own (shutdown or fatal error).
    pub async fn join(&self) -> Result<(), SchedulerError> {
        let handle = self.handle.write().await.take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| SchedulerError::Task(e.to_string()))?,
            None => Ok(()),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .read()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub async fn stats(&self) -> HeartbeatStats {
        let running = self.is_running().await;
        let state = self.state.read().await;
        let until = state.stopped_at.unwrap_or_else(|| self.clock.now());
        let uptime_seconds = state
            .started_at
            .map(|started| (until - started).num_seconds().max(0))
            .unwrap_or(0);
        HeartbeatStats {
            beats_executed: state.beats_executed,
            beats_failed: state.beats_failed,
            boundaries_skipped: state.boundaries_skipped,
            uptime_seconds,
            last_tick: state.last_tick,
            running,
        }
    }
}

struct BeatLoop {
    aligner: TimeAligner,
    clock: Arc<dyn Clock>,
    handler: Arc<dyn BeatHandler>,
    grace: Duration,
    shutdown: CancellationToken,
    state: Arc<RwLock<HeartbeatState>>,
    metrics: Option<Arc<Metrics>>,
}

impl BeatLoop {
    async fn run(self) -> Result<(), SchedulerError> {
        {
            let mut state = self.state.write().await;
            state.started_at = Some(self.clock.now());
            state.stopped_at = None;
        }
        let mut beat: u64 = 0;
        let mut last_tick: Option<DateTime<Utc>> = None;

        loop {
            let now = self.clock.now();
            let mut trigger = self.aligner.next_trigger(now)?;
            // Never run the same boundary twice.
            while last_tick.is_some_and(|t| epoch_minute(self.aligner.boundary_of(trigger)) <= epoch_minute(t)) {
                trigger += self.aligner.period();
            }

            if let Some(previous) = last_tick {
                let expected = previous + self.aligner.period();
                let tick = self.aligner.boundary_of(trigger);
                let skipped = (tick - expected).num_seconds() / self.aligner.period().num_seconds().max(1);
                if skipped > 0 {
                    warn!(
                        target: "heartbeat",
                        skipped,
                        previous = %previous,
                        next = %tick,
                        "previous beat overran, skipping {} boundaries",
                        skipped
                    );
                    self.state.write().await.boundaries_skipped += skipped as u64;
                }
            }

            let wait = (trigger - now).to_std().unwrap_or_default();
            debug!(target: "heartbeat", trigger = %trigger, wait_ms = wait.as_millis() as u64, "sleeping until next trigger");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let tick = self.aligner.boundary_of(trigger);
            beat += 1;
            let finished = self.beat(beat, tick).await;
            last_tick = Some(tick);

            let Some(failures) = finished else {
                break;
            };
            let mut state = self.state.write().await;
            state.beats_executed += 1;
            state.last_tick = Some(tick);
            if failures > 0 {
                state.beats_failed += 1;
            }
            drop(state);
            if let Some(metrics) = &self.metrics {
                metrics.beats_total.inc();
                if failures > 0 {
                    metrics.beats_failed_total.inc();
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }
        }

        self.state.write().await.stopped_at = Some(self.clock.now());
        info!(target: "heartbeat", beats = beat, "beat loop exited");
        Ok(())
    }

    /// Run one beat. `None` when shutdown cut it off after the grace period.
    ///
    /// The beat's token is separate from the shutdown token: a shutdown only
    /// starts the grace period, and the beat's units see cancellation once
    /// it has run out.
    async fn beat(&self, beat: u64, tick: DateTime<Utc>) -> Option<usize> {
        let cancel = CancellationToken::new();
        let work = self.handler.on_beat(beat, tick, &cancel);
        tokio::pin!(work);

        tokio::select! {
            failures = &mut work => Some(failures),
            _ = self.shutdown.cancelled() => {
                info!(target: "heartbeat", beat, grace_secs = self.grace.as_secs(), "shutdown requested mid-beat, waiting up to grace period");
                match tokio::time::timeout(self.grace, &mut work).await {
                    Ok(failures) => Some(failures),
                    Err(_) => {
                        cancel.cancel();
                        error!(target: "heartbeat", beat, tick = %tick, "beat {} cut off after grace period", beat);
                        None
                    }
                }
            }
        }
    }
}
