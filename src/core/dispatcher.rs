//! Per-beat strategy dispatch.
//!
//! Due-ness is a pure function of the beat's epoch minute, so a restarted
//! process reproduces the same schedule without any persisted run ledger.
//! Each due strategy runs in its own task; a failure, panic or timeout in
//! one run is reported as a skipped run and never touches the others.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::core::clock::epoch_minute;
use crate::error::StrategyError;
use crate::metrics::Metrics;
use crate::models::Strategy;
use crate::registry::StrategyEntry;
use crate::strategies::PositionSink;

/// Whether a strategy with `frequency` minutes runs at `tick`.
pub fn is_due(frequency: u32, tick: DateTime<Utc>) -> bool {
    frequency > 0 && epoch_minute(tick).rem_euclid(i64::from(frequency)) == 0
}

/// Typed result of one bounded strategy run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded { position: f64 },
    Skipped { reason: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyRun {
    pub strategy: String,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    pub runs: Vec<StrategyRun>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.runs.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn skipped(&self) -> usize {
        self.runs.len() - self.succeeded()
    }
}

/// Releases a strategy's in-flight slot when its run task finishes.
struct InFlightGuard {
    name: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.name);
        }
    }
}

pub struct Dispatcher {
    in_flight: Arc<Mutex<HashSet<String>>>,
    permits: Arc<Semaphore>,
    run_timeout: Duration,
    sink: Arc<dyn PositionSink>,
    metrics: Option<Arc<Metrics>>,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn PositionSink>, run_timeout: Duration, concurrency: usize) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            run_timeout,
            sink,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Names of strategies whose last run has not finished yet.
    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run every strategy due at `tick` and wait for all of them (each
    /// bounded by the run timeout).
    pub async fn dispatch(&self, tick: DateTime<Utc>, strategies: &[StrategyEntry]) -> DispatchReport {
        let due: Vec<&StrategyEntry> = strategies
            .iter()
            .filter(|e| e.strategy.active && is_due(e.strategy.frequency, tick))
            .collect();

        if due.is_empty() {
            debug!(target: "strategy", tick = %tick, "no strategies due");
            return DispatchReport::default();
        }

        let runs = join_all(due.into_iter().map(|entry| self.run_one(entry, tick))).await;
        let report = DispatchReport { runs };

        if let Some(metrics) = &self.metrics {
            metrics.strategy_runs_total.inc_by(report.succeeded() as u64);
            metrics.strategy_runs_skipped_total.inc_by(report.skipped() as u64);
        }
        report
    }

    async fn run_one(&self, entry: &StrategyEntry, tick: DateTime<Utc>) -> StrategyRun {
        let strategy = &entry.strategy;
        let outcome = match self.execute(entry).await {
            Ok(position) => match self.sink.apply(strategy, position, tick).await {
                Ok(()) => {
                    info!(
                        target: "strategy",
                        strategy = %strategy.name,
                        series = %strategy.series_id,
                        position,
                        "{} -> position {:.4}",
                        strategy.name,
                        position
                    );
                    RunOutcome::Succeeded { position }
                }
                Err(e) => {
                    error!(
                        target: "strategy",
                        strategy = %strategy.name,
                        error = %e,
                        "{} produced position {} but it could not be recorded: {}",
                        strategy.name,
                        position,
                        e
                    );
                    RunOutcome::Skipped {
                        reason: e.to_string(),
                    }
                }
            },
            Err(e) => {
                log_skip(strategy, &e);
                RunOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
        };

        StrategyRun {
            strategy: strategy.name.clone(),
            outcome,
        }
    }

    /// Wait for a worker slot, spawn the run, wait up to the timeout and
    /// validate the position.
    ///
    /// The slot is held here rather than by the task, so a run that times
    /// out hands its slot back even while its detached task keeps going.
    /// Only the run itself is timed.
    async fn execute(&self, entry: &StrategyEntry) -> Result<f64, StrategyError> {
        let guard = self.claim(&entry.strategy.name)?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| StrategyError::Failed(e.to_string()))?;
        let runner = entry.runner.clone();

        let mut handle = tokio::spawn(async move {
            let _guard = guard;
            runner.run().await
        });

        let position = match tokio::time::timeout(self.run_timeout, &mut handle).await {
            Err(_) => return Err(StrategyError::TimedOut(self.run_timeout)),
            Ok(Err(join_error)) if join_error.is_panic() => {
                return Err(StrategyError::Panicked(panic_message(join_error)))
            }
            Ok(Err(join_error)) => return Err(StrategyError::Failed(join_error.to_string())),
            Ok(Ok(result)) => result?,
        };

        validate_position(position)
    }

    fn claim(&self, name: &str) -> Result<InFlightGuard, StrategyError> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| StrategyError::Failed("in-flight set poisoned".to_string()))?;
        if !set.insert(name.to_string()) {
            return Err(StrategyError::AlreadyRunning);
        }
        Ok(InFlightGuard {
            name: name.to_string(),
            in_flight: self.in_flight.clone(),
        })
    }
}

/// Positions must be finite and within `[0, 1]`.
pub fn validate_position(position: f64) -> Result<f64, StrategyError> {
    if position.is_nan() {
        return Err(StrategyError::NotANumber);
    }
    if !(0.0..=1.0).contains(&position) {
        return Err(StrategyError::OutOfRange(position));
    }
    Ok(position)
}

fn panic_message(error: tokio::task::JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(e) => e.to_string(),
    }
}

fn log_skip(strategy: &Strategy, error: &StrategyError) {
    match error {
        StrategyError::AlreadyRunning => warn!(
            target: "strategy",
            strategy = %strategy.name,
            "{} is still running from an earlier beat, skipping",
            strategy.name
        ),
        other => error!(
            target: "strategy",
            strategy = %strategy.name,
            series = %strategy.series_id,
            error = %other,
            "{} run skipped: {}",
            strategy.name,
            other
        ),
    }
}
