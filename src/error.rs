//! Error taxonomy shared across the sync engine.
//!
//! Per-unit errors (`FetchError`, `StoreError`, `StrategyError`) are caught
//! at the unit boundary and never abort a beat. Only `SchedulerError` is
//! fatal to the control loop.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure talking to the market-data source.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by exchange")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("unknown instrument '{0}'")]
    UnknownInstrument(String),

    #[error("exchange error (status {status:?}): {message}")]
    Exchange { status: Option<u16>, message: String },

    #[error("could not decode exchange payload: {0}")]
    Decode(String),
}

impl FetchError {
    /// Network, timeout, rate-limit and exchange-side 5xx errors are worth
    /// retrying; auth and validation errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout(_) | FetchError::RateLimited { .. } => {
                true
            }
            FetchError::Exchange { status, .. } => matches!(status, Some(s) if *s >= 500),
            FetchError::Auth(_) | FetchError::UnknownInstrument(_) | FetchError::Decode(_) => {
                false
            }
        }
    }
}

/// Failure in the persistence layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
}

/// Any failed strategy run. Always converted into a skipped run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
    #[error("strategy failed: {0}")]
    Failed(String),

    #[error("position {0} outside [0, 1]")]
    OutOfRange(f64),

    #[error("position is not a number")]
    NotANumber,

    #[error("run exceeded {0:?}")]
    TimedOut(Duration),

    #[error("run panicked: {0}")]
    Panicked(String),

    #[error("previous run still in flight")]
    AlreadyRunning,
}

/// Registration and lookup failures on the registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("series '{0}' is not registered")]
    UnknownSeries(String),

    #[error("series '{0}' is not active")]
    SeriesInactive(String),

    #[error("series '{0}' is already registered and active")]
    SeriesAlreadyActive(String),

    #[error("series '{series}' is referenced by active strategy '{strategy}'")]
    SeriesInUse { series: String, strategy: String },

    #[error("strategy '{0}' is already registered")]
    StrategyExists(String),

    #[error("frequency must be a positive number of minutes")]
    InvalidFrequency,

    #[error("no runner available for strategy '{0}'")]
    NoRunner(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a retried operation that did not succeed.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// A failure the predicate classified as terminal; not retried.
    #[error("terminal failure on attempt {attempts}: {error}")]
    Terminal { attempts: u32, error: E },

    /// Every allowed attempt failed with a retryable error.
    #[error("RetryExhausted after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: E },

    /// Shutdown was requested while waiting to retry.
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Terminal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// The last underlying failure, if one was observed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Terminal { error, .. } | RetryError::Exhausted { error, .. } => {
                Some(error)
            }
            RetryError::Cancelled { last, .. } => last,
        }
    }
}

/// Unrecoverable failure of the heartbeat control loop itself.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("cannot compute next trigger after {0}")]
    BoundaryOverflow(DateTime<Utc>),

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler task failed: {0}")]
    Task(String),
}

/// Invalid process configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Failure of one series sync unit (plan, fetch, store).
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] RetryError<FetchError>),

    #[error(transparent)]
    Store(#[from] StoreError),
}
