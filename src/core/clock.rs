//! Wall-clock access and minute-boundary arithmetic

use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};

use crate::error::SchedulerError;

/// Source of "now". Injected so scheduling can be driven by a test clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real UTC wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock anchored at a fixed UTC instant that advances with tokio's timer.
///
/// Under a paused tokio runtime this lets time-driven code see consistent
/// wall-clock readings while sleeping on virtual time.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.anchor + elapsed
    }
}

/// Truncate a timestamp to the start of its minute.
pub fn floor_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::minutes(1)).unwrap_or(ts)
}

/// Whole minutes since the Unix epoch.
pub fn epoch_minute(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(60)
}

/// Inverse of [`epoch_minute`].
pub fn from_epoch_minute(minute: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(minute.saturating_mul(60), 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Computes trigger instants aligned to period boundaries plus a buffer.
///
/// The buffer gives the exchange time to close the candle of the boundary
/// that just passed before it is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeAligner {
    period: Duration,
    buffer: Duration,
}

impl TimeAligner {
    pub fn new(period: Duration, buffer: Duration) -> Self {
        Self { period, buffer }
    }

    /// One-minute period with the given buffer.
    pub fn minutely(buffer: Duration) -> Self {
        Self::new(Duration::minutes(1), buffer)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    /// First `boundary + buffer` instant strictly after `now`.
    pub fn next_trigger(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        let boundary = now
            .checked_sub_signed(self.buffer)
            .and_then(|shifted| shifted.duration_trunc(self.period).ok())
            .ok_or(SchedulerError::BoundaryOverflow(now))?;

        let mut trigger = boundary
            .checked_add_signed(self.buffer)
            .ok_or(SchedulerError::BoundaryOverflow(now))?;
        while trigger <= now {
            trigger = trigger
                .checked_add_signed(self.period)
                .ok_or(SchedulerError::BoundaryOverflow(now))?;
        }
        Ok(trigger)
    }

    /// The period boundary a trigger belongs to.
    pub fn boundary_of(&self, trigger: DateTime<Utc>) -> DateTime<Utc> {
        (trigger - self.buffer)
            .duration_trunc(self.period)
            .unwrap_or(trigger)
    }
}

impl Default for TimeAligner {
    fn default() -> Self {
        Self::minutely(Duration::seconds(5))
    }
}
