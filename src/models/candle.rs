//! One-minute OHLCV candles and the edges of a stored series.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::clock::floor_minute;

/// A one-minute OHLCV aggregate.
///
/// The timestamp is always floored to the minute, so `(series, timestamp)`
/// is the natural key of a stored candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp: floor_minute(timestamp),
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Oldest and latest stored minute of a series, computed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEdges {
    pub oldest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

impl StoreEdges {
    pub fn new(oldest: DateTime<Utc>, latest: DateTime<Utc>) -> Self {
        Self { oldest, latest }
    }
}
