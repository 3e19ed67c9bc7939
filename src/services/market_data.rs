//! Market data provider interface.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::models::Candle;

/// Last traded price of one instrument at the time it was read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Closed one-minute candles with open time in `[from, to]`, oldest first.
    async fn fetch_candles(
        &self,
        series: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FetchError>;

    /// Current prices for many series in one request. Series the exchange
    /// does not report are absent from the map.
    async fn fetch_current_prices(
        &self,
        series: &[String],
    ) -> Result<HashMap<String, PriceTick>, FetchError>;

    /// Whether the exchange lists the instrument.
    async fn has_instrument(&self, series: &str) -> Result<bool, FetchError>;
}
