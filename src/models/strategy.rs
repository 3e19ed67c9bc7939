//! Strategy definitions and the state the executor keeps for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A registered strategy bound to one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    pub series_id: String,
    /// Run cadence in whole minutes, always positive.
    pub frequency: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Strategy {
    pub fn new(
        name: impl Into<String>,
        series_id: impl Into<String>,
        frequency: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            series_id: series_id.into(),
            frequency,
            active: true,
            created_at,
        }
    }
}

/// Per-strategy execution state, one row per strategy.
///
/// Written only by the position executor after a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    pub strategy: String,
    /// Fraction of capital held in the base asset, within `[0, 1]`.
    pub position: f64,
    pub base_holdings: f64,
    pub quote_holdings: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl StrategyState {
    pub fn flat(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            position: 0.0,
            base_holdings: 0.0,
            quote_holdings: 0.0,
            last_run_at: None,
        }
    }
}

/// Account balances as returned by the exchange, stored verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub taken_at: DateTime<Utc>,
    pub balances: Value,
}
