//! Per-beat unit results

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::dispatcher::DispatchReport;
use crate::services::backfill::BackfillReport;

/// One series' fetch unit.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSyncResult {
    pub series: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<BackfillReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SeriesSyncResult {
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of the batched current-price request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PriceRefresh {
    pub updated: Vec<String>,
    /// Series missing from the response or whose write failed.
    pub missing: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PriceRefresh {
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WalletOutcome {
    NotConfigured,
    Recorded,
    Failed { error: String },
}

/// Everything one beat did.
#[derive(Debug, Clone, Serialize)]
pub struct BeatReport {
    pub beat: u64,
    pub tick: DateTime<Utc>,
    pub series: Vec<SeriesSyncResult>,
    pub prices: PriceRefresh,
    pub wallet: WalletOutcome,
    pub dispatch: DispatchReport,
}

impl BeatReport {
    /// Units that failed in this beat; a skipped strategy run counts as one.
    pub fn failures(&self) -> usize {
        let series = self.series.iter().filter(|s| s.is_failure()).count();
        let prices = usize::from(self.prices.is_failure());
        let wallet = usize::from(matches!(self.wallet, WalletOutcome::Failed { .. }));
        series + prices + wallet + self.dispatch.skipped()
    }
}
