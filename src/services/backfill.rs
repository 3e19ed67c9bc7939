//! Brings a series' stored history in line with a [`GapReconciler`] plan.
//!
//! The same routine serves registration, startup gap-fill and the per-beat
//! catch-up; only the reconciler policy differs between them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::clock::Clock;
use crate::core::reconciler::{FetchPlan, FetchWindow, GapReconciler, ReconciliationWarning};
use crate::core::retry::RetryPolicy;
use crate::db::{PriceStore, Store};
use crate::error::{FetchError, StoreError, SyncError};
use crate::models::{Series, StoreEdges};
use crate::services::market_data::MarketDataProvider;

/// What one sync of one series did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillReport {
    pub series: String,
    /// Plan tag, e.g. `gap_only` or `full_backfill_limited`.
    pub plan: String,
    pub window: Option<FetchWindow>,
    pub fetched: usize,
    pub stored: usize,
    pub warnings: Vec<ReconciliationWarning>,
}

/// Stored coverage of a series compared with the configured requirement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillStatus {
    pub series: String,
    pub edges: Option<StoreEdges>,
    pub candles: u64,
    pub required_minutes: i64,
    /// Plan the reconciler would produce right now.
    pub pending: String,
    pub up_to_date: bool,
}

pub struct BackfillService {
    provider: Arc<dyn MarketDataProvider>,
    store: Arc<dyn Store>,
    reconciler: GapReconciler,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl BackfillService {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        store: Arc<dyn Store>,
        reconciler: GapReconciler,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            store,
            reconciler,
            retry,
            clock,
        }
    }

    pub fn reconciler(&self) -> &GapReconciler {
        &self.reconciler
    }

    /// Same provider, store and retry policy, planned by another reconciler.
    pub fn with_reconciler(&self, reconciler: GapReconciler) -> Self {
        Self {
            provider: self.provider.clone(),
            store: self.store.clone(),
            reconciler,
            retry: self.retry.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Plan, fetch (with retry) and upsert one series.
    pub async fn sync_series(
        &self,
        series: &str,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport, SyncError> {
        let edges = self.store.edges(series).await?;
        let plan = self.reconciler.plan(edges, self.clock.now());
        self.execute(series, plan, cancel).await
    }

    async fn execute(
        &self,
        series: &str,
        plan: FetchPlan,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport, SyncError> {
        for warning in &plan.warnings {
            warn!(series = %series, warning = ?warning, "BackfillService: {} plan warning: {:?}", series, warning);
        }

        let Some(window) = plan.window else {
            return Ok(BackfillReport {
                series: series.to_string(),
                plan: plan.tag(),
                window: None,
                fetched: 0,
                stored: 0,
                warnings: plan.warnings,
            });
        };

        let provider = self.provider.clone();
        let label = format!("fetch_candles:{}", series);
        let fetched = self
            .retry
            .run(&label, cancel, FetchError::is_transient, || {
                provider.fetch_candles(series, window.from, window.to)
            })
            .await?;

        // The exchange may hand back the forming minute or extra rows.
        let candles: Vec<_> = fetched
            .iter()
            .filter(|c| window.contains(c.timestamp))
            .cloned()
            .collect();
        let stored = self.store.upsert_candles(series, &candles).await?;

        info!(
            series = %series,
            plan = %plan.tag(),
            from = %window.from,
            to = %window.to,
            fetched = fetched.len(),
            stored,
            "BackfillService: {} {} stored {} candles",
            series,
            plan.tag(),
            stored
        );

        Ok(BackfillReport {
            series: series.to_string(),
            plan: plan.tag(),
            window: Some(window),
            fetched: fetched.len(),
            stored,
            warnings: plan.warnings,
        })
    }

    /// Sync every given series in order. A failing series is logged and
    /// does not stop the others.
    pub async fn backfill_all(
        &self,
        series: &[Series],
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<BackfillReport, SyncError>)> {
        let mut results = Vec::with_capacity(series.len());
        for s in series.iter().filter(|s| s.active) {
            if cancel.is_cancelled() {
                break;
            }
            let result = self.sync_series(&s.id, cancel).await;
            if let Err(e) = &result {
                warn!(series = %s.id, error = %e, "BackfillService: gap-fill for {} failed: {}", s.id, e);
            }
            results.push((s.id.clone(), result));
        }
        results
    }

    pub async fn status(&self, series: &str) -> Result<BackfillStatus, StoreError> {
        self.status_at(series, self.clock.now()).await
    }

    pub async fn status_at(
        &self,
        series: &str,
        now: DateTime<Utc>,
    ) -> Result<BackfillStatus, StoreError> {
        let edges = self.store.edges(series).await?;
        let candles = self.store.count(series).await?;
        let plan = self.reconciler.plan(edges, now);
        Ok(BackfillStatus {
            series: series.to_string(),
            edges,
            candles,
            required_minutes: self.reconciler.policy().required.num_minutes(),
            pending: plan.tag(),
            up_to_date: plan.is_noop(),
        })
    }
}
