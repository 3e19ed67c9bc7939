//! Job handlers for the units of one beat
//!
//! Every handler returns a result value instead of an error: failures are
//! logged with the unit's identity here and never escape the unit.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::db::CatalogStore;
use crate::error::FetchError;
use crate::jobs::context::JobContext;
use crate::jobs::types::{PriceRefresh, SeriesSyncResult, WalletOutcome};
use crate::models::WalletSnapshot;

/// Catch one series up to the minute that just closed.
pub async fn handle_sync_series(
    ctx: &JobContext,
    series: String,
    cancel: &CancellationToken,
) -> SeriesSyncResult {
    match ctx.catch_up.sync_series(&series, cancel).await {
        Ok(report) => {
            if let Some(metrics) = &ctx.metrics {
                metrics.candles_upserted_total.inc_by(report.stored as u64);
            }
            debug!(
                series = %series,
                plan = %report.plan,
                stored = report.stored,
                "SyncSeries: {} {} ({} stored)",
                series,
                report.plan,
                report.stored
            );
            SeriesSyncResult {
                series,
                report: Some(report),
                error: None,
            }
        }
        Err(e) => {
            if let Some(metrics) = &ctx.metrics {
                metrics.series_fetch_failures_total.inc();
            }
            error!(series = %series, error = %e, "SyncSeries: {} failed: {}", series, e);
            SeriesSyncResult {
                series,
                report: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Fetch current prices for all series in one request and store them on
/// the series rows.
pub async fn handle_refresh_prices(
    ctx: &JobContext,
    series: &[String],
    cancel: &CancellationToken,
) -> PriceRefresh {
    if series.is_empty() {
        return PriceRefresh::default();
    }

    let provider = ctx.provider.clone();
    let prices = match ctx
        .retry
        .run("fetch_current_prices", cancel, FetchError::is_transient, || {
            provider.fetch_current_prices(series)
        })
        .await
    {
        Ok(prices) => prices,
        Err(e) => {
            error!(count = series.len(), error = %e, "RefreshPrices: batch failed: {}", e);
            return PriceRefresh {
                updated: Vec::new(),
                missing: series.to_vec(),
                error: Some(e.to_string()),
            };
        }
    };

    let mut refresh = PriceRefresh::default();
    for id in series {
        let Some(tick) = prices.get(id) else {
            warn!(series = %id, "RefreshPrices: no price returned for {}", id);
            refresh.missing.push(id.clone());
            continue;
        };
        match ctx.registry.record_price(id, tick.price, tick.observed_at).await {
            Ok(()) => refresh.updated.push(id.clone()),
            Err(e) => {
                error!(series = %id, error = %e, "RefreshPrices: could not store price for {}: {}", id, e);
                refresh.missing.push(id.clone());
            }
        }
    }
    refresh
}

/// Record the account balances, when a wallet source is configured.
pub async fn handle_wallet_snapshot(ctx: &JobContext, cancel: &CancellationToken) -> WalletOutcome {
    let Some(wallet) = ctx.wallet.clone() else {
        return WalletOutcome::NotConfigured;
    };

    let balances = match ctx
        .retry
        .run("wallet_snapshot", cancel, FetchError::is_transient, || wallet.balances())
        .await
    {
        Ok(balances) => balances,
        Err(e) => {
            error!(error = %e, "WalletSnapshot: fetch failed: {}", e);
            return WalletOutcome::Failed {
                error: e.to_string(),
            };
        }
    };

    let snapshot = WalletSnapshot {
        taken_at: ctx.clock.now(),
        balances,
    };
    match ctx.store.save_wallet_snapshot(&snapshot).await {
        Ok(()) => WalletOutcome::Recorded,
        Err(e) => {
            error!(error = %e, "WalletSnapshot: could not store snapshot: {}", e);
            WalletOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}
