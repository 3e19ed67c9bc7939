//! One beat: sync series, refresh prices, snapshot the wallet, dispatch.
//!
//! Series units run concurrently up to `fetch_concurrency`. Strategies are
//! dispatched only after every series unit has returned, so runs see the
//! candles this beat stored.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::scheduler::BeatHandler;
use crate::jobs::context::JobContext;
use crate::jobs::handlers;
use crate::jobs::types::BeatReport;

pub async fn run_beat(
    ctx: &JobContext,
    beat: u64,
    tick: DateTime<Utc>,
    cancel: &CancellationToken,
) -> BeatReport {
    let started = Instant::now();
    let ids: Vec<String> = ctx
        .registry
        .active_series()
        .await
        .into_iter()
        .map(|s| s.id)
        .collect();

    let series = stream::iter(ids.clone())
        .map(|id| handlers::handle_sync_series(ctx, id, cancel))
        .buffer_unordered(ctx.fetch_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let prices = handlers::handle_refresh_prices(ctx, &ids, cancel).await;
    let wallet = handlers::handle_wallet_snapshot(ctx, cancel).await;

    let strategies = ctx.registry.active_strategies().await;
    let dispatch = ctx.dispatcher.dispatch(tick, &strategies).await;

    let report = BeatReport {
        beat,
        tick,
        series,
        prices,
        wallet,
        dispatch,
    };

    let elapsed = started.elapsed();
    if let Some(metrics) = &ctx.metrics {
        metrics.beat_duration_seconds.observe(elapsed.as_secs_f64());
    }
    info!(
        target: "heartbeat",
        beat,
        tick = %tick,
        series = report.series.len(),
        strategies_run = report.dispatch.succeeded(),
        strategies_skipped = report.dispatch.skipped(),
        failures = report.failures(),
        duration_ms = elapsed.as_millis() as u64,
        "beat {} for {} done: {} series, {} failures",
        beat,
        tick,
        report.series.len(),
        report.failures()
    );
    report
}

#[async_trait]
impl BeatHandler for JobContext {
    async fn on_beat(&self, beat: u64, tick: DateTime<Utc>, cancel: &CancellationToken) -> usize {
        run_beat(self, beat, tick, cancel).await.failures()
    }
}
