//! Wires the store, exchange client, registry, dispatcher and heartbeat
//! into one runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::core::clock::{floor_minute, Clock, TimeAligner};
use crate::core::dispatcher::Dispatcher;
use crate::core::reconciler::{BackfillPolicy, GapReconciler};
use crate::core::retry::RetryPolicy;
use crate::core::scheduler::{HeartbeatScheduler, HeartbeatStats};
use crate::db::{PriceStore, Store};
use crate::error::{FetchError, RegistryError, SchedulerError, StoreError, SyncError};
use crate::jobs::{run_beat, BeatReport, JobContext};
use crate::metrics::Metrics;
use crate::models::{Candle, Series, Strategy};
use crate::registry::Registry;
use crate::services::backfill::{BackfillReport, BackfillService, BackfillStatus};
use crate::services::market_data::MarketDataProvider;
use crate::services::wallet::WalletSource;
use crate::strategies::{StateRecorder, StrategyCatalog};

/// Configuration for the sync runtime
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub backfill: BackfillPolicy,
    pub gap_fill_enabled: bool,
    pub heartbeat_buffer: Duration,
    pub fetch_concurrency: usize,
    pub retry: RetryPolicy,
    pub strategy_run_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for RuntimeConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            backfill: settings.backfill_policy(),
            gap_fill_enabled: settings.gap_fill_enabled,
            heartbeat_buffer: Duration::from_secs(settings.heartbeat_buffer_seconds.max(0) as u64),
            fetch_concurrency: settings.fetch_concurrency,
            retry: settings.retry.clone(),
            strategy_run_timeout: settings.strategy_run_timeout,
            shutdown_grace: settings.shutdown_grace,
        }
    }
}

/// Result of registering a series. The series stays registered even when
/// its initial backfill fails; the heartbeat catches it up later.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesRegistration {
    pub series: Series,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backfill: Option<BackfillReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backfill_error: Option<String>,
}

/// External collaborators handed to [`SyncRuntime::build`].
pub struct RuntimeDeps {
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn MarketDataProvider>,
    pub wallet: Option<Arc<dyn WalletSource>>,
    pub catalog: StrategyCatalog,
    pub clock: Arc<dyn Clock>,
    pub metrics: Option<Arc<Metrics>>,
}

pub struct SyncRuntime {
    config: RuntimeConfig,
    registry: Arc<Registry>,
    catalog: StrategyCatalog,
    backfill: Arc<BackfillService>,
    context: Arc<JobContext>,
    scheduler: HeartbeatScheduler,
    clock: Arc<dyn Clock>,
    manual_beats: AtomicU64,
}

impl SyncRuntime {
    /// Load the registry from the store and assemble the runtime.
    pub async fn build(config: RuntimeConfig, deps: RuntimeDeps) -> Result<Self, StoreError> {
        let RuntimeDeps {
            store,
            provider,
            wallet,
            catalog,
            clock,
            metrics,
        } = deps;

        let registry = Arc::new(Registry::load(store.clone(), &catalog).await?);
        let backfill = Arc::new(BackfillService::new(
            provider.clone(),
            store.clone(),
            GapReconciler::new(config.backfill),
            config.retry.clone(),
            clock.clone(),
        ));
        // Per-beat catch-up treats any gap as a gap, so the minute that just
        // closed is always fetched.
        let catch_up = Arc::new(backfill.with_reconciler(GapReconciler::new(BackfillPolicy {
            gap_threshold: chrono::Duration::zero(),
            ..config.backfill
        })));

        let mut dispatcher = Dispatcher::new(
            Arc::new(StateRecorder::new(store.clone())),
            config.strategy_run_timeout,
            config.fetch_concurrency,
        );
        if let Some(metrics) = &metrics {
            dispatcher = dispatcher.with_metrics(metrics.clone());
        }

        let context = Arc::new(JobContext {
            provider,
            wallet,
            store,
            registry: registry.clone(),
            catch_up,
            dispatcher: Arc::new(dispatcher),
            retry: config.retry.clone(),
            clock: clock.clone(),
            metrics: metrics.clone(),
            fetch_concurrency: config.fetch_concurrency,
        });

        let buffer = chrono::Duration::from_std(config.heartbeat_buffer)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        let mut scheduler = HeartbeatScheduler::new(
            TimeAligner::minutely(buffer),
            clock.clone(),
            context.clone(),
            config.shutdown_grace,
        );
        if let Some(metrics) = metrics {
            scheduler = scheduler.with_metrics(metrics);
        }

        Ok(Self {
            config,
            registry,
            catalog,
            backfill,
            context,
            scheduler,
            clock,
            manual_beats: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Register (or reactivate) a series and backfill it.
    pub async fn register_series(&self, id: &str) -> Result<SeriesRegistration, RegistryError> {
        let id = id.trim();
        if let Some(existing) = self.registry.series(id).await {
            if existing.active {
                return Err(RegistryError::SeriesAlreadyActive(id.to_string()));
            }
        }

        let cancel = self.scheduler.shutdown_token();
        let provider = self.context.provider.clone();
        let listed = self
            .config
            .retry
            .run("has_instrument", &cancel, FetchError::is_transient, || {
                provider.has_instrument(id)
            })
            .await
            .map_err(|e| {
                e.into_inner()
                    .unwrap_or_else(|| FetchError::Network("cancelled".to_string()))
            })?;
        if !listed {
            return Err(FetchError::UnknownInstrument(id.to_string()).into());
        }

        let series = self.registry.add_series(id, self.clock.now()).await?;
        info!(series = %id, "SyncRuntime: registered series {}", id);

        let registration = match self.backfill.sync_series(id, &cancel).await {
            Ok(report) => SeriesRegistration {
                series,
                backfill: Some(report),
                backfill_error: None,
            },
            Err(e) => {
                warn!(series = %id, error = %e, "SyncRuntime: initial backfill for {} failed: {}", id, e);
                SeriesRegistration {
                    series,
                    backfill: None,
                    backfill_error: Some(e.to_string()),
                }
            }
        };
        Ok(registration)
    }

    pub async fn deactivate_series(&self, id: &str) -> Result<Series, RegistryError> {
        let series = self.registry.deactivate_series(id).await?;
        info!(series = %id, "SyncRuntime: deactivated series {}", id);
        Ok(series)
    }

    /// Register a strategy whose runner is known to the catalog.
    pub async fn register_strategy(
        &self,
        name: &str,
        series_id: &str,
        frequency: u32,
    ) -> Result<Strategy, RegistryError> {
        let runner = self
            .catalog
            .resolve(name)
            .ok_or_else(|| RegistryError::NoRunner(name.to_string()))?;
        let strategy = self
            .registry
            .add_strategy(name, series_id, frequency, runner, self.clock.now())
            .await?;
        info!(
            target: "strategy",
            strategy = %name,
            series = %series_id,
            frequency,
            "registered {} on {} every {} min",
            name,
            series_id,
            frequency
        );
        Ok(strategy)
    }

    pub async fn backfill_status(&self, id: &str) -> Result<BackfillStatus, RegistryError> {
        if self.registry.series(id).await.is_none() {
            return Err(RegistryError::UnknownSeries(id.to_string()));
        }
        Ok(self.backfill.status(id).await?)
    }

    pub async fn candles(
        &self,
        id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, RegistryError> {
        if self.registry.series(id).await.is_none() {
            return Err(RegistryError::UnknownSeries(id.to_string()));
        }
        Ok(self.context.store.range(id, from, to).await?)
    }

    /// Bring every active series up to the backfill policy. Skipped when gap
    /// filling is disabled.
    pub async fn startup_gap_fill(&self) -> Vec<(String, Result<BackfillReport, SyncError>)> {
        if !self.config.gap_fill_enabled {
            info!("SyncRuntime: startup gap-fill disabled");
            return Vec::new();
        }
        let series = self.registry.active_series().await;
        info!(count = series.len(), "SyncRuntime: startup gap-fill for {} series", series.len());
        let results = self
            .backfill
            .backfill_all(&series, &self.scheduler.shutdown_token())
            .await;

        let mut synced = 0;
        let mut no_action = 0;
        let mut failed = 0;
        let mut stored = 0;
        for (_, result) in &results {
            match result {
                Ok(report) if report.window.is_none() => no_action += 1,
                Ok(report) => {
                    synced += 1;
                    stored += report.stored;
                }
                Err(_) => failed += 1,
            }
        }
        info!(
            synced,
            no_action,
            failed,
            stored,
            "SyncRuntime: startup gap-fill done ({} synced, {} up to date, {} failed, {} candles)",
            synced,
            no_action,
            failed,
            stored
        );
        results
    }

    /// Execute one beat immediately for the current minute, outside the
    /// heartbeat schedule.
    pub async fn run_once(&self) -> BeatReport {
        let beat = self.manual_beats.fetch_add(1, Ordering::SeqCst) + 1;
        let tick = floor_minute(self.clock.now());
        run_beat(&self.context, beat, tick, &self.scheduler.shutdown_token()).await
    }

    /// Startup gap-fill, then the heartbeat.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.startup_gap_fill().await;
        self.scheduler.start().await
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.scheduler.stop().await
    }

    /// Block until the heartbeat exits.
    pub async fn join(&self) -> Result<(), SchedulerError> {
        self.scheduler.join().await
    }

    pub async fn stats(&self) -> HeartbeatStats {
        self.scheduler.stats().await
    }
}
