//! Integration tests for the Worker
//!
//! Beat execution, registration, dispatch and the heartbeat loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use candlekeeper::core::clock::{Clock, TimeAligner, TokioClock};
use candlekeeper::core::retry::RetryPolicy;
use candlekeeper::core::runtime::{RuntimeConfig, RuntimeDeps, SyncRuntime};
use candlekeeper::core::scheduler::{BeatHandler, HeartbeatScheduler};
use candlekeeper::db::{CatalogStore, MemoryStore, PriceStore, Store};
use candlekeeper::error::{FetchError, RegistryError, RetryError, SchedulerError};
use candlekeeper::jobs::WalletOutcome;
use candlekeeper::strategies::{FlatStrategy, StrategyCatalog};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::test_utils::{noon, FakeProvider, TestRuntime};

fn minute(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
}

#[tokio::test]
async fn registration_backfills_required_history() {
    let app = TestRuntime::new().await;

    let registration = app.runtime.register_series("BTCUSDT").await.unwrap();

    assert!(registration.series.active);
    let report = registration.backfill.expect("backfill ran");
    assert_eq!(report.plan, "full_backfill");
    assert_eq!(report.stored, 6);
    let edges = app.store.edges("BTCUSDT").await.unwrap().unwrap();
    assert_eq!(edges.oldest, minute(11, 54));
    assert_eq!(edges.latest, minute(11, 59));
}

#[tokio::test]
async fn run_once_fetches_minutes_closed_since_last_beat() {
    let app = TestRuntime::new().await;
    app.runtime.register_series("BTCUSDT").await.unwrap();
    app.runtime.register_series("ETHUSDT").await.unwrap();
    app.clock.advance(ChronoDuration::minutes(3));

    let report = app.runtime.run_once().await;

    assert_eq!(report.tick, minute(12, 3));
    assert_eq!(report.failures(), 0);
    assert_eq!(report.series.len(), 2);
    for result in &report.series {
        let sync = result.report.as_ref().expect("series synced");
        assert_eq!(sync.plan, "gap_only");
        assert_eq!(sync.stored, 3);
    }
    assert_eq!(
        app.provider.requests_for("BTCUSDT").last(),
        Some(&(minute(12, 0), minute(12, 2)))
    );
    assert_eq!(report.prices.updated.len(), 2);
    assert!(matches!(report.wallet, WalletOutcome::Recorded));
    assert_eq!(app.store.wallet_snapshots().await.len(), 1);

    let btc = app.runtime.registry().series("BTCUSDT").await.unwrap();
    assert_eq!(btc.last_price, Some(100.0));

    // Nothing closed since: the next beat plans no fetch.
    let again = app.runtime.run_once().await;
    assert!(again.series.iter().all(|s| s.report.as_ref().unwrap().plan == "no_action"));
}

#[tokio::test]
async fn failing_series_does_not_block_others() {
    let app = TestRuntime::new().await;
    app.runtime.register_series("BTCUSDT").await.unwrap();
    app.runtime.register_series("ETHUSDT").await.unwrap();
    app.runtime.register_strategy("flat", "BTCUSDT", 1).await.unwrap();
    app.provider.fail("ETHUSDT");
    app.clock.advance(ChronoDuration::minutes(2));

    let report = app.runtime.run_once().await;

    let eth = report.series.iter().find(|s| s.series == "ETHUSDT").unwrap();
    let btc = report.series.iter().find(|s| s.series == "BTCUSDT").unwrap();
    assert!(eth.is_failure());
    assert_eq!(btc.report.as_ref().unwrap().stored, 2);
    assert_eq!(report.dispatch.succeeded(), 1);
    assert_eq!(report.failures(), 1);
    assert_eq!(app.store.edges("ETHUSDT").await.unwrap().unwrap().latest, minute(11, 59));

    // Once the exchange recovers the gap is closed on the next beat.
    app.provider.recover("ETHUSDT");
    let report = app.runtime.run_once().await;
    assert_eq!(report.failures(), 0);
    assert_eq!(app.store.edges("ETHUSDT").await.unwrap().unwrap().latest, minute(12, 1));
}

#[tokio::test(start_paused = true)]
async fn series_fetches_respect_concurrency_cap() {
    let app = TestRuntime::with_config(RuntimeConfig {
        retry: RetryPolicy::no_retry(),
        fetch_concurrency: 2,
        ..RuntimeConfig::default()
    })
    .await;
    for id in ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "ADAUSDT"] {
        app.runtime.register_series(id).await.unwrap();
    }
    app.provider.slow_down(Duration::from_secs(1));
    app.clock.advance(ChronoDuration::minutes(1));

    let report = app.runtime.run_once().await;

    assert_eq!(report.failures(), 0);
    assert_eq!(report.series.len(), 5);
    assert_eq!(app.provider.peak_in_flight(), 2);
}

#[tokio::test]
async fn unknown_instrument_is_rejected() {
    let app = TestRuntime::new().await;
    app.provider.unlist("NOPEUSDT");

    let err = app.runtime.register_series("NOPEUSDT").await.unwrap_err();

    assert!(matches!(err, RegistryError::Fetch(FetchError::UnknownInstrument(_))));
    assert!(app.runtime.registry().series("NOPEUSDT").await.is_none());
}

#[tokio::test]
async fn registration_survives_failed_backfill() {
    let app = TestRuntime::new().await;
    app.provider.fail("BTCUSDT");

    let registration = app.runtime.register_series("BTCUSDT").await.unwrap();

    assert!(registration.backfill.is_none());
    assert!(registration.backfill_error.unwrap().contains("503"));
    assert!(app.runtime.registry().series("BTCUSDT").await.unwrap().active);
}

#[tokio::test]
async fn startup_gap_fill_closes_downtime_gap() {
    let app = TestRuntime::new().await;
    app.runtime.register_series("BTCUSDT").await.unwrap();
    app.clock.advance(ChronoDuration::minutes(10));

    let status = app.runtime.backfill_status("BTCUSDT").await.unwrap();
    assert_eq!(status.candles, 6);
    assert_eq!(status.pending, "gap_only");
    assert!(!status.up_to_date);

    let results = app.runtime.startup_gap_fill().await;

    assert_eq!(results.len(), 1);
    let report = results[0].1.as_ref().expect("gap filled");
    assert_eq!(report.stored, 10);
    assert_eq!(
        app.provider.requests_for("BTCUSDT").last(),
        Some(&(minute(12, 0), minute(12, 9)))
    );
    let status = app.runtime.backfill_status("BTCUSDT").await.unwrap();
    assert_eq!(status.candles, 16);
    assert!(status.up_to_date);
}

#[tokio::test]
async fn startup_gap_fill_can_be_disabled() {
    let app = TestRuntime::with_config(RuntimeConfig {
        retry: RetryPolicy::no_retry(),
        gap_fill_enabled: false,
        ..RuntimeConfig::default()
    })
    .await;
    app.runtime.register_series("BTCUSDT").await.unwrap();
    app.clock.advance(ChronoDuration::minutes(10));

    assert!(app.runtime.startup_gap_fill().await.is_empty());
    assert_eq!(app.store.count("BTCUSDT").await.unwrap(), 6);

    let err = app.runtime.backfill_status("NOPEUSDT").await.unwrap_err();
    assert!(matches!(err, RegistryError::UnknownSeries(_)));
}

#[tokio::test]
async fn series_lifecycle() {
    let app = TestRuntime::new().await;
    app.runtime.register_series("BTCUSDT").await.unwrap();

    let duplicate = app.runtime.register_series("BTCUSDT").await.unwrap_err();
    assert!(matches!(duplicate, RegistryError::SeriesAlreadyActive(_)));

    app.runtime.register_strategy("flat", "BTCUSDT", 5).await.unwrap();
    let in_use = app.runtime.deactivate_series("BTCUSDT").await.unwrap_err();
    assert!(matches!(in_use, RegistryError::SeriesInUse { .. }));

    app.runtime.register_series("ETHUSDT").await.unwrap();
    let deactivated = app.runtime.deactivate_series("ETHUSDT").await.unwrap();
    assert!(!deactivated.active);
    assert_eq!(app.runtime.registry().active_series().await.len(), 1);

    let reactivated = app.runtime.register_series("ETHUSDT").await.unwrap();
    assert!(reactivated.series.active);
    assert_eq!(reactivated.series.registered_at, deactivated.registered_at);
}

#[tokio::test]
async fn strategy_registration_rules() {
    let app = TestRuntime::new().await;

    let unknown = app.runtime.register_strategy("flat", "BTCUSDT", 1).await.unwrap_err();
    assert!(matches!(unknown, RegistryError::UnknownSeries(_)));

    app.runtime.register_series("BTCUSDT").await.unwrap();
    app.runtime.register_series("ETHUSDT").await.unwrap();
    app.runtime.deactivate_series("ETHUSDT").await.unwrap();
    let inactive = app.runtime.register_strategy("flat", "ETHUSDT", 1).await.unwrap_err();
    assert!(matches!(inactive, RegistryError::SeriesInactive(_)));

    let no_runner = app.runtime.register_strategy("momentum", "BTCUSDT", 1).await.unwrap_err();
    assert!(matches!(no_runner, RegistryError::NoRunner(_)));

    let zero = app.runtime.register_strategy("flat", "BTCUSDT", 0).await.unwrap_err();
    assert!(matches!(zero, RegistryError::InvalidFrequency));

    let strategy = app.runtime.register_strategy("flat", "BTCUSDT", 1).await.unwrap();
    assert!(strategy.active);
    let state = app.store.strategy_state("flat").await.unwrap().unwrap();
    assert_eq!(state.position, 0.0);
    assert!(state.last_run_at.is_none());

    let twice = app.runtime.register_strategy("flat", "BTCUSDT", 1).await.unwrap_err();
    assert!(matches!(twice, RegistryError::StrategyExists(_)));
}

#[tokio::test]
async fn due_strategy_run_is_recorded() {
    let app = TestRuntime::new().await;
    app.runtime.register_series("BTCUSDT").await.unwrap();
    app.runtime.register_strategy("flat", "BTCUSDT", 1).await.unwrap();

    let report = app.runtime.run_once().await;

    assert_eq!(report.dispatch.succeeded(), 1);
    let state = app.store.strategy_state("flat").await.unwrap().unwrap();
    assert_eq!(state.last_run_at, Some(minute(12, 0)));
}

#[tokio::test]
async fn registry_reloads_from_store() {
    let app = TestRuntime::new().await;
    app.runtime.register_series("BTCUSDT").await.unwrap();
    app.runtime.register_strategy("flat", "BTCUSDT", 1).await.unwrap();

    let store: Arc<dyn Store> = app.store.clone();
    let reloaded = SyncRuntime::build(
        RuntimeConfig::default(),
        RuntimeDeps {
            store,
            provider: app.provider.clone(),
            wallet: None,
            catalog: StrategyCatalog::new().with_runner("flat", Arc::new(FlatStrategy)),
            clock: app.clock.clone(),
            metrics: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(reloaded.registry().active_series().await.len(), 1);
    assert_eq!(reloaded.registry().active_strategies().await.len(), 1);
}

/// Records each beat and sleeps for a scripted duration.
struct RecordingHandler {
    clock: TokioClock,
    durations: Vec<Duration>,
    failing: HashSet<u64>,
    beats: Mutex<Vec<BeatRecord>>,
}

#[derive(Debug, Clone)]
struct BeatRecord {
    tick: DateTime<Utc>,
    started_wall: DateTime<Utc>,
    started: Instant,
    finished: Instant,
}

impl RecordingHandler {
    fn new(clock: TokioClock, durations: Vec<Duration>) -> Self {
        Self {
            clock,
            durations,
            failing: HashSet::new(),
            beats: Mutex::new(Vec::new()),
        }
    }

    fn records(&self) -> Vec<BeatRecord> {
        self.beats.lock().unwrap().clone()
    }
}

#[async_trait]
impl BeatHandler for RecordingHandler {
    async fn on_beat(&self, beat: u64, tick: DateTime<Utc>, _cancel: &CancellationToken) -> usize {
        let started = Instant::now();
        let started_wall = self.clock.now();
        let duration = self
            .durations
            .get(beat as usize - 1)
            .copied()
            .unwrap_or(Duration::from_secs(1));
        tokio::time::sleep(duration).await;
        self.beats.lock().unwrap().push(BeatRecord {
            tick,
            started_wall,
            started,
            finished: Instant::now(),
        });
        usize::from(self.failing.contains(&beat))
    }
}

fn scheduler_with(handler: Arc<RecordingHandler>, clock: TokioClock, grace: Duration) -> HeartbeatScheduler {
    HeartbeatScheduler::new(TimeAligner::default(), Arc::new(clock), handler, grace)
}

#[tokio::test(start_paused = true)]
async fn beats_never_overlap_and_skip_overrun_boundaries() {
    let clock = TokioClock::starting_at(noon());
    let handler = Arc::new(RecordingHandler::new(
        clock.clone(),
        vec![Duration::from_secs(70)],
    ));
    let scheduler = scheduler_with(handler.clone(), clock, Duration::from_secs(10));

    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(300)).await;
    scheduler.stop().await.unwrap();

    let records = handler.records();
    let ticks: Vec<_> = records.iter().map(|r| r.tick).collect();
    assert_eq!(
        ticks,
        vec![minute(12, 1), minute(12, 3), minute(12, 4), minute(12, 5)]
    );
    for pair in records.windows(2) {
        assert!(pair[1].started >= pair[0].finished, "beats overlapped");
    }
    for record in &records {
        assert_eq!(record.started_wall.second(), 5, "trigger drifted: {}", record.started_wall);
    }

    let stats = scheduler.stats().await;
    assert_eq!(stats.beats_executed, 4);
    assert_eq!(stats.boundaries_skipped, 1);
    assert!(!stats.running);
}

#[tokio::test(start_paused = true)]
async fn stats_count_beats_with_failures() {
    let clock = TokioClock::starting_at(noon());
    let mut handler = RecordingHandler::new(clock.clone(), Vec::new());
    handler.failing.insert(2);
    let handler = Arc::new(handler);
    let scheduler = scheduler_with(handler.clone(), clock, Duration::from_secs(10));

    scheduler.start().await.unwrap();
    assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));
    assert!(scheduler.is_running().await);
    tokio::time::sleep(Duration::from_secs(200)).await;

    let stats = scheduler.stats().await;
    assert_eq!(stats.beats_executed, 3);
    assert_eq!(stats.beats_failed, 1);
    assert!(stats.uptime_seconds >= 200);
    assert_eq!(stats.last_tick, Some(minute(12, 3)));
    scheduler.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_the_current_beat_finish() {
    let clock = TokioClock::starting_at(noon());
    let handler = Arc::new(RecordingHandler::new(
        clock.clone(),
        vec![Duration::from_secs(10)],
    ));
    let scheduler = scheduler_with(handler.clone(), clock, Duration::from_secs(30));

    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(40)).await;
    scheduler.stop().await.unwrap();

    assert_eq!(handler.records().len(), 1);
    assert_eq!(scheduler.stats().await.beats_executed, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cuts_off_a_beat_after_grace() {
    let clock = TokioClock::starting_at(noon());
    let handler = Arc::new(RecordingHandler::new(
        clock.clone(),
        vec![Duration::from_secs(100)],
    ));
    let scheduler = scheduler_with(handler.clone(), clock, Duration::from_secs(2));

    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(40)).await;
    let stopping = Instant::now();
    scheduler.stop().await.unwrap();

    assert!(stopping.elapsed() <= Duration::from_secs(3));
    assert!(handler.records().is_empty());
    assert_eq!(scheduler.stats().await.beats_executed, 0);
}

/// Runs one retried fetch per beat that fails once, then succeeds.
struct RetryingHandler {
    policy: RetryPolicy,
    attempts: AtomicU32,
    outcome: Mutex<Option<Result<(), RetryError<FetchError>>>>,
}

#[async_trait]
impl BeatHandler for RetryingHandler {
    async fn on_beat(&self, _beat: u64, _tick: DateTime<Utc>, cancel: &CancellationToken) -> usize {
        let attempts = &self.attempts;
        let result = self
            .policy
            .run("BTCUSDT fetch", cancel, FetchError::is_transient, || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FetchError::Network("connection reset".to_string()))
                } else {
                    Ok(())
                }
            })
            .await;
        let failed = usize::from(result.is_err());
        *self.outcome.lock().unwrap() = Some(result);
        failed
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_backoff_lets_the_retry_finish() {
    let clock = TokioClock::starting_at(noon());
    let handler = Arc::new(RetryingHandler {
        policy: RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(10), 2.0),
        attempts: AtomicU32::new(0),
        outcome: Mutex::new(None),
    });
    let scheduler = HeartbeatScheduler::new(
        TimeAligner::default(),
        Arc::new(clock),
        handler.clone(),
        Duration::from_secs(30),
    );

    scheduler.start().await.unwrap();
    // First beat fires 35s in; stop half a second into its backoff.
    tokio::time::sleep(Duration::from_millis(35_500)).await;
    scheduler.stop().await.unwrap();

    assert_eq!(handler.attempts.load(Ordering::SeqCst), 2);
    assert!(matches!(*handler.outcome.lock().unwrap(), Some(Ok(()))));
    let stats = scheduler.stats().await;
    assert_eq!(stats.beats_executed, 1);
    assert_eq!(stats.beats_failed, 0);
}

#[tokio::test(start_paused = true)]
async fn uptime_stops_growing_after_stop() {
    let clock = TokioClock::starting_at(noon());
    let handler = Arc::new(RecordingHandler::new(clock.clone(), Vec::new()));
    let scheduler = scheduler_with(handler, clock, Duration::from_secs(10));

    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(100)).await;
    scheduler.stop().await.unwrap();
    let stopped = scheduler.stats().await;

    tokio::time::sleep(Duration::from_secs(600)).await;
    let later = scheduler.stats().await;

    assert!(stopped.uptime_seconds >= 100);
    assert_eq!(later.uptime_seconds, stopped.uptime_seconds);
    assert!(!later.running);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_series_in_sync() {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let shared_store: Arc<dyn Store> = store.clone();
    let runtime = SyncRuntime::build(
        RuntimeConfig {
            retry: RetryPolicy::no_retry(),
            ..RuntimeConfig::default()
        },
        RuntimeDeps {
            store: shared_store,
            provider: provider.clone(),
            wallet: None,
            catalog: StrategyCatalog::new(),
            clock: Arc::new(TokioClock::starting_at(noon())),
            metrics: None,
        },
    )
    .await
    .unwrap();

    runtime.register_series("BTCUSDT").await.unwrap();
    runtime.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(185)).await;
    runtime.stop().await.unwrap();

    let stats = runtime.stats().await;
    assert_eq!(stats.beats_executed, 3);
    assert_eq!(stats.beats_failed, 0);
    let edges = store.edges("BTCUSDT").await.unwrap().unwrap();
    assert_eq!(edges.oldest, minute(11, 54));
    assert_eq!(edges.latest, minute(12, 2));
    assert_eq!(store.count("BTCUSDT").await.unwrap(), 9);
    assert_eq!(provider.price_calls(), 3);
}
