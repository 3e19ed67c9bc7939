//! Shared fakes for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use candlekeeper::core::clock::Clock;
use candlekeeper::core::retry::RetryPolicy;
use candlekeeper::core::runtime::{RuntimeConfig, RuntimeDeps, SyncRuntime};
use candlekeeper::db::{MemoryStore, Store};
use candlekeeper::error::FetchError;
use candlekeeper::metrics::Metrics;
use candlekeeper::models::Candle;
use candlekeeper::services::market_data::{MarketDataProvider, PriceTick};
use candlekeeper::services::wallet::WalletSource;
use candlekeeper::strategies::{FlatStrategy, StrategyCatalog};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap()
}

/// Exchange stand-in that has a candle for every minute ever asked for.
#[derive(Default)]
pub struct FakeProvider {
    failing: Mutex<HashSet<String>>,
    unlisted: Mutex<HashSet<String>>,
    requests: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
    price_calls: AtomicU32,
    latency: Mutex<Option<std::time::Duration>>,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every candle fetch for `series` fail with a 503.
    pub fn fail(&self, series: &str) {
        self.failing.lock().unwrap().insert(series.to_string());
    }

    pub fn recover(&self, series: &str) {
        self.failing.lock().unwrap().remove(series);
    }

    pub fn unlist(&self, series: &str) {
        self.unlisted.lock().unwrap().insert(series.to_string());
    }

    pub fn requests_for(&self, series: &str) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| s == series)
            .map(|(_, from, to)| (*from, *to))
            .collect()
    }

    pub fn price_calls(&self) -> u32 {
        self.price_calls.load(Ordering::SeqCst)
    }

    /// Make every candle fetch take `latency` (tokio time).
    pub fn slow_down(&self, latency: std::time::Duration) {
        *self.latency.lock().unwrap() = Some(latency);
        self.peak_in_flight.store(0, Ordering::SeqCst);
    }

    /// Most candle fetches seen running at once since the last `slow_down`.
    pub fn peak_in_flight(&self) -> u32 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataProvider for FakeProvider {
    async fn fetch_candles(
        &self,
        series: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FetchError> {
        self.requests
            .lock()
            .unwrap()
            .push((series.to_string(), from, to));
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            let now_running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now_running, Ordering::SeqCst);
            tokio::time::sleep(latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        if self.failing.lock().unwrap().contains(series) {
            return Err(FetchError::Exchange {
                status: Some(503),
                message: "service unavailable".to_string(),
            });
        }
        let mut candles = Vec::new();
        let mut ts = from;
        while ts <= to {
            let base = (ts.timestamp() / 60 % 1000) as f64;
            candles.push(Candle::new(base, base + 1.0, base - 1.0, base + 0.5, 3.0, ts));
            ts += Duration::minutes(1);
        }
        Ok(candles)
    }

    async fn fetch_current_prices(
        &self,
        series: &[String],
    ) -> Result<HashMap<String, PriceTick>, FetchError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        Ok(series
            .iter()
            .map(|s| {
                (
                    s.clone(),
                    PriceTick {
                        price: 100.0,
                        observed_at: noon(),
                    },
                )
            })
            .collect())
    }

    async fn has_instrument(&self, series: &str) -> Result<bool, FetchError> {
        Ok(!self.unlisted.lock().unwrap().contains(series))
    }
}

pub struct FakeWallet;

#[async_trait]
impl WalletSource for FakeWallet {
    async fn balances(&self) -> Result<Value, FetchError> {
        Ok(json!({ "USDT": { "free": 1000.0, "locked": 0.0 } }))
    }
}

/// A runtime over an in-memory store and [`FakeProvider`].
pub struct TestRuntime {
    pub runtime: Arc<SyncRuntime>,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<Metrics>,
}

impl TestRuntime {
    pub async fn new() -> Self {
        Self::with_config(RuntimeConfig {
            retry: RetryPolicy::no_retry(),
            ..RuntimeConfig::default()
        })
        .await
    }

    pub async fn with_config(config: RuntimeConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FakeProvider::new());
        let clock = Arc::new(ManualClock::at(noon()));
        let metrics = Arc::new(Metrics::new().expect("metrics initialization"));
        let catalog = StrategyCatalog::new().with_runner("flat", Arc::new(FlatStrategy));

        let shared_store: Arc<dyn Store> = store.clone();
        let runtime = SyncRuntime::build(
            config,
            RuntimeDeps {
                store: shared_store,
                provider: provider.clone(),
                wallet: Some(Arc::new(FakeWallet)),
                catalog,
                clock: clock.clone(),
                metrics: Some(metrics.clone()),
            },
        )
        .await
        .expect("runtime builds");

        Self {
            runtime: Arc::new(runtime),
            store,
            provider,
            clock,
            metrics,
        }
    }
}
