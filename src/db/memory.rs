//! In-process store used when no database is configured, and in tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{CatalogStore, PriceStore};
use crate::core::clock::floor_minute;
use crate::error::StoreError;
use crate::models::{Candle, Series, StoreEdges, Strategy, StrategyState, WalletSnapshot};

#[derive(Default)]
pub struct MemoryStore {
    candles: RwLock<HashMap<String, BTreeMap<DateTime<Utc>, Candle>>>,
    series: RwLock<BTreeMap<String, Series>>,
    strategies: RwLock<BTreeMap<String, Strategy>>,
    states: RwLock<HashMap<String, StrategyState>>,
    snapshots: RwLock<Vec<WalletSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wallet snapshots recorded so far, oldest first.
    pub async fn wallet_snapshots(&self) -> Vec<WalletSnapshot> {
        self.snapshots.read().await.clone()
    }
}

#[async_trait]
impl PriceStore for MemoryStore {
    async fn upsert_candles(&self, series: &str, candles: &[Candle]) -> Result<usize, StoreError> {
        if candles.is_empty() {
            return Ok(0);
        }
        let mut all = self.candles.write().await;
        let rows = all.entry(series.to_string()).or_default();
        for candle in candles {
            let key = floor_minute(candle.timestamp);
            let mut row = candle.clone();
            row.timestamp = key;
            rows.insert(key, row);
        }
        Ok(candles.len())
    }

    async fn edges(&self, series: &str) -> Result<Option<StoreEdges>, StoreError> {
        let all = self.candles.read().await;
        let edges = all.get(series).and_then(|rows| {
            let oldest = rows.keys().next()?;
            let latest = rows.keys().next_back()?;
            Some(StoreEdges::new(*oldest, *latest))
        });
        Ok(edges)
    }

    async fn range(
        &self,
        series: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let all = self.candles.read().await;
        Ok(all
            .get(series)
            .map(|rows| rows.range(from..=to).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    async fn latest(&self, series: &str) -> Result<Option<Candle>, StoreError> {
        let all = self.candles.read().await;
        Ok(all
            .get(series)
            .and_then(|rows| rows.values().next_back().cloned()))
    }

    async fn count(&self, series: &str) -> Result<u64, StoreError> {
        let all = self.candles.read().await;
        Ok(all.get(series).map(|rows| rows.len() as u64).unwrap_or(0))
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn upsert_series(&self, series: &Series) -> Result<(), StoreError> {
        self.series
            .write()
            .await
            .insert(series.id.clone(), series.clone());
        Ok(())
    }

    async fn load_series(&self) -> Result<Vec<Series>, StoreError> {
        Ok(self.series.read().await.values().cloned().collect())
    }

    async fn update_last_price(
        &self,
        series: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut all = self.series.write().await;
        let row = all.get_mut(series).ok_or_else(|| StoreError::NotFound {
            kind: "series",
            id: series.to_string(),
        })?;
        row.last_price = Some(price);
        row.last_price_at = Some(at);
        Ok(())
    }

    async fn upsert_strategy(&self, strategy: &Strategy) -> Result<(), StoreError> {
        self.strategies
            .write()
            .await
            .insert(strategy.name.clone(), strategy.clone());
        Ok(())
    }

    async fn load_strategies(&self) -> Result<Vec<Strategy>, StoreError> {
        Ok(self.strategies.read().await.values().cloned().collect())
    }

    async fn init_strategy_state(&self, strategy: &str) -> Result<(), StoreError> {
        self.states
            .write()
            .await
            .entry(strategy.to_string())
            .or_insert_with(|| StrategyState::flat(strategy));
        Ok(())
    }

    async fn strategy_state(&self, strategy: &str) -> Result<Option<StrategyState>, StoreError> {
        Ok(self.states.read().await.get(strategy).cloned())
    }

    async fn save_strategy_state(&self, state: &StrategyState) -> Result<(), StoreError> {
        self.states
            .write()
            .await
            .insert(state.strategy.clone(), state.clone());
        Ok(())
    }

    async fn save_wallet_snapshot(&self, snapshot: &WalletSnapshot) -> Result<(), StoreError> {
        self.snapshots.write().await.push(snapshot.clone());
        Ok(())
    }
}
