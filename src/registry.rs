//! In-memory view of registered series and strategies, written through to
//! the catalog store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::db::{CatalogStore, Store};
use crate::error::{RegistryError, StoreError};
use crate::models::{Series, Strategy};
use crate::strategies::{StrategyCatalog, StrategyRunner};

/// A registered strategy with the runner that executes it.
#[derive(Clone)]
pub struct StrategyEntry {
    pub strategy: Strategy,
    pub runner: Arc<dyn StrategyRunner>,
}

pub struct Registry {
    store: Arc<dyn Store>,
    series: RwLock<BTreeMap<String, Series>>,
    strategies: RwLock<BTreeMap<String, StrategyEntry>>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            series: RwLock::new(BTreeMap::new()),
            strategies: RwLock::new(BTreeMap::new()),
        }
    }

    /// Rebuild the registry from the catalog. Persisted strategies without a
    /// runner in `catalog` are kept out of dispatch and logged.
    pub async fn load(store: Arc<dyn Store>, catalog: &StrategyCatalog) -> Result<Self, StoreError> {
        let registry = Self::new(store.clone());

        let series = store.load_series().await?;
        {
            let mut map = registry.series.write().await;
            for s in series {
                map.insert(s.id.clone(), s);
            }
        }

        let strategies = store.load_strategies().await?;
        {
            let mut map = registry.strategies.write().await;
            for strategy in strategies {
                match catalog.resolve(&strategy.name) {
                    Some(runner) => {
                        map.insert(strategy.name.clone(), StrategyEntry { strategy, runner });
                    }
                    None => warn!(
                        strategy = %strategy.name,
                        "Registry: no runner for persisted strategy {}, it will not be dispatched",
                        strategy.name
                    ),
                }
            }
        }

        info!(
            series = registry.series.read().await.len(),
            strategies = registry.strategies.read().await.len(),
            "Registry: loaded catalog"
        );
        Ok(registry)
    }

    /// Add a series, or reactivate a deactivated one. Fails when the series
    /// is already active.
    pub async fn add_series(&self, id: &str, now: DateTime<Utc>) -> Result<Series, RegistryError> {
        let mut map = self.series.write().await;
        let series = match map.get(id) {
            Some(existing) if existing.active => {
                return Err(RegistryError::SeriesAlreadyActive(id.to_string()));
            }
            Some(existing) => {
                let mut reactivated = existing.clone();
                reactivated.active = true;
                reactivated
            }
            None => Series::new(id, now),
        };
        self.store.upsert_series(&series).await?;
        map.insert(series.id.clone(), series.clone());
        Ok(series)
    }

    /// Soft-deactivate a series. Refused while an active strategy uses it.
    pub async fn deactivate_series(&self, id: &str) -> Result<Series, RegistryError> {
        let strategies = self.strategies.read().await;
        let mut map = self.series.write().await;

        let series = map
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownSeries(id.to_string()))?;
        if let Some(entry) = strategies
            .values()
            .find(|e| e.strategy.active && e.strategy.series_id == id)
        {
            return Err(RegistryError::SeriesInUse {
                series: id.to_string(),
                strategy: entry.strategy.name.clone(),
            });
        }

        let mut updated = series.clone();
        updated.active = false;
        self.store.upsert_series(&updated).await?;
        *series = updated.clone();
        Ok(updated)
    }

    /// Register a strategy on an active series and create its flat state.
    pub async fn add_strategy(
        &self,
        name: &str,
        series_id: &str,
        frequency: u32,
        runner: Arc<dyn StrategyRunner>,
        now: DateTime<Utc>,
    ) -> Result<Strategy, RegistryError> {
        if frequency == 0 {
            return Err(RegistryError::InvalidFrequency);
        }

        let mut strategies = self.strategies.write().await;
        if strategies.contains_key(name) {
            return Err(RegistryError::StrategyExists(name.to_string()));
        }

        {
            let series = self.series.read().await;
            match series.get(series_id) {
                None => return Err(RegistryError::UnknownSeries(series_id.to_string())),
                Some(s) if !s.active => {
                    return Err(RegistryError::SeriesInactive(series_id.to_string()))
                }
                Some(_) => {}
            }
        }

        let strategy = Strategy::new(name, series_id, frequency, now);
        self.store.upsert_strategy(&strategy).await?;
        self.store.init_strategy_state(name).await?;
        strategies.insert(
            name.to_string(),
            StrategyEntry {
                strategy: strategy.clone(),
                runner,
            },
        );
        Ok(strategy)
    }

    pub async fn series(&self, id: &str) -> Option<Series> {
        self.series.read().await.get(id).cloned()
    }

    pub async fn list_series(&self) -> Vec<Series> {
        self.series.read().await.values().cloned().collect()
    }

    pub async fn active_series(&self) -> Vec<Series> {
        self.series
            .read()
            .await
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect()
    }

    pub async fn list_strategies(&self) -> Vec<Strategy> {
        self.strategies
            .read()
            .await
            .values()
            .map(|e| e.strategy.clone())
            .collect()
    }

    pub async fn active_strategies(&self) -> Vec<StrategyEntry> {
        self.strategies
            .read()
            .await
            .values()
            .filter(|e| e.strategy.active)
            .cloned()
            .collect()
    }

    /// Store the latest ticker price on the series row.
    pub async fn record_price(
        &self,
        id: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store.update_last_price(id, price, at).await?;
        if let Some(series) = self.series.write().await.get_mut(id) {
            series.last_price = Some(price);
            series.last_price_at = Some(at);
        }
        Ok(())
    }
}
