//! Persistence contracts and their implementations.
//!
//! The engine only needs an atomic upsert keyed by `(series, minute)` plus
//! edge and range queries. Everything else about the storage engine stays
//! behind these traits.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{Candle, Series, StoreEdges, Strategy, StrategyState, WalletSnapshot};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Time-indexed candle storage keyed by `(series, minute)`.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Insert or overwrite each candle by key. Replaying the same input
    /// leaves the store unchanged. Returns the number of rows written.
    async fn upsert_candles(&self, series: &str, candles: &[Candle]) -> Result<usize, StoreError>;

    /// Oldest and latest stored minute, or `None` for an empty series.
    async fn edges(&self, series: &str) -> Result<Option<StoreEdges>, StoreError>;

    /// Candles with `from <= timestamp <= to`, oldest first.
    async fn range(
        &self,
        series: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError>;

    async fn latest(&self, series: &str) -> Result<Option<Candle>, StoreError>;

    async fn count(&self, series: &str) -> Result<u64, StoreError>;
}

/// Series, strategy and executor-state tables.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn upsert_series(&self, series: &Series) -> Result<(), StoreError>;

    async fn load_series(&self) -> Result<Vec<Series>, StoreError>;

    async fn update_last_price(
        &self,
        series: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn upsert_strategy(&self, strategy: &Strategy) -> Result<(), StoreError>;

    async fn load_strategies(&self) -> Result<Vec<Strategy>, StoreError>;

    /// Create the flat state row for a strategy if it does not exist yet.
    async fn init_strategy_state(&self, strategy: &str) -> Result<(), StoreError>;

    async fn strategy_state(&self, strategy: &str) -> Result<Option<StrategyState>, StoreError>;

    async fn save_strategy_state(&self, state: &StrategyState) -> Result<(), StoreError>;

    async fn save_wallet_snapshot(&self, snapshot: &WalletSnapshot) -> Result<(), StoreError>;
}

/// Everything the engine persists.
pub trait Store: PriceStore + CatalogStore {}

impl<T: PriceStore + CatalogStore> Store for T {}
