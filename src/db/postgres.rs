//! PostgreSQL-backed store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls, Row};

use super::{CatalogStore, PriceStore};
use crate::error::StoreError;
use crate::models::{Candle, Series, StoreEdges, Strategy, StrategyState, WalletSnapshot};

fn db_err(context: &str, e: tokio_postgres::Error) -> StoreError {
    StoreError::Database(format!("{}: {}", context, e))
}

pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect to Postgres: {}", e)))?;

        // Spawn connection task
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Postgres connection error");
            }
        });

        let db = Self { client };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS series (
                    id TEXT PRIMARY KEY,
                    registered_at TIMESTAMPTZ NOT NULL,
                    active BOOLEAN NOT NULL DEFAULT TRUE,
                    last_price DOUBLE PRECISION,
                    last_price_at TIMESTAMPTZ
                );
                CREATE TABLE IF NOT EXISTS candles (
                    series_id TEXT NOT NULL REFERENCES series(id),
                    ts TIMESTAMPTZ NOT NULL,
                    open DOUBLE PRECISION NOT NULL,
                    high DOUBLE PRECISION NOT NULL,
                    low DOUBLE PRECISION NOT NULL,
                    close DOUBLE PRECISION NOT NULL,
                    volume DOUBLE PRECISION NOT NULL,
                    PRIMARY KEY (series_id, ts)
                );
                CREATE TABLE IF NOT EXISTS strategies (
                    name TEXT PRIMARY KEY,
                    series_id TEXT NOT NULL REFERENCES series(id),
                    frequency INTEGER NOT NULL CHECK (frequency > 0),
                    active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL
                );
                CREATE TABLE IF NOT EXISTS strategy_state (
                    strategy TEXT PRIMARY KEY REFERENCES strategies(name),
                    position DOUBLE PRECISION NOT NULL DEFAULT 0,
                    base_holdings DOUBLE PRECISION NOT NULL DEFAULT 0,
                    quote_holdings DOUBLE PRECISION NOT NULL DEFAULT 0,
                    last_run_at TIMESTAMPTZ
                );
                CREATE TABLE IF NOT EXISTS wallet_snapshots (
                    taken_at TIMESTAMPTZ NOT NULL,
                    balances JSONB NOT NULL
                );",
            )
            .await
            .map_err(|e| db_err("Failed to create schema", e))
    }

    fn candle_from_row(row: &Row) -> Candle {
        Candle {
            timestamp: row.get(0),
            open: row.get(1),
            high: row.get(2),
            low: row.get(3),
            close: row.get(4),
            volume: row.get(5),
        }
    }

    fn series_from_row(row: &Row) -> Series {
        Series {
            id: row.get(0),
            registered_at: row.get(1),
            active: row.get(2),
            last_price: row.get(3),
            last_price_at: row.get(4),
        }
    }

    fn strategy_from_row(row: &Row) -> Strategy {
        let frequency: i32 = row.get(2);
        Strategy {
            name: row.get(0),
            series_id: row.get(1),
            frequency: frequency.max(1) as u32,
            active: row.get(3),
            created_at: row.get(4),
        }
    }
}

#[async_trait]
impl PriceStore for PostgresStore {
    async fn upsert_candles(&self, series: &str, candles: &[Candle]) -> Result<usize, StoreError> {
        if candles.is_empty() {
            return Ok(0);
        }

        // One statement over unnested arrays, so the batch lands atomically.
        let ts: Vec<DateTime<Utc>> = candles
            .iter()
            .map(|c| crate::core::clock::floor_minute(c.timestamp))
            .collect();
        let open: Vec<f64> = candles.iter().map(|c| c.open).collect();
        let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let close: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volume: Vec<f64> = candles.iter().map(|c| c.volume).collect();

        let written = self
            .client
            .execute(
                "INSERT INTO candles (series_id, ts, open, high, low, close, volume)
                 SELECT DISTINCT ON (t.ts) $1, t.ts, t.open, t.high, t.low, t.close, t.volume
                 FROM UNNEST($2::timestamptz[], $3::float8[], $4::float8[], $5::float8[], $6::float8[], $7::float8[])
                      WITH ORDINALITY AS t(ts, open, high, low, close, volume, ord)
                 ORDER BY t.ts, t.ord DESC
                 ON CONFLICT (series_id, ts) DO UPDATE SET
                     open = EXCLUDED.open,
                     high = EXCLUDED.high,
                     low = EXCLUDED.low,
                     close = EXCLUDED.close,
                     volume = EXCLUDED.volume",
                &[&series, &ts, &open, &high, &low, &close, &volume],
            )
            .await
            .map_err(|e| db_err("Failed to upsert candles", e))?;

        Ok(written as usize)
    }

    async fn edges(&self, series: &str) -> Result<Option<StoreEdges>, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT MIN(ts), MAX(ts) FROM candles WHERE series_id = $1",
                &[&series],
            )
            .await
            .map_err(|e| db_err("Failed to query candle edges", e))?;

        let oldest: Option<DateTime<Utc>> = row.get(0);
        let latest: Option<DateTime<Utc>> = row.get(1);
        Ok(oldest.zip(latest).map(|(o, l)| StoreEdges::new(o, l)))
    }

    async fn range(
        &self,
        series: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT ts, open, high, low, close, volume
                 FROM candles
                 WHERE series_id = $1 AND ts >= $2 AND ts <= $3
                 ORDER BY ts ASC",
                &[&series, &from, &to],
            )
            .await
            .map_err(|e| db_err("Failed to query candles", e))?;

        Ok(rows.iter().map(Self::candle_from_row).collect())
    }

    async fn latest(&self, series: &str) -> Result<Option<Candle>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT ts, open, high, low, close, volume
                 FROM candles
                 WHERE series_id = $1
                 ORDER BY ts DESC
                 LIMIT 1",
                &[&series],
            )
            .await
            .map_err(|e| db_err("Failed to query latest candle", e))?;

        Ok(row.as_ref().map(Self::candle_from_row))
    }

    async fn count(&self, series: &str) -> Result<u64, StoreError> {
        let row = self
            .client
            .query_one("SELECT COUNT(*) FROM candles WHERE series_id = $1", &[&series])
            .await
            .map_err(|e| db_err("Failed to count candles", e))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl CatalogStore for PostgresStore {
    async fn upsert_series(&self, series: &Series) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO series (id, registered_at, active, last_price, last_price_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (id) DO UPDATE SET
                     active = EXCLUDED.active,
                     last_price = EXCLUDED.last_price,
                     last_price_at = EXCLUDED.last_price_at",
                &[
                    &series.id,
                    &series.registered_at,
                    &series.active,
                    &series.last_price,
                    &series.last_price_at,
                ],
            )
            .await
            .map_err(|e| db_err("Failed to store series", e))?;
        Ok(())
    }

    async fn load_series(&self) -> Result<Vec<Series>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT id, registered_at, active, last_price, last_price_at
                 FROM series ORDER BY id",
                &[],
            )
            .await
            .map_err(|e| db_err("Failed to load series", e))?;
        Ok(rows.iter().map(Self::series_from_row).collect())
    }

    async fn update_last_price(
        &self,
        series: &str,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE series SET last_price = $2, last_price_at = $3 WHERE id = $1",
                &[&series, &price, &at],
            )
            .await
            .map_err(|e| db_err("Failed to update last price", e))?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                kind: "series",
                id: series.to_string(),
            });
        }
        Ok(())
    }

    async fn upsert_strategy(&self, strategy: &Strategy) -> Result<(), StoreError> {
        let frequency = i32::try_from(strategy.frequency)
            .map_err(|_| StoreError::Database(format!("frequency {} too large", strategy.frequency)))?;
        self.client
            .execute(
                "INSERT INTO strategies (name, series_id, frequency, active, created_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (name) DO UPDATE SET
                     series_id = EXCLUDED.series_id,
                     frequency = EXCLUDED.frequency,
                     active = EXCLUDED.active",
                &[
                    &strategy.name,
                    &strategy.series_id,
                    &frequency,
                    &strategy.active,
                    &strategy.created_at,
                ],
            )
            .await
            .map_err(|e| db_err("Failed to store strategy", e))?;
        Ok(())
    }

    async fn load_strategies(&self) -> Result<Vec<Strategy>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT name, series_id, frequency, active, created_at
                 FROM strategies ORDER BY name",
                &[],
            )
            .await
            .map_err(|e| db_err("Failed to load strategies", e))?;
        Ok(rows.iter().map(Self::strategy_from_row).collect())
    }

    async fn init_strategy_state(&self, strategy: &str) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO strategy_state (strategy) VALUES ($1)
                 ON CONFLICT (strategy) DO NOTHING",
                &[&strategy],
            )
            .await
            .map_err(|e| db_err("Failed to create strategy state", e))?;
        Ok(())
    }

    async fn strategy_state(&self, strategy: &str) -> Result<Option<StrategyState>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT strategy, position, base_holdings, quote_holdings, last_run_at
                 FROM strategy_state WHERE strategy = $1",
                &[&strategy],
            )
            .await
            .map_err(|e| db_err("Failed to load strategy state", e))?;

        Ok(row.map(|row| StrategyState {
            strategy: row.get(0),
            position: row.get(1),
            base_holdings: row.get(2),
            quote_holdings: row.get(3),
            last_run_at: row.get(4),
        }))
    }

    async fn save_strategy_state(&self, state: &StrategyState) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO strategy_state (strategy, position, base_holdings, quote_holdings, last_run_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (strategy) DO UPDATE SET
                     position = EXCLUDED.position,
                     base_holdings = EXCLUDED.base_holdings,
                     quote_holdings = EXCLUDED.quote_holdings,
                     last_run_at = EXCLUDED.last_run_at",
                &[
                    &state.strategy,
                    &state.position,
                    &state.base_holdings,
                    &state.quote_holdings,
                    &state.last_run_at,
                ],
            )
            .await
            .map_err(|e| db_err("Failed to store strategy state", e))?;
        Ok(())
    }

    async fn save_wallet_snapshot(&self, snapshot: &WalletSnapshot) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO wallet_snapshots (taken_at, balances) VALUES ($1, $2)",
                &[&snapshot.taken_at, &snapshot.balances],
            )
            .await
            .map_err(|e| db_err("Failed to store wallet snapshot", e))?;
        Ok(())
    }
}
