//! Where validated positions go after a successful run.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::db::{CatalogStore, Store};
use crate::error::StoreError;
use crate::models::{Strategy, StrategyState};

/// Receives the position of every successful strategy run.
#[async_trait]
pub trait PositionSink: Send + Sync {
    async fn apply(
        &self,
        strategy: &Strategy,
        position: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Records the target position in the strategy's state row. Holdings are
/// left to whatever executes orders.
pub struct StateRecorder {
    store: Arc<dyn Store>,
}

impl StateRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PositionSink for StateRecorder {
    async fn apply(
        &self,
        strategy: &Strategy,
        position: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self
            .store
            .strategy_state(&strategy.name)
            .await?
            .unwrap_or_else(|| StrategyState::flat(&strategy.name));
        state.position = position;
        state.last_run_at = Some(at);
        self.store.save_strategy_state(&state).await?;

        debug!(target: "strategy", strategy = %strategy.name, position, "recorded position for {}", strategy.name);
        Ok(())
    }
}
