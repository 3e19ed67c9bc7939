//! Strategy run contract and the catalog that binds names to runners.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StrategyError;

/// A strategy's decision step. Takes no input; a runner pulls whatever data
/// it needs itself and returns the target fraction of capital to hold in
/// the base asset.
#[async_trait]
pub trait StrategyRunner: Send + Sync {
    async fn run(&self) -> Result<f64, StrategyError>;
}

/// Always stays out of the market.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatStrategy;

#[async_trait]
impl StrategyRunner for FlatStrategy {
    async fn run(&self) -> Result<f64, StrategyError> {
        Ok(0.0)
    }
}

/// Runners available to registered strategies, keyed by strategy name.
#[derive(Clone, Default)]
pub struct StrategyCatalog {
    runners: BTreeMap<String, Arc<dyn StrategyRunner>>,
}

impl StrategyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runner(mut self, name: impl Into<String>, runner: Arc<dyn StrategyRunner>) -> Self {
        self.insert(name, runner);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, runner: Arc<dyn StrategyRunner>) {
        self.runners.insert(name.into(), runner);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn StrategyRunner>> {
        self.runners.get(name).cloned()
    }
}
