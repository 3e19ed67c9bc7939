//! Job context for dependency injection

use std::sync::Arc;

use crate::core::clock::Clock;
use crate::core::dispatcher::Dispatcher;
use crate::core::retry::RetryPolicy;
use crate::db::Store;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::services::backfill::BackfillService;
use crate::services::market_data::MarketDataProvider;
use crate::services::wallet::WalletSource;

/// Everything one beat needs, shared by all its units.
///
/// `catch_up` is planned with a zero gap threshold so every beat pulls the
/// minute that just closed.
pub struct JobContext {
    pub provider: Arc<dyn MarketDataProvider>,
    pub wallet: Option<Arc<dyn WalletSource>>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<Registry>,
    pub catch_up: Arc<BackfillService>,
    pub dispatcher: Arc<Dispatcher>,
    pub retry: RetryPolicy,
    pub clock: Arc<dyn Clock>,
    pub metrics: Option<Arc<Metrics>>,
    pub fetch_concurrency: usize,
}
