//! External data sources and the backfill routine built on them.

pub mod backfill;
pub mod binance;
pub mod market_data;
pub mod wallet;

pub use backfill::{BackfillReport, BackfillService, BackfillStatus};
pub use binance::BinanceRestClient;
pub use market_data::{MarketDataProvider, PriceTick};
pub use wallet::WalletSource;
