//! Units of work executed on every heartbeat

pub mod context;
pub mod handlers;
pub mod types;
pub mod workflow;

pub use context::JobContext;
pub use types::{BeatReport, PriceRefresh, SeriesSyncResult, WalletOutcome};
pub use workflow::run_beat;
