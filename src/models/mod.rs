//! Shared data models spanning the engine layers.

pub mod candle;
pub mod series;
pub mod strategy;

pub use candle::{Candle, StoreEdges};
pub use series::Series;
pub use strategy::{Strategy, StrategyState, WalletSnapshot};
