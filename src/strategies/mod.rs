//! Strategy runners and the executor that receives their positions.

pub mod executor;
pub mod runner;

pub use executor::{PositionSink, StateRecorder};
pub use runner::{FlatStrategy, StrategyCatalog, StrategyRunner};
