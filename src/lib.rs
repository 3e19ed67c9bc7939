//! Keeps local one-minute candle history in sync with an exchange and
//! drives strategies on a wall-clock aligned heartbeat.

pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod services;
pub mod strategies;
