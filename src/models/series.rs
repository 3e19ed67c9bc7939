//! Tracked instruments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An instrument whose one-minute history is kept in sync.
///
/// `id` is the exchange symbol (e.g. `BTCUSDT`) and never changes once the
/// series exists. Series are soft-deactivated, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub id: String,
    pub registered_at: DateTime<Utc>,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price_at: Option<DateTime<Utc>>,
}

impl Series {
    pub fn new(id: impl Into<String>, registered_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            registered_at,
            active: true,
            last_price: None,
            last_price_at: None,
        }
    }
}
