//! Account balance source used for per-beat wallet snapshots.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FetchError;

/// Reads account balances. The payload is stored as returned.
#[async_trait]
pub trait WalletSource: Send + Sync {
    async fn balances(&self) -> Result<Value, FetchError>;
}
