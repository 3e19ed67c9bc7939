//! Candlekeeper server
//!
//! Starts the HTTP API and the one-minute heartbeat that keeps registered
//! series in sync and dispatches due strategies.

use std::sync::Arc;
use std::time::Instant;

use candlekeeper::config::Settings;
use candlekeeper::core::clock::SystemClock;
use candlekeeper::core::http::{start_server, AppState, HealthStatus};
use candlekeeper::core::runtime::{RuntimeConfig, RuntimeDeps, SyncRuntime};
use candlekeeper::db::{MemoryStore, PostgresStore, Store};
use candlekeeper::logging::init_logging;
use candlekeeper::metrics::Metrics;
use candlekeeper::services::binance::BinanceRestClient;
use candlekeeper::strategies::{FlatStrategy, StrategyCatalog};
use tokio::signal;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging();
    let settings = Settings::from_env()?;

    info!(
        environment = %settings.environment,
        port = settings.port,
        exchange = %settings.exchange_base_url,
        "Starting candlekeeper"
    );

    let metrics = Arc::new(Metrics::new()?);
    let store: Arc<dyn Store> = match settings.database_url.as_deref() {
        Some(url) => {
            let store = PostgresStore::connect(url).await?;
            metrics.database_connected.set(1.0);
            info!("Postgres store connected");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store (history is lost on restart)");
            Arc::new(MemoryStore::new())
        }
    };

    let provider = Arc::new(BinanceRestClient::new(settings.exchange_base_url.clone())?);
    let catalog = StrategyCatalog::new().with_runner("flat", Arc::new(FlatStrategy));

    let runtime = Arc::new(
        SyncRuntime::build(
            RuntimeConfig::from(&settings),
            RuntimeDeps {
                store,
                provider,
                wallet: None,
                catalog,
                clock: Arc::new(SystemClock),
                metrics: Some(metrics.clone()),
            },
        )
        .await?,
    );

    let shutdown = CancellationToken::new();
    let state = AppState {
        health: Arc::new(RwLock::new(HealthStatus::default())),
        metrics,
        start_time: Arc::new(Instant::now()),
        runtime: Some(runtime.clone()),
    };
    let server_shutdown = shutdown.clone();
    let port = settings.port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(port, state, server_shutdown).await {
            error!(error = %e, "HTTP server error: {}", e);
        }
    });

    runtime.start().await?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = runtime.join() => {
            if let Err(e) = result {
                error!(error = %e, "Heartbeat stopped: {}", e);
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = runtime.stop().await {
        error!(error = %e, "Heartbeat did not stop cleanly: {}", e);
    }
    let _ = server_handle.await;
    info!("Shutdown complete");
    Ok(())
}
