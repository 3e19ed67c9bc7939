//! HTTP endpoint server using Axum

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};

use crate::core::runtime::SyncRuntime;
use crate::error::{FetchError, RegistryError};
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<RwLock<HealthStatus>>,
    pub metrics: Arc<Metrics>,
    pub start_time: Arc<Instant>,
    pub runtime: Option<Arc<SyncRuntime>>,
}

#[derive(Clone, Debug)]
pub struct HealthStatus {
    pub status: String,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<T, ApiError>;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn runtime(state: &AppState) -> ApiResult<&Arc<SyncRuntime>> {
    state
        .runtime
        .as_ref()
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "sync runtime not available"))
}

fn registry_error(e: RegistryError) -> ApiError {
    let status = match &e {
        RegistryError::UnknownSeries(_) => StatusCode::NOT_FOUND,
        RegistryError::SeriesAlreadyActive(_)
        | RegistryError::SeriesInUse { .. }
        | RegistryError::StrategyExists(_) => StatusCode::CONFLICT,
        RegistryError::SeriesInactive(_)
        | RegistryError::InvalidFrequency
        | RegistryError::NoRunner(_)
        | RegistryError::Fetch(FetchError::UnknownInstrument(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        RegistryError::Fetch(_) => StatusCode::BAD_GATEWAY,
        RegistryError::Store(_) => {
            error!(error = %e, "Store failure while handling request");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, e.to_string())
}

pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let health = state.health.read().await;
    let uptime_seconds = state.start_time.elapsed().as_secs();
    Ok(Json(json!({
        "status": health.status,
        "uptime_seconds": uptime_seconds,
        "service": "candlekeeper"
    })))
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .export()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Middleware to track HTTP request metrics
async fn metrics_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    state.metrics.http_requests_in_flight.inc();
    let response = next.run(request).await;
    let status = response.status();
    let duration = start.elapsed();
    state.metrics.http_requests_in_flight.dec();

    state.metrics.http_requests_total.inc();
    state
        .metrics
        .http_request_duration_seconds
        .observe(duration.as_secs_f64());

    if status.is_server_error() {
        tracing::error!(
            method = %method,
            path = %path,
            status = %status,
            duration_ms = duration.as_millis(),
            "HTTP request error"
        );
    }

    response
}

#[derive(Debug, Deserialize)]
struct RegisterSeriesRequest {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RegisterStrategyRequest {
    name: String,
    series_id: String,
    frequency: u32,
}

#[derive(Debug, Deserialize)]
struct CandleQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

async fn list_series(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let runtime = runtime(&state)?;
    Ok(Json(json!(runtime.registry().list_series().await)))
}

async fn register_series(
    State(state): State<AppState>,
    Json(request): Json<RegisterSeriesRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let runtime = runtime(&state)?;
    if request.id.trim().is_empty() {
        return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, "series id must not be empty"));
    }
    let registration = runtime
        .register_series(&request.id)
        .await
        .map_err(registry_error)?;
    Ok((StatusCode::CREATED, Json(json!(registration))))
}

async fn get_series(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let runtime = runtime(&state)?;
    let series = runtime
        .registry()
        .series(&id)
        .await
        .ok_or_else(|| registry_error(RegistryError::UnknownSeries(id.clone())))?;
    let backfill = runtime.backfill_status(&id).await.map_err(registry_error)?;
    Ok(Json(json!({ "series": series, "backfill": backfill })))
}

async fn deactivate_series(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let runtime = runtime(&state)?;
    let series = runtime.deactivate_series(&id).await.map_err(registry_error)?;
    Ok(Json(json!(series)))
}

async fn backfill_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let runtime = runtime(&state)?;
    let status = runtime.backfill_status(&id).await.map_err(registry_error)?;
    Ok(Json(json!(status)))
}

/// Stored candles for a series; the last hour when no range is given.
async fn series_candles(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CandleQuery>,
) -> ApiResult<Json<Value>> {
    let runtime = runtime(&state)?;
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - ChronoDuration::hours(1));
    if from > to {
        return Err(api_error(StatusCode::BAD_REQUEST, "'from' must not be after 'to'"));
    }
    let candles = runtime.candles(&id, from, to).await.map_err(registry_error)?;
    Ok(Json(json!(candles)))
}

async fn list_strategies(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let runtime = runtime(&state)?;
    Ok(Json(json!(runtime.registry().list_strategies().await)))
}

async fn register_strategy(
    State(state): State<AppState>,
    Json(request): Json<RegisterStrategyRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let runtime = runtime(&state)?;
    let strategy = runtime
        .register_strategy(&request.name, &request.series_id, request.frequency)
        .await
        .map_err(registry_error)?;
    Ok((StatusCode::CREATED, Json(json!(strategy))))
}

async fn heartbeat_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let runtime = runtime(&state)?;
    Ok(Json(json!(runtime.stats().await)))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/series", get(list_series).post(register_series))
        .route("/api/series/{id}", get(get_series).delete(deactivate_series))
        .route("/api/series/{id}/backfill", get(backfill_status))
        .route("/api/series/{id}/candles", get(series_candles))
        .route("/api/strategies", get(list_strategies).post(register_strategy))
        .route("/api/stats", get(heartbeat_stats))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    metrics_middleware,
                ))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn start_server(
    port: u16,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!(port = port, "HTTP server listening on port {}", port);
    info!(
        "Metrics endpoint available at http://0.0.0.0:{}/metrics",
        port
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
