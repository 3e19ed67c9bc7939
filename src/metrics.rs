//! Prometheus metrics shared by the HTTP layer and the heartbeat.

use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub http_requests_total: IntCounter,
    pub http_request_duration_seconds: Histogram,
    pub http_requests_in_flight: Gauge,
    pub database_connected: Gauge,
    pub beats_total: IntCounter,
    pub beats_failed_total: IntCounter,
    pub beat_duration_seconds: Histogram,
    pub series_fetch_failures_total: IntCounter,
    pub candles_upserted_total: IntCounter,
    pub strategy_runs_total: IntCounter,
    pub strategy_runs_skipped_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total =
            IntCounter::with_opts(Opts::new("http_requests_total", "Total HTTP requests"))?;
        let http_request_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request latency in seconds",
        ))?;
        let http_requests_in_flight = Gauge::with_opts(Opts::new(
            "http_requests_in_flight",
            "HTTP requests currently being served",
        ))?;
        let database_connected = Gauge::with_opts(Opts::new(
            "database_connected",
            "1 when the Postgres store is connected",
        ))?;
        let beats_total = IntCounter::with_opts(Opts::new(
            "heartbeat_beats_total",
            "Heartbeat beats executed",
        ))?;
        let beats_failed_total = IntCounter::with_opts(Opts::new(
            "heartbeat_beats_failed_total",
            "Beats in which at least one unit failed",
        ))?;
        let beat_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("heartbeat_beat_duration_seconds", "Wall time of one beat")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let series_fetch_failures_total = IntCounter::with_opts(Opts::new(
            "series_fetch_failures_total",
            "Per-series fetch units that failed",
        ))?;
        let candles_upserted_total = IntCounter::with_opts(Opts::new(
            "candles_upserted_total",
            "Candle rows written to the store",
        ))?;
        let strategy_runs_total = IntCounter::with_opts(Opts::new(
            "strategy_runs_total",
            "Strategy runs that produced a valid position",
        ))?;
        let strategy_runs_skipped_total = IntCounter::with_opts(Opts::new(
            "strategy_runs_skipped_total",
            "Due strategy runs that failed or were skipped",
        ))?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_requests_in_flight.clone()))?;
        registry.register(Box::new(database_connected.clone()))?;
        registry.register(Box::new(beats_total.clone()))?;
        registry.register(Box::new(beats_failed_total.clone()))?;
        registry.register(Box::new(beat_duration_seconds.clone()))?;
        registry.register(Box::new(series_fetch_failures_total.clone()))?;
        registry.register(Box::new(candles_upserted_total.clone()))?;
        registry.register(Box::new(strategy_runs_total.clone()))?;
        registry.register(Box::new(strategy_runs_skipped_total.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            http_requests_in_flight,
            database_connected,
            beats_total,
            beats_failed_total,
            beat_duration_seconds,
            series_fetch_failures_total,
            candles_upserted_total,
            strategy_runs_total,
            strategy_runs_skipped_total,
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
