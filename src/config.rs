//! Process configuration read from the environment.
//!
//! `.env` files are honoured via dotenvy. Every knob has a default so the
//! engine starts with only `DATABASE_URL` unset (in-memory store).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::core::reconciler::BackfillPolicy;
use crate::core::retry::RetryPolicy;
use crate::error::ConfigError;

/// Deployment environment, `sandbox` unless `APP_ENV` says otherwise.
pub fn get_environment() -> String {
    let _ = dotenvy::dotenv();
    env::var("APP_ENV").unwrap_or_else(|_| "sandbox".to_string())
}

/// Postgres connection string, if one is configured.
pub fn get_database_url() -> Option<String> {
    let _ = dotenvy::dotenv();
    env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub environment: String,
    pub database_url: Option<String>,
    pub port: u16,
    pub exchange_base_url: String,
    pub backfill_minutes: i64,
    pub gap_fill_enabled: bool,
    pub gap_fill_threshold_minutes: i64,
    pub max_gap_fill_minutes: i64,
    pub heartbeat_buffer_seconds: i64,
    pub fetch_concurrency: usize,
    pub retry: RetryPolicy,
    pub strategy_run_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: "sandbox".to_string(),
            database_url: None,
            port: 8080,
            exchange_base_url: "https://api.binance.com".to_string(),
            backfill_minutes: 5,
            gap_fill_enabled: true,
            gap_fill_threshold_minutes: 1,
            max_gap_fill_minutes: 1000,
            heartbeat_buffer_seconds: 5,
            fetch_concurrency: 4,
            retry: RetryPolicy::default(),
            strategy_run_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Settings {
    /// Load settings from the process environment (and `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Unset keys fall back to
    /// their defaults; set but unparsable or out-of-range values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let backfill_minutes = parse_or(&lookup, "BACKFILL_MINUTES", defaults.backfill_minutes)?;
        ensure_range("BACKFILL_MINUTES", backfill_minutes, 1, 1000)?;

        let heartbeat_buffer_seconds = parse_or(
            &lookup,
            "HEARTBEAT_BUFFER_SECONDS",
            defaults.heartbeat_buffer_seconds,
        )?;
        ensure_range("HEARTBEAT_BUFFER_SECONDS", heartbeat_buffer_seconds, 0, 30)?;

        let gap_fill_threshold_minutes = parse_or(
            &lookup,
            "GAP_FILL_THRESHOLD_MINUTES",
            defaults.gap_fill_threshold_minutes,
        )?;
        ensure_range("GAP_FILL_THRESHOLD_MINUTES", gap_fill_threshold_minutes, 0, i64::MAX)?;

        let max_gap_fill_minutes =
            parse_or(&lookup, "MAX_GAP_FILL_MINUTES", defaults.max_gap_fill_minutes)?;
        ensure_range("MAX_GAP_FILL_MINUTES", max_gap_fill_minutes, 1, i64::MAX)?;

        let fetch_concurrency: usize =
            parse_or(&lookup, "FETCH_CONCURRENCY", defaults.fetch_concurrency)?;
        if fetch_concurrency == 0 {
            return Err(invalid("FETCH_CONCURRENCY", "must be at least 1"));
        }

        let max_attempts: u32 =
            parse_or(&lookup, "RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid("RETRY_MAX_ATTEMPTS", "must be at least 1"));
        }
        let base_delay_ms: u64 = parse_or(&lookup, "RETRY_BASE_DELAY_MS", 1000)?;
        let max_delay_ms: u64 = parse_or(&lookup, "RETRY_MAX_DELAY_MS", 60_000)?;
        if max_delay_ms < base_delay_ms {
            return Err(invalid(
                "RETRY_MAX_DELAY_MS",
                "must not be smaller than RETRY_BASE_DELAY_MS",
            ));
        }
        let multiplier: f32 = parse_or(&lookup, "RETRY_MULTIPLIER", defaults.retry.multiplier)?;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(invalid("RETRY_MULTIPLIER", "must be a finite number >= 1"));
        }

        let run_timeout_secs: u64 = parse_or(&lookup, "STRATEGY_RUN_TIMEOUT_SECONDS", 30)?;
        if run_timeout_secs == 0 {
            return Err(invalid("STRATEGY_RUN_TIMEOUT_SECONDS", "must be at least 1"));
        }
        let grace_secs: u64 = parse_or(&lookup, "SHUTDOWN_GRACE_SECONDS", 10)?;

        Ok(Self {
            environment: lookup("APP_ENV").unwrap_or(defaults.environment),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            port: parse_or(&lookup, "PORT", defaults.port)?,
            exchange_base_url: lookup("EXCHANGE_BASE_URL").unwrap_or(defaults.exchange_base_url),
            backfill_minutes,
            gap_fill_enabled: parse_bool_or(&lookup, "GAP_FILL_ENABLED", defaults.gap_fill_enabled)?,
            gap_fill_threshold_minutes,
            max_gap_fill_minutes,
            heartbeat_buffer_seconds,
            fetch_concurrency,
            retry: RetryPolicy::new(
                max_attempts,
                Duration::from_millis(base_delay_ms),
                Duration::from_millis(max_delay_ms),
                multiplier,
            ),
            strategy_run_timeout: Duration::from_secs(run_timeout_secs),
            shutdown_grace: Duration::from_secs(grace_secs),
        })
    }

    /// Policy used on registration and at startup.
    pub fn backfill_policy(&self) -> BackfillPolicy {
        BackfillPolicy::from_minutes(
            self.backfill_minutes,
            self.gap_fill_threshold_minutes,
            self.max_gap_fill_minutes,
        )
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

fn parse_or<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, format!("'{}': {}", raw, e))),
        None => Ok(default),
    }
}

fn parse_bool_or<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(invalid(key, format!("'{}' is not a boolean", v))),
    }
}

fn ensure_range(key: &'static str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(invalid(key, format!("{} is outside {}..={}", value, min, max)));
    }
    Ok(())
}
