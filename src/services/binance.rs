//! Binance spot REST client for one-minute klines and ticker prices.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::FetchError;
use crate::models::Candle;
use crate::services::market_data::{MarketDataProvider, PriceTick};

/// Klines returned per request by the exchange at most.
pub const KLINES_PAGE_LIMIT: i64 = 1000;

const INVALID_SYMBOL_CODE: i64 = -1121;

pub struct BinanceRestClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

impl BinanceRestClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, FetchError> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// `BTC/USDT` and `BTCUSDT` name the same market.
    pub fn exchange_symbol(series: &str) -> String {
        series.replace('/', "").to_ascii_uppercase()
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(target: "exchange", url = %url, "GET {}", path);

        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| FetchError::Decode(e.to_string()));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, &body))
    }

    fn transport_error(&self, error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Network(error.to_string())
        }
    }

    async fn fetch_klines_page(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FetchError> {
        let payload = self
            .get(
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", "1m".to_string()),
                    ("startTime", from.timestamp_millis().to_string()),
                    ("endTime", to.timestamp_millis().to_string()),
                    ("limit", KLINES_PAGE_LIMIT.to_string()),
                ],
            )
            .await?;

        let rows = payload
            .as_array()
            .ok_or_else(|| FetchError::Decode("klines payload is not an array".to_string()))?;
        rows.iter().map(parse_kline).collect()
    }
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> FetchError {
    let api_error = serde_json::from_str::<ApiError>(body).ok();
    let message = api_error
        .as_ref()
        .map(|e| e.msg.clone())
        .unwrap_or_else(|| body.to_string());

    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => {
            FetchError::RateLimited { retry_after }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Auth(message),
        StatusCode::BAD_REQUEST
            if api_error.as_ref().map(|e| e.code) == Some(INVALID_SYMBOL_CODE) =>
        {
            FetchError::UnknownInstrument(message)
        }
        _ => FetchError::Exchange {
            status: Some(status.as_u16()),
            message,
        },
    }
}

fn parse_number(value: &Value, field: &str) -> Result<f64, FetchError> {
    match value {
        Value::String(s) => s
            .parse()
            .map_err(|_| FetchError::Decode(format!("{} is not numeric: {}", field, s))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| FetchError::Decode(format!("{} out of range", field))),
        _ => Err(FetchError::Decode(format!("{} has unexpected type", field))),
    }
}

/// `[openTime, open, high, low, close, volume, closeTime, ...]`
fn parse_kline(row: &Value) -> Result<Candle, FetchError> {
    let fields = row
        .as_array()
        .filter(|f| f.len() >= 6)
        .ok_or_else(|| FetchError::Decode("kline row has fewer than 6 fields".to_string()))?;

    let open_time = fields[0]
        .as_i64()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| FetchError::Decode("kline open time is invalid".to_string()))?;

    Ok(Candle::new(
        parse_number(&fields[1], "open")?,
        parse_number(&fields[2], "high")?,
        parse_number(&fields[3], "low")?,
        parse_number(&fields[4], "close")?,
        parse_number(&fields[5], "volume")?,
        open_time,
    ))
}

#[async_trait]
impl MarketDataProvider for BinanceRestClient {
    async fn fetch_candles(
        &self,
        series: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FetchError> {
        let symbol = Self::exchange_symbol(series);
        let mut candles = Vec::new();
        let mut cursor = from;

        while cursor <= to {
            let page = self.fetch_klines_page(&symbol, cursor, to).await?;
            let Some(last) = page.last().map(|c| c.timestamp) else {
                break;
            };
            let full_page = page.len() as i64 >= KLINES_PAGE_LIMIT;
            candles.extend(page);
            if !full_page {
                break;
            }
            cursor = last + chrono::Duration::minutes(1);
        }

        debug!(
            target: "exchange",
            series = %series,
            count = candles.len(),
            "fetched {} klines for {}",
            candles.len(),
            series
        );
        Ok(candles)
    }

    async fn fetch_current_prices(
        &self,
        series: &[String],
    ) -> Result<HashMap<String, PriceTick>, FetchError> {
        if series.is_empty() {
            return Ok(HashMap::new());
        }

        let by_symbol: HashMap<String, &String> = series
            .iter()
            .map(|s| (Self::exchange_symbol(s), s))
            .collect();
        let symbols: Vec<&String> = by_symbol.keys().collect();
        let symbols_param =
            serde_json::to_string(&symbols).map_err(|e| FetchError::Decode(e.to_string()))?;

        let payload = self
            .get("/api/v3/ticker/price", &[("symbols", symbols_param)])
            .await?;
        let tickers: Vec<TickerPrice> =
            serde_json::from_value(payload).map_err(|e| FetchError::Decode(e.to_string()))?;

        let observed_at = Utc::now();
        let mut prices = HashMap::with_capacity(tickers.len());
        for ticker in tickers {
            let Some(series_id) = by_symbol.get(&ticker.symbol) else {
                continue;
            };
            let price = ticker
                .price
                .parse::<f64>()
                .map_err(|_| FetchError::Decode(format!("price for {} is not numeric", ticker.symbol)))?;
            prices.insert((*series_id).clone(), PriceTick { price, observed_at });
        }
        Ok(prices)
    }

    async fn has_instrument(&self, series: &str) -> Result<bool, FetchError> {
        let symbol = Self::exchange_symbol(series);
        match self
            .get("/api/v3/exchangeInfo", &[("symbol", symbol.clone())])
            .await
        {
            Ok(info) => Ok(info["symbols"]
                .as_array()
                .map(|symbols| symbols.iter().any(|s| s["symbol"] == symbol.as_str()))
                .unwrap_or(false)),
            Err(FetchError::UnknownInstrument(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
