//! Market-data pipeline: cached live candle fetches plus CSV loading for the
//! backtester.
//!
//! `get_candles` is the Trading Loop's single entry point: it tries the
//! Redis cache, falls through to the exchange on a miss, and writes the
//! fresh result back. Any Redis failure degrades silently to direct
//! exchange calls rather than surfacing as an error — the cache is a
//! latency optimization, not a dependency.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tracing::warn;

use crate::config::RedisConfig;
use crate::exchange::{ExchangeClient, ExchangeError};
use crate::types::{Candle, Symbol};

/// Thin wrapper over a Redis connection manager; `None` means caching is
/// disabled (connect failed at startup, or the config points nowhere).
pub struct CandleCache {
    conn: Option<ConnectionManager>,
    key_prefix: String,
    ttl_seconds: u64,
}

impl CandleCache {
    /// Attempt to connect; never fails the caller, only logs and disables
    /// caching for the life of the process.
    pub async fn connect(config: &RedisConfig) -> Self {
        let conn = match redis::Client::open(config.url.as_str()) {
            Ok(client) => match client.get_connection_manager().await {
                Ok(manager) => Some(manager),
                Err(e) => {
                    warn!(error = %e, "redis connection failed, running without candle cache");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "invalid redis url, running without candle cache");
                None
            }
        };
        CandleCache {
            conn,
            key_prefix: config.key_prefix.clone(),
            ttl_seconds: config.ttl_seconds,
        }
    }

    fn key(&self, symbol: &Symbol, timeframe: &str, limit: usize) -> String {
        format!(
            "{}ohlcv:{}:{}:{}",
            self.key_prefix,
            symbol.as_str(),
            timeframe,
            limit
        )
    }

    async fn read(&mut self, symbol: &Symbol, timeframe: &str, limit: usize) -> Option<Vec<Candle>> {
        let conn = self.conn.as_mut()?;
        let key = self.key(symbol, timeframe, limit);
        match redis::cmd("GET").arg(&key).query_async::<_, Option<String>>(conn).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(candles) => Some(candles),
                Err(e) => {
                    warn!(error = %e, %key, "corrupt candle cache entry, ignoring");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, %key, "redis read failed, falling back to live fetch");
                None
            }
        }
    }

    async fn write(&mut self, symbol: &Symbol, timeframe: &str, limit: usize, candles: &[Candle]) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let key = self.key(symbol, timeframe, limit);
        let json = match serde_json::to_string(candles) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize candles for cache write");
                return;
            }
        };
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(&key)
            .arg(json)
            .arg("EX")
            .arg(self.ttl_seconds)
            .query_async(conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, %key, "redis write failed, continuing without cache update");
        }
    }
}

/// Fetch `limit` candles for `symbol`/`timeframe`, preferring the cache.
/// On a cache miss, fetches live and refreshes the cache; on a live
/// fetch failure, falls back to a (possibly stale) cache entry if present.
pub async fn get_candles(
    cache: &mut CandleCache,
    client: &ExchangeClient,
    symbol: &Symbol,
    timeframe: &str,
    limit: usize,
) -> Result<Vec<Candle>, ExchangeError> {
    if let Some(cached) = cache.read(symbol, timeframe, limit).await {
        return Ok(cached);
    }

    match client.fetch_ohlcv(symbol.as_str(), timeframe, limit).await {
        Ok(candles) => {
            cache.write(symbol, timeframe, limit, &candles).await;
            Ok(candles)
        }
        Err(e) => {
            if let Some(stale) = cache.read(symbol, timeframe, limit).await {
                warn!(%symbol, error = %e, "live fetch failed, serving stale cache entry");
                return Ok(stale);
            }
            Err(e)
        }
    }
}

/// Load OHLCV data from a CSV file (`timestamp_ms,open,high,low,close,volume`
/// header), used by the Backtester. Rows are validated as they're read.
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("failed to open CSV file")?;
    let mut candles = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("failed to read row {}", row_idx + 1))?;

        let timestamp_ms: i64 = record
            .get(0)
            .context("missing timestamp column")?
            .parse()
            .context("failed to parse timestamp_ms")?;
        let open: f64 = record.get(1).context("missing open column")?.parse()?;
        let high: f64 = record.get(2).context("missing high column")?.parse()?;
        let low: f64 = record.get(3).context("missing low column")?.parse()?;
        let close: f64 = record.get(4).context("missing close column")?.parse()?;
        let volume: f64 = record.get(5).context("missing volume column")?.parse()?;

        let candle = Candle::new(timestamp_ms, open, high, low, close, volume)
            .with_context(|| format!("invalid OHLCV row {}", row_idx + 1))?;
        candles.push(candle);
    }

    Ok(candles)
}

/// Load one CSV per symbol from `data_dir/{symbol}_{timeframe}.csv`, used by
/// the multi-symbol Backtester.
pub fn load_multi_symbol(
    data_dir: impl AsRef<Path>,
    symbols: &[Symbol],
    timeframe: &str,
) -> Result<HashMap<Symbol, Vec<Candle>>> {
    let mut data = HashMap::new();
    for symbol in symbols {
        let filename = format!("{}_{}.csv", symbol.as_str().replace('/', "-"), timeframe);
        let path = data_dir.as_ref().join(&filename);
        let candles =
            load_csv(&path).with_context(|| format!("failed to load data for {symbol}"))?;
        data.insert(symbol.clone(), candles);
    }
    if data.is_empty() {
        anyhow::bail!("no data loaded for any symbol");
    }
    Ok(data)
}

/// Parse a backtest `--start`/`--end` bound: bare `YYYY-MM-DD` is treated as
/// UTC midnight for `--start` and end-of-day for `--end`; anything else is
/// parsed as RFC 3339 (with a trailing `Z` normalized for chrono).
pub fn parse_bound(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let time = if end_of_day {
            chrono::NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap()
        } else {
            chrono::NaiveTime::MIN
        };
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(
            date.and_time(time),
            Utc,
        ));
    }
    raw.parse::<DateTime<Utc>>()
        .with_context(|| format!("failed to parse timestamp: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bound_date_only_start_is_midnight() {
        let dt = parse_bound("2024-01-05", false).unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-01-05T00:00:00+00:00");
    }

    #[test]
    fn parse_bound_date_only_end_is_end_of_day() {
        let dt = parse_bound("2024-01-05", true).unwrap();
        assert_eq!(dt.format("%H:%M:%S").to_string(), "23:59:59");
    }

    #[test]
    fn parse_bound_accepts_rfc3339() {
        let dt = parse_bound("2024-01-05T12:30:00Z", false).unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-01-05T12:30:00+00:00");
    }
}
