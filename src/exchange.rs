//! Live exchange client: a minimal Binance-style spot HTTP connector.
//!
//! Keeps all HTTP calls in one place so retry/error-classification policy is
//! applied uniformly. Candle/order parsing, not a general ccxt replacement.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::types::Candle;

type HmacSha256 = Hmac<Sha256>;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Error taxonomy for exchange calls, mirroring §7: transient errors are
/// retried by `call_with_retry`, business errors surface immediately.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("exchange rejected the request: {0}")]
    Business(String),
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ExchangeClient {
    config: ExchangeConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct OrderResponse {
    pub id: Option<String>,
    pub filled: Option<f64>,
    pub average: Option<f64>,
    pub price: Option<f64>,
    pub fee: Option<FeeEntry>,
    #[serde(default)]
    pub fees: Vec<FeeEntry>,
}

#[derive(Debug, Deserialize)]
pub struct FeeEntry {
    pub cost: f64,
    pub currency: String,
}

impl ExchangeClient {
    pub fn new(config: ExchangeConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        ExchangeClient { config, client }
    }

    fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        let secret = self
            .config
            .api_secret
            .as_deref()
            .ok_or_else(|| ExchangeError::Business("missing api secret".to_string()))?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ExchangeError::Business(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// `GET /api/v3/klines` style candle fetch, retried on transient failure.
    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.config.base_url,
            symbol.replace('/', ""),
            timeframe,
            limit
        );
        call_with_retry(&format!("fetch_ohlcv({symbol})"), || async {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(classify_reqwest_error)?;
            let rows: Vec<RawKline> = response.json().await.map_err(classify_reqwest_error)?;
            Ok(rows
                .into_iter()
                .map(|r| Candle::new_unchecked(r.0, r.1, r.2, r.3, r.4, r.5))
                .collect())
        })
        .await
    }

    pub async fn fetch_free_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let payload = format!("timestamp={timestamp}");
        let signature = self.sign(&payload)?;
        let api_key = self
            .config
            .api_key
            .clone()
            .ok_or_else(|| ExchangeError::Business("missing api key".to_string()))?;
        let url = format!("{}/api/v3/account?{}&signature={}", self.config.base_url, payload, signature);

        call_with_retry("fetch_free_balance", || async {
            let response = self
                .client
                .get(&url)
                .header("X-MBX-APIKEY", &api_key)
                .send()
                .await
                .map_err(classify_reqwest_error)?;
            let account: AccountResponse = response.json().await.map_err(classify_reqwest_error)?;
            Ok(account
                .balances
                .into_iter()
                .find(|b| b.asset == asset)
                .map(|b| b.free)
                .unwrap_or(0.0))
        })
        .await
    }

    pub async fn create_market_buy(
        &self,
        symbol: &str,
        amount: f64,
    ) -> Result<OrderResponse, ExchangeError> {
        self.create_market_order(symbol, "BUY", amount).await
    }

    pub async fn create_market_sell(
        &self,
        symbol: &str,
        amount: f64,
    ) -> Result<OrderResponse, ExchangeError> {
        self.create_market_order(symbol, "SELL", amount).await
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: &str,
        amount: f64,
    ) -> Result<OrderResponse, ExchangeError> {
        let api_key = self
            .config
            .api_key
            .clone()
            .ok_or_else(|| ExchangeError::Business("missing api key".to_string()))?;
        let timestamp = chrono::Utc::now().timestamp_millis();
        let market = symbol.replace('/', "");
        let payload = format!(
            "symbol={market}&side={side}&type=MARKET&quantity={amount}&timestamp={timestamp}"
        );
        let signature = self.sign(&payload)?;
        let url = format!(
            "{}/api/v3/order?{}&signature={}",
            self.config.base_url, payload, signature
        );

        call_with_retry(&format!("create_market_order({symbol},{side})"), || async {
            let response = self
                .client
                .post(&url)
                .header("X-MBX-APIKEY", &api_key)
                .send()
                .await
                .map_err(classify_reqwest_error)?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(ExchangeError::Business(format!(
                    "order rejected ({status}): {body}"
                )));
            }
            response.json().await.map_err(classify_reqwest_error)
        })
        .await
    }
}

/// Round a base amount to the nearest integer multiple of `step_size`
/// (exchange precision rounding, applied before submission).
pub fn round_to_step(amount: f64, step_size: f64) -> f64 {
    if step_size <= 0.0 {
        return amount;
    }
    (amount / step_size).floor() * step_size
}

/// Parse an exchange order response into the uniform Fill shape, converting
/// any base-currency fee into quote currency at the fill price.
pub fn parse_fill(
    order: &OrderResponse,
    quote_currency: &str,
    fallback_amount: f64,
    fallback_price: f64,
) -> crate::types::Fill {
    let amount = order.filled.filter(|f| *f > 0.0).unwrap_or(fallback_amount);
    let price = order
        .average
        .filter(|p| *p > 0.0)
        .or(order.price.filter(|p| *p > 0.0))
        .unwrap_or(fallback_price);

    let mut fee_quote = 0.0;
    let entries: Vec<&FeeEntry> = order
        .fee
        .iter()
        .chain(order.fees.iter())
        .collect();
    for entry in entries {
        if entry.currency == quote_currency {
            fee_quote += entry.cost;
        } else {
            // base-currency (or other-asset) fee: convert at fill price
            fee_quote += entry.cost * price;
        }
    }

    crate::types::Fill {
        amount,
        price,
        fee_quote,
        order_id: order.id.as_ref().and_then(|s| s.parse().ok()),
    }
}

#[derive(Debug, Deserialize)]
struct RawKline(i64, f64, f64, f64, f64, f64);

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<AccountBalance>,
}

#[derive(Debug, Deserialize)]
struct AccountBalance {
    asset: String,
    free: f64,
}

fn classify_reqwest_error(e: reqwest::Error) -> ExchangeError {
    if e.is_timeout() || e.is_connect() {
        ExchangeError::Transient(e.to_string())
    } else {
        ExchangeError::Business(e.to_string())
    }
}

/// Retry transient errors up to `MAX_ATTEMPTS` with exponential backoff
/// (1s, 2s); business errors propagate immediately.
async fn call_with_retry<T, F, Fut>(label: &str, mut op: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExchangeError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(ExchangeError::Transient(msg)) if attempt < MAX_ATTEMPTS => {
                tracing::warn!(attempt, %label, %msg, "transient exchange error, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(other) => return Err(other),
        }
    }
    Err(ExchangeError::Transient(format!(
        "{label} failed after {MAX_ATTEMPTS} attempts"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_currency_fee_is_converted_to_quote() {
        let order = OrderResponse {
            id: Some("1".to_string()),
            filled: Some(1.0),
            average: Some(100.0),
            price: None,
            fee: Some(FeeEntry {
                cost: 0.001,
                currency: "BTC".to_string(),
            }),
            fees: vec![],
        };
        let fill = parse_fill(&order, "USDT", 1.0, 100.0);
        assert_eq!(fill.fee_quote, 0.001 * 100.0);
    }

    #[test]
    fn quote_currency_fee_passes_through() {
        let order = OrderResponse {
            id: None,
            filled: Some(1.0),
            average: Some(100.0),
            price: None,
            fee: Some(FeeEntry {
                cost: 0.1,
                currency: "USDT".to_string(),
            }),
            fees: vec![],
        };
        let fill = parse_fill(&order, "USDT", 1.0, 100.0);
        assert_eq!(fill.fee_quote, 0.1);
    }

    #[test]
    fn round_to_step_floors_to_multiple() {
        assert_eq!(round_to_step(1.23456, 0.001), 1.234);
    }
}
