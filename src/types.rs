//! Core data types used across the trading system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for candle data
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        timestamp_ms: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            timestamp_ms,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    /// Create a candle without validation (trusted sources, e.g. exchange responses
    /// that are re-validated by the caller, or synthetic data in tests)
    pub fn new_unchecked(
        timestamp_ms: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp_ms,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms).unwrap_or_default()
    }

    /// Validate the candle data: `low <= min(open, close) <= max(open, close) <= high`, `volume >= 0`
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(CandleValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Trading pair symbol using Arc<str> for cheap cloning.
///
/// Symbols are frequently cloned when passed to the signal engine, risk
/// governor, and positions. Using `Arc<str>` instead of `String` reduces
/// heap allocations from O(n) to O(1) per clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

/// Error parsing a "BASE/QUOTE" symbol string.
#[derive(Debug, Error)]
#[error("invalid symbol '{0}': expected uppercase BASE/QUOTE with both sides non-empty")]
pub struct SymbolParseError(pub String);

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse and validate a "BASE/QUOTE" symbol: uppercase, both sides non-empty.
    pub fn parse(s: impl AsRef<str>) -> Result<Self, SymbolParseError> {
        let s = s.as_ref();
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| SymbolParseError(s.to_string()))?;
        if base.is_empty() || quote.is_empty() || s != s.to_uppercase() {
            return Err(SymbolParseError(s.to_string()));
        }
        Ok(Symbol::new(s))
    }

    pub fn base(&self) -> &str {
        self.0.split_once('/').map(|(b, _)| b).unwrap_or(&self.0)
    }

    pub fn quote(&self) -> &str {
        self.0.split_once('/').map(|(_, q)| q).unwrap_or("")
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// An open long-only spot holding of a single symbol.
///
/// At most one `Position` exists per symbol at a time (enforced by the
/// caller, which keys a `HashMap<Symbol, Position>`). Created by an
/// execution backend on a buy fill; mutated only by partial close (amount
/// and entry fee pro-rated); removed on full close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub amount: f64,
    pub entry_price: f64,
    pub entry_timestamp_ms: i64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_fee: f64,
}

/// Outcome of the signal engine's classification of a candle window.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Buy { reason: String },
    Sell { reason: String },
    Hold { reason: String },
}

impl Signal {
    pub fn buy(reason: impl Into<String>) -> Self {
        Signal::Buy {
            reason: reason.into(),
        }
    }

    pub fn sell(reason: impl Into<String>) -> Self {
        Signal::Sell {
            reason: reason.into(),
        }
    }

    pub fn hold(reason: impl Into<String>) -> Self {
        Signal::Hold {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Signal::Buy { reason } | Signal::Sell { reason } | Signal::Hold { reason } => reason,
        }
    }
}

/// Execution mode a trade or trading loop is running under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Paper,
    Live,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Paper => write!(f, "paper"),
            Mode::Live => write!(f, "live"),
        }
    }
}

/// Uniform fill contract produced by every execution backend, real or simulated.
#[derive(Debug, Clone, Copy)]
pub struct Fill {
    pub amount: f64,
    pub price: f64,
    pub fee_quote: f64,
    pub order_id: Option<u64>,
}

/// Append-only event emitted per fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp_ms: i64,
    pub symbol: Symbol,
    pub side: Side,
    pub amount: f64,
    pub price: f64,
    pub fee: f64,
    pub pnl: f64,
    pub reason: String,
    pub mode: Mode,
    pub order_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_validates_ohlc_invariant() {
        assert!(Candle::new(0, 100.0, 110.0, 95.0, 105.0, 10.0).is_ok());
        assert!(Candle::new(0, 100.0, 90.0, 95.0, 105.0, 10.0).is_err());
        assert!(Candle::new(0, 120.0, 110.0, 95.0, 105.0, 10.0).is_err());
        assert!(Candle::new(0, 100.0, 110.0, 95.0, 120.0, 10.0).is_err());
        assert!(Candle::new(0, 100.0, 110.0, 95.0, 105.0, -1.0).is_err());
    }

    #[test]
    fn symbol_parse_requires_uppercase_base_quote() {
        assert!(Symbol::parse("BTC/USDT").is_ok());
        assert!(Symbol::parse("btc/usdt").is_err());
        assert!(Symbol::parse("BTCUSDT").is_err());
        assert!(Symbol::parse("/USDT").is_err());

        let sym = Symbol::parse("BTC/USDT").unwrap();
        assert_eq!(sym.base(), "BTC");
        assert_eq!(sym.quote(), "USDT");
    }
}
