//! Configuration management
//!
//! Loads and validates a JSON configuration file, with an environment
//! variable overlay for exchange API credentials.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::types::{Mode, Symbol};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub mode: Mode,
    pub symbols: Vec<String>,
    pub exchange: ExchangeConfig,
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub paper: PaperConfig,
    pub redis: RedisConfig,
    pub sqlite: SqliteConfig,
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Load configuration from a JSON file, overlay API credentials from the
    /// environment, and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("failed to parse config JSON")?;

        if let Ok(api_key) = std::env::var("EXCHANGE_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("EXCHANGE_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn symbols(&self) -> Result<Vec<Symbol>> {
        self.symbols
            .iter()
            .map(|s| Symbol::parse(s).map_err(anyhow::Error::from))
            .collect()
    }

    /// Validate cross-field invariants the type system can't express.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("config.symbols must not be empty");
        }
        let symbols = self.symbols()?;
        let quotes: HashSet<&str> = symbols.iter().map(|s| s.quote()).collect();
        if quotes.len() != 1 {
            bail!(
                "all configured symbols must share exactly one quote currency, got {:?}",
                quotes
            );
        }

        if self.strategy.ohlcv_limit < 50 {
            bail!("strategy.ohlcv_limit must be >= 50");
        }

        if !(0.0..=1.0).contains(&self.risk.max_position_pct) {
            bail!("risk.max_position_pct must be in [0, 1]");
        }
        for (name, pct) in [
            ("risk.stop_loss_pct", self.risk.stop_loss_pct),
            ("risk.take_profit_pct", self.risk.take_profit_pct),
            (
                "risk.daily_drawdown_limit_pct",
                self.risk.daily_drawdown_limit_pct,
            ),
        ] {
            if !(0.0..=1.0).contains(&pct) || pct <= 0.0 {
                bail!("{name} must be in (0, 1]");
            }
        }

        if self.paper.starting_cash_usdt <= 0.0 {
            bail!("paper.starting_cash_usdt must be > 0");
        }
        if !(0.0..=0.01).contains(&self.paper.fee_pct) {
            bail!("paper.fee_pct must be in [0, 0.01]");
        }

        if self.runtime.poll_interval_seconds == 0 {
            bail!("runtime.poll_interval_seconds must be > 0");
        }

        if self.mode == Mode::Live
            && (self.exchange.api_key.is_none() || self.exchange.api_secret.is_none())
        {
            bail!("live mode requires exchange.api_key and exchange.api_secret");
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub testnet: bool,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    pub timeframe: String,
    pub ohlcv_limit: usize,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub volume_ma_period: usize,
    pub volume_spike_mult: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            timeframe: "1h".to_string(),
            ohlcv_limit: 200,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            volume_ma_period: 20,
            volume_spike_mult: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    pub max_position_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub daily_drawdown_limit_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            max_position_pct: 0.1,
            stop_loss_pct: 0.03,
            take_profit_pct: 0.06,
            daily_drawdown_limit_pct: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaperConfig {
    pub starting_cash_usdt: f64,
    pub fee_pct: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        PaperConfig {
            starting_cash_usdt: 10_000.0,
            fee_pct: 0.001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

fn default_key_prefix() -> String {
    "trading:".to_string()
}

fn default_ttl_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordConfig {
    pub webhook_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    pub poll_interval_seconds: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            mode: Mode::Paper,
            symbols: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            exchange: ExchangeConfig {
                name: "binance".to_string(),
                api_key: None,
                api_secret: None,
                testnet: false,
                timeout_ms: 5_000,
            },
            strategy: StrategyConfig::default(),
            risk: RiskConfig::default(),
            paper: PaperConfig::default(),
            redis: RedisConfig {
                url: "redis://127.0.0.1/".to_string(),
                key_prefix: default_key_prefix(),
                ttl_seconds: default_ttl_seconds(),
            },
            sqlite: SqliteConfig {
                path: "trades.db".to_string(),
            },
            discord: None,
            runtime: RuntimeConfig {
                poll_interval_seconds: 60,
                log_level: default_log_level(),
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn mismatched_quote_currencies_rejected() {
        let mut cfg = sample();
        cfg.symbols = vec!["BTC/USDT".to_string(), "ETH/EUR".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn live_mode_requires_credentials() {
        let mut cfg = sample();
        cfg.mode = Mode::Live;
        assert!(cfg.validate().is_err());
        cfg.exchange.api_key = Some("key".to_string());
        cfg.exchange.api_secret = Some("secret".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn ohlcv_limit_below_50_rejected() {
        let mut cfg = sample();
        cfg.strategy.ohlcv_limit = 20;
        assert!(cfg.validate().is_err());
    }
}
