//! Live trading orchestrator: the async loop that ties market data, the
//! signal engine, risk governance, and an execution backend together.
//!
//! One `TradingLoop` owns one execution backend (paper or live) and runs
//! every configured symbol through the same per-tick sequence: refresh
//! candles, snapshot equity, update the drawdown kill-switch, then for each
//! symbol check stop/take before asking the signal engine for a fresh call.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::data::{get_candles, CandleCache};
use crate::exchange::ExchangeClient;
use crate::execution::{ExecutionBackend, LiveBackend, PaperBackend};
use crate::notify::Notifier;
use crate::risk::RiskGovernor;
use crate::signal::generate_signal;
use crate::state_manager::{Checkpoint, StateManager};
use crate::types::{Mode, Position, Side, Signal, Symbol, TradeRecord};

pub struct TradingLoop {
    config: Config,
    symbols: Vec<Symbol>,
    exchange: ExchangeClient,
    cache: CandleCache,
    state: StateManager,
    notifier: Notifier,
    risk: RiskGovernor,
    backend: Box<dyn ExecutionBackend + Send>,
    positions: HashMap<Symbol, Position>,
}

impl TradingLoop {
    pub async fn new(config: Config) -> Result<Self> {
        let symbols = config.symbols().context("invalid configured symbols")?;
        let exchange_config = crate::exchange::ExchangeConfig {
            base_url: if config.exchange.testnet {
                "https://testnet.binance.vision".to_string()
            } else {
                "https://api.binance.com".to_string()
            },
            api_key: config.exchange.api_key.clone(),
            api_secret: config.exchange.api_secret.clone(),
            timeout_ms: config.exchange.timeout_ms,
        };
        let exchange = ExchangeClient::new(exchange_config.clone());
        let cache = CandleCache::connect(&config.redis).await;
        let state = StateManager::open(&config.sqlite.path)?;
        let notifier = Notifier::new(config.discord.as_ref().map(|d| d.webhook_url.clone()));
        let risk = RiskGovernor::new(config.risk.clone());

        let backend: Box<dyn ExecutionBackend + Send> = match config.mode {
            Mode::Paper => Box::new(PaperBackend::new(
                config.paper.starting_cash_usdt,
                config.paper.fee_pct,
            )),
            Mode::Live => Box::new(LiveBackend {
                client: ExchangeClient::new(exchange_config),
                fee_pct: config.paper.fee_pct,
                quote_currency: symbols[0].quote().to_string(),
                step_size: 0.0,
            }),
        };

        Ok(TradingLoop {
            config,
            symbols,
            exchange,
            cache,
            state,
            notifier,
            risk,
            backend,
            positions: HashMap::new(),
        })
    }

    /// Recover a prior checkpoint, if any: restores the backend's cash
    /// ledger, the risk governor's day-open-equity/halt state, and every
    /// open position, so restarting mid-day resumes rather than starts over.
    pub fn recover(&mut self) -> Result<()> {
        if let Some(checkpoint) = self.state.load_checkpoint()? {
            let checkpoint_date = Utc
                .timestamp_millis_opt(checkpoint.timestamp_ms)
                .single()
                .unwrap_or_else(Utc::now)
                .date_naive();

            self.backend.restore_cash(checkpoint.cash);
            self.risk
                .restore(checkpoint_date, checkpoint.day_open_equity, checkpoint.halted);
            self.positions = checkpoint.positions;

            info!(
                equity = checkpoint.equity,
                cash = checkpoint.cash,
                halted = checkpoint.halted,
                open_positions = self.positions.len(),
                "recovered checkpoint from previous session"
            );
        }
        Ok(())
    }

    pub async fn run(&mut self, once: bool) -> Result<()> {
        self.notifier
            .send(&format!("Trading loop started ({}).", self.config.mode))
            .await;

        loop {
            if let Err(e) = self.tick().await {
                error!(error = %e, "tick failed, continuing");
            }
            if once {
                break;
            }

            let poll = Duration::from_secs(self.config.runtime.poll_interval_seconds);
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn tick(&mut self) -> Result<()> {
        let mut last_prices: HashMap<Symbol, f64> = HashMap::new();
        let mut histories: HashMap<Symbol, Vec<crate::types::Candle>> = HashMap::new();

        for symbol in self.symbols.clone() {
            match get_candles(
                &mut self.cache,
                &self.exchange,
                &symbol,
                &self.config.strategy.timeframe,
                self.config.strategy.ohlcv_limit,
            )
            .await
            {
                Ok(candles) => {
                    if let Some(last) = candles.last() {
                        last_prices.insert(symbol.clone(), last.close);
                    }
                    histories.insert(symbol, candles);
                }
                Err(e) => {
                    warn!(%symbol, error = %e, "failed fetching candles, skipping this tick");
                }
            }
        }

        if histories.is_empty() {
            return Ok(());
        }

        let free_quote = match self.config.mode {
            Mode::Paper => self.backend.cash().unwrap_or(0.0),
            Mode::Live => self
                .exchange
                .fetch_free_balance(self.symbols[0].quote())
                .await
                .unwrap_or(0.0),
        };
        let equity = self.portfolio_equity(free_quote, &last_prices);
        self.risk.update_daily_equity(Utc::now(), equity);

        if self.risk.take_just_halted() {
            self.notifier
                .send(&format!(
                    "Daily drawdown limit reached; halting new entries. Equity=${equity:.2}"
                ))
                .await;
        }

        for symbol in self.symbols.clone() {
            let Some(candles) = histories.get(&symbol) else {
                continue;
            };
            let last_price = last_prices[&symbol];
            self.process_symbol(&symbol, candles, last_price, equity, free_quote)
                .await;
        }

        let cash_after = match self.config.mode {
            Mode::Paper => self.backend.cash().unwrap_or(free_quote),
            Mode::Live => self
                .exchange
                .fetch_free_balance(self.symbols[0].quote())
                .await
                .unwrap_or(free_quote),
        };
        let checkpoint = Checkpoint {
            timestamp_ms: now_ms(),
            equity: self.portfolio_equity(cash_after, &last_prices),
            cash: cash_after,
            day_open_equity: self.risk.day_open_equity(),
            halted: self.risk.halted(),
            positions: self.positions.clone(),
        };
        if let Err(e) = self.state.save_checkpoint(&checkpoint) {
            warn!(error = %e, "failed to persist checkpoint");
        }

        Ok(())
    }

    /// `cash` is the free-quote balance (paper ledger or exchange account);
    /// equity adds the mark-to-market value of every open position on top.
    fn portfolio_equity(&self, cash: f64, last_prices: &HashMap<Symbol, f64>) -> f64 {
        let mut equity = cash;
        for (symbol, position) in &self.positions {
            let price = last_prices.get(symbol).copied().unwrap_or(position.entry_price);
            equity += position.amount * price;
        }
        equity
    }

    async fn process_symbol(
        &mut self,
        symbol: &Symbol,
        candles: &[crate::types::Candle],
        last_price: f64,
        equity: f64,
        free_quote: f64,
    ) {
        if let Some(position) = self.positions.get(symbol).cloned() {
            if let Some(reason) = self.risk.stop_take_reason(&position, last_price) {
                self.close_position(symbol, &position, last_price, reason).await;
                return;
            }
        }

        let position = self.positions.get(symbol).cloned();
        let signal = generate_signal(candles, position.as_ref(), &self.config.strategy);

        match signal {
            Signal::Buy { reason } => {
                if position.is_some() || self.risk.halted() {
                    return;
                }
                self.open_position(symbol, last_price, equity, free_quote, &reason).await;
            }
            Signal::Sell { reason } => {
                if let Some(position) = position {
                    self.close_position(symbol, &position, last_price, &reason).await;
                }
            }
            Signal::Hold { .. } => {}
        }
    }

    async fn open_position(&mut self, symbol: &Symbol, price: f64, equity: f64, free_quote: f64, reason: &str) {
        let alloc = self.risk.max_quote_allocation(equity, Some(free_quote));
        if alloc <= 0.0 {
            return;
        }

        let fill = match self.backend.buy(symbol.as_str(), alloc, price).await {
            Ok(fill) => fill,
            Err(e) => {
                warn!(%symbol, error = %e, "buy failed");
                self.notifier.send(&format!("BUY failed for {symbol}: {e}")).await;
                return;
            }
        };

        let position = self
            .risk
            .build_position(symbol.clone(), fill.amount, fill.price, now_ms(), fill.fee_quote);
        self.positions.insert(symbol.clone(), position);

        let trade = TradeRecord {
            timestamp_ms: now_ms(),
            symbol: symbol.clone(),
            side: Side::Buy,
            amount: fill.amount,
            price: fill.price,
            fee: fill.fee_quote,
            pnl: 0.0,
            reason: reason.to_string(),
            mode: self.config.mode,
            order_id: fill.order_id.map(|id| id.to_string()),
        };
        if let Err(e) = self.state.record_trade(&trade) {
            warn!(error = %e, "failed to persist trade record");
        }

        self.notifier
            .send(&format!(
                "BUY {symbol} qty={:.6} price={:.2} fee={:.2} ({reason})",
                fill.amount, fill.price, fill.fee_quote
            ))
            .await;
    }

    async fn close_position(&mut self, symbol: &Symbol, position: &Position, last_price: f64, reason: &str) {
        let fill = match self.backend.sell(symbol.as_str(), position.amount, last_price).await {
            Ok(fill) => fill,
            Err(e) => {
                warn!(%symbol, error = %e, "sell failed");
                self.notifier.send(&format!("SELL failed for {symbol}: {e}")).await;
                return;
            }
        };

        let (pnl, _) = crate::execution::close_pnl(
            position.entry_price,
            position.entry_fee,
            position.amount,
            fill.amount.min(position.amount),
            &fill,
        );

        if fill.amount >= position.amount {
            self.positions.remove(symbol);
        } else {
            let sold_fraction = fill.amount / position.amount;
            let mut remaining = position.clone();
            remaining.amount -= fill.amount;
            remaining.entry_fee -= position.entry_fee * sold_fraction;
            self.positions.insert(symbol.clone(), remaining);
        }

        let trade = TradeRecord {
            timestamp_ms: now_ms(),
            symbol: symbol.clone(),
            side: Side::Sell,
            amount: fill.amount.min(position.amount),
            price: fill.price,
            fee: fill.fee_quote,
            pnl,
            reason: reason.to_string(),
            mode: self.config.mode,
            order_id: fill.order_id.map(|id| id.to_string()),
        };
        if let Err(e) = self.state.record_trade(&trade) {
            warn!(error = %e, "failed to persist trade record");
        }

        self.notifier
            .send(&format!(
                "SELL {symbol} qty={:.6} price={:.2} pnl={pnl:.2} fee={:.2} ({reason})",
                trade.amount, fill.price, fill.fee_quote
            ))
            .await;
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
