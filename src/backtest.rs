//! Multi-symbol event-time backtester.
//!
//! Drives a k-way merge across each symbol's candle history in timestamp
//! order, feeding the same signal engine, risk governor, and paper
//! execution formulas the Trading Loop uses live. One candle history per
//! symbol, trimmed to `strategy.ohlcv_limit` as it grows, matches what the
//! live loop's rolling candle window looks like at every tick.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::{RiskConfig, StrategyConfig};
use crate::execution::{self, close_pnl};
use crate::risk::RiskGovernor;
use crate::signal::generate_signal;
use crate::types::{Candle, Position, Symbol};

#[derive(Debug, Clone, Serialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub entry_timestamp_ms: i64,
    pub exit_timestamp_ms: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub amount: f64,
    pub pnl: f64,
    pub reason: String,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub starting_equity: f64,
    pub final_equity: f64,
    pub total_return_pct: f64,
    pub num_trades: usize,
    pub win_rate_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio_annualized: f64,
    /// `None` serializes as JSON `null`; the original's `math.inf` sentinel
    /// (gross profit with zero gross loss) isn't representable in JSON, so
    /// callers that need it should check `gross_loss == 0.0 && gross_profit > 0.0`.
    pub profit_factor: Option<f64>,
    pub gross_profit: f64,
    pub gross_loss: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub metrics: Metrics,
    pub closed_trades: Vec<ClosedTrade>,
}

/// Convert a `"<n><unit>"` timeframe string (`m`/`h`/`d`/`w`) to seconds.
pub fn timeframe_to_seconds(timeframe: &str) -> anyhow::Result<u64> {
    let tf = timeframe.trim();
    let split_at = tf
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("invalid timeframe '{timeframe}'"))?;
    let (num_part, unit_part) = tf.split_at(split_at);
    let n: u64 = num_part
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid timeframe '{timeframe}'"))?;
    let seconds = match unit_part.to_ascii_lowercase().as_str() {
        "m" => n * 60,
        "h" => n * 60 * 60,
        "d" => n * 60 * 60 * 24,
        "w" => n * 60 * 60 * 24 * 7,
        other => anyhow::bail!("unsupported timeframe unit '{other}' (expected m/h/d/w)"),
    };
    Ok(seconds)
}

fn portfolio_equity(cash: f64, positions: &HashMap<Symbol, Position>, last_prices: &HashMap<Symbol, f64>) -> f64 {
    let mut equity = cash;
    for (symbol, position) in positions {
        let price = last_prices.get(symbol).copied().unwrap_or(position.entry_price);
        equity += position.amount * price;
    }
    equity
}

/// Run the backtest over pre-fetched candle histories (already covering the
/// warmup window before `trade_start_ms`). `candles_by_symbol` entries must
/// be chronologically ordered.
pub fn run(
    candles_by_symbol: &HashMap<Symbol, Vec<Candle>>,
    timeframe: &str,
    strategy_config: &StrategyConfig,
    risk_config: &RiskConfig,
    starting_cash: f64,
    fee_pct: f64,
    trade_start_ms: i64,
    trade_end_ms: i64,
) -> anyhow::Result<BacktestReport> {
    let timeframe_seconds = timeframe_to_seconds(timeframe)?;
    let symbols: Vec<Symbol> = candles_by_symbol.keys().cloned().collect();

    let mut risk = RiskGovernor::new(risk_config.clone());
    let mut cash = starting_cash;
    let mut positions: HashMap<Symbol, Position> = HashMap::new();
    let mut closed_trades: Vec<ClosedTrade> = Vec::new();
    let mut histories: HashMap<Symbol, Vec<Candle>> = symbols.iter().cloned().map(|s| (s, Vec::new())).collect();
    let mut last_prices: HashMap<Symbol, f64> = HashMap::new();
    let mut indices: HashMap<Symbol, usize> = symbols.iter().cloned().map(|s| (s, 0)).collect();
    let mut equity_curve: Vec<f64> = Vec::new();
    let mut last_processed_ts: Option<i64> = None;

    loop {
        let next_ts = symbols
            .iter()
            .filter_map(|s| {
                let idx = indices[s];
                candles_by_symbol[s].get(idx).map(|c| c.timestamp_ms)
            })
            .min();
        let Some(ts) = next_ts else { break };
        last_processed_ts = Some(ts);

        let mut active = Vec::new();
        for symbol in &symbols {
            let idx = indices[symbol];
            let Some(candle) = candles_by_symbol[symbol].get(idx) else {
                continue;
            };
            if candle.timestamp_ms != ts {
                continue;
            }
            let history = histories.get_mut(symbol).unwrap();
            history.push(*candle);
            if history.len() > strategy_config.ohlcv_limit {
                let excess = history.len() - strategy_config.ohlcv_limit;
                history.drain(0..excess);
            }
            last_prices.insert(symbol.clone(), candle.close);
            active.push(symbol.clone());
            indices.insert(symbol.clone(), idx + 1);
        }

        let equity_before = portfolio_equity(cash, &positions, &last_prices);
        let now_dt = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ts).unwrap_or_default();
        risk.update_daily_equity(now_dt, equity_before);
        // Frozen once per tick: every symbol's buy is sized against the cash
        // on hand at the start of the tick, not cash already spent on an
        // earlier symbol processed in the same tick.
        let free_quote_before = cash;

        if ts >= trade_start_ms {
            for symbol in &active {
                let last_price = last_prices[symbol];
                let position = positions.get(symbol).cloned();

                if let Some(position) = &position {
                    if let Some(reason) = risk.stop_take_reason(position, last_price) {
                        let (new_cash, exit_fee) =
                            execution::paper_sell(cash, position.amount, last_price, fee_pct);
                        cash = new_cash;
                        let fill = crate::types::Fill {
                            amount: position.amount,
                            price: last_price,
                            fee_quote: exit_fee,
                            order_id: None,
                        };
                        let (pnl, _) =
                            close_pnl(position.entry_price, position.entry_fee, position.amount, position.amount, &fill);
                        positions.remove(symbol);
                        closed_trades.push(ClosedTrade {
                            symbol: symbol.to_string(),
                            entry_timestamp_ms: position.entry_timestamp_ms,
                            exit_timestamp_ms: ts,
                            entry_price: position.entry_price,
                            exit_price: last_price,
                            amount: position.amount,
                            pnl,
                            reason: reason.to_string(),
                        });
                        continue;
                    }
                }

                let signal = generate_signal(&histories[symbol], position.as_ref(), strategy_config);
                match signal {
                    crate::types::Signal::Buy { .. } => {
                        if position.is_some() || risk.halted() {
                            continue;
                        }
                        let alloc = risk.max_quote_allocation(equity_before, Some(free_quote_before));
                        if alloc <= 0.0 {
                            continue;
                        }
                        let Ok((new_cash, amount, entry_fee)) =
                            execution::paper_buy(cash, alloc, last_price, fee_pct)
                        else {
                            continue;
                        };
                        cash = new_cash;
                        let new_position =
                            risk.build_position(symbol.clone(), amount, last_price, ts, entry_fee);
                        positions.insert(symbol.clone(), new_position);
                    }
                    crate::types::Signal::Sell { reason } => {
                        let Some(position) = position else { continue };
                        let (new_cash, exit_fee) =
                            execution::paper_sell(cash, position.amount, last_price, fee_pct);
                        cash = new_cash;
                        let fill = crate::types::Fill {
                            amount: position.amount,
                            price: last_price,
                            fee_quote: exit_fee,
                            order_id: None,
                        };
                        let (pnl, _) =
                            close_pnl(position.entry_price, position.entry_fee, position.amount, position.amount, &fill);
                        positions.remove(symbol);
                        closed_trades.push(ClosedTrade {
                            symbol: symbol.to_string(),
                            entry_timestamp_ms: position.entry_timestamp_ms,
                            exit_timestamp_ms: ts,
                            entry_price: position.entry_price,
                            exit_price: last_price,
                            amount: position.amount,
                            pnl,
                            reason,
                        });
                    }
                    crate::types::Signal::Hold { .. } => {}
                }
            }
        }

        if ts >= trade_start_ms {
            equity_curve.push(portfolio_equity(cash, &positions, &last_prices));
        }

        if ts >= trade_end_ms {
            break;
        }
    }

    let Some(last_ts) = last_processed_ts else {
        anyhow::bail!("no candles processed");
    };

    if !positions.is_empty() {
        let liquidation_ts = trade_end_ms.min(last_ts);
        for (symbol, position) in positions.drain().collect::<Vec<_>>() {
            let last_price = last_prices.get(&symbol).copied().unwrap_or(position.entry_price);
            let (new_cash, exit_fee) = execution::paper_sell(cash, position.amount, last_price, fee_pct);
            cash = new_cash;
            let fill = crate::types::Fill {
                amount: position.amount,
                price: last_price,
                fee_quote: exit_fee,
                order_id: None,
            };
            let (pnl, _) =
                close_pnl(position.entry_price, position.entry_fee, position.amount, position.amount, &fill);
            closed_trades.push(ClosedTrade {
                symbol: symbol.to_string(),
                entry_timestamp_ms: position.entry_timestamp_ms,
                exit_timestamp_ms: liquidation_ts,
                entry_price: position.entry_price,
                exit_price: last_price,
                amount: position.amount,
                pnl,
                reason: "end-of-backtest".to_string(),
            });
        }
        let equity_after = portfolio_equity(cash, &positions, &last_prices);
        if let Some(last) = equity_curve.last_mut() {
            *last = equity_after;
        } else {
            equity_curve.push(equity_after);
        }
    }

    let metrics = compute_metrics(starting_cash, &equity_curve, &closed_trades, timeframe_seconds);

    Ok(BacktestReport {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        timeframe: timeframe.to_string(),
        metrics,
        closed_trades,
    })
}

fn compute_metrics(
    starting_equity: f64,
    equity_curve: &[f64],
    closed_trades: &[ClosedTrade],
    timeframe_seconds: u64,
) -> Metrics {
    let final_equity = equity_curve.last().copied().unwrap_or(starting_equity);
    let total_return_pct = if starting_equity != 0.0 {
        (final_equity - starting_equity) / starting_equity * 100.0
    } else {
        0.0
    };

    let num_trades = closed_trades.len();
    let wins = closed_trades.iter().filter(|t| t.is_win()).count();
    let win_rate_pct = if num_trades > 0 {
        wins as f64 / num_trades as f64 * 100.0
    } else {
        0.0
    };

    let gross_profit: f64 = closed_trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).sum();
    let gross_loss: f64 = -closed_trades.iter().map(|t| t.pnl).filter(|p| *p < 0.0).sum::<f64>();
    let profit_factor = if gross_loss > 0.0 {
        Some(gross_profit / gross_loss)
    } else if gross_profit > 0.0 {
        None // +infinity, not representable in JSON
    } else {
        Some(0.0)
    };

    let mut max_dd = 0.0_f64;
    if !equity_curve.is_empty() {
        let mut peak = equity_curve[0];
        for &e in equity_curve {
            if e > peak {
                peak = e;
            }
            if peak > 0.0 {
                let dd = (peak - e) / peak;
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }
    }

    let mut sharpe = 0.0;
    if equity_curve.len() >= 2 && timeframe_seconds > 0 {
        let returns: Vec<f64> = equity_curve
            .windows(2)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();
        if returns.len() >= 2 {
            let mean = returns.iter().sum::<f64>() / returns.len() as f64;
            let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                / (returns.len() - 1) as f64;
            let std = variance.sqrt();
            if std > 0.0 {
                let periods_per_year = 365.0 * 24.0 * 60.0 * 60.0 / timeframe_seconds as f64;
                sharpe = mean / std * periods_per_year.sqrt();
            }
        }
    }

    Metrics {
        starting_equity,
        final_equity,
        total_return_pct,
        num_trades,
        win_rate_pct,
        max_drawdown_pct: max_dd * 100.0,
        sharpe_ratio_annualized: sharpe,
        profit_factor,
        gross_profit,
        gross_loss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy_config() -> StrategyConfig {
        StrategyConfig {
            timeframe: "1h".to_string(),
            ohlcv_limit: 60,
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

    fn risk_config() -> RiskConfig {
        RiskConfig {
            max_position_pct: 0.1,
            stop_loss_pct: 0.03,
            take_profit_pct: 0.06,
            daily_drawdown_limit_pct: 0.05,
        }
    }

    #[test]
    fn timeframe_parses_units() {
        assert_eq!(timeframe_to_seconds("1h").unwrap(), 3600);
        assert_eq!(timeframe_to_seconds("5m").unwrap(), 300);
        assert_eq!(timeframe_to_seconds("1d").unwrap(), 86_400);
        assert!(timeframe_to_seconds("bogus").is_err());
    }

    #[test]
    fn flat_price_series_produces_no_trades_and_zero_return() {
        let symbol = Symbol::new("BTC/USDT");
        let candles: Vec<Candle> = (0..200)
            .map(|i| Candle::new_unchecked(i * 3_600_000, 100.0, 100.0, 100.0, 100.0, 10.0))
            .collect();
        let mut map = HashMap::new();
        map.insert(symbol, candles);

        let report = run(
            &map,
            "1h",
            &strategy_config(),
            &risk_config(),
            10_000.0,
            0.001,
            0,
            199 * 3_600_000,
        )
        .unwrap();

        assert_eq!(report.closed_trades.len(), 0);
        assert_relative_eq(report.metrics.total_return_pct, 0.0);
    }

    fn assert_relative_eq(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-6, "{a} != {b}");
    }
}
