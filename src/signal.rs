//! Stateless signal engine: classifies a candle window into buy/sell/hold.
//!
//! `generate_signal` is a free function, not an object with mutable state —
//! there is exactly one strategy (RSI + MACD histogram cross + volume
//! spike) and it carries no fields of its own.

use crate::config::StrategyConfig;
use crate::indicators::{macd, rolling_mean, rsi};
use crate::types::{Candle, Position, Signal};

/// Classify a chronologically ordered candle window for `symbol`.
///
/// `candles` must be at least `max(config.ohlcv_limit, 50)` long, or the
/// result is `hold("insufficient candle history")`.
pub fn generate_signal(
    candles: &[Candle],
    position: Option<&Position>,
    config: &StrategyConfig,
) -> Signal {
    let min_len = config.ohlcv_limit.max(50);
    if candles.len() < min_len {
        return Signal::hold("insufficient candle history");
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    let rsi_series = rsi(&closes, config.rsi_period);
    let macd_result = macd(&closes, config.macd_fast, config.macd_slow, config.macd_signal);
    let volume_mean = rolling_mean(&volumes, config.volume_ma_period);

    let n = candles.len();
    let last_rsi = rsi_series[n - 1];
    let last_hist = macd_result.histogram[n - 1];
    let prev_hist = macd_result.histogram[n - 2];
    let last_volume = volumes[n - 1];
    let last_volume_mean = volume_mean[n - 1];

    let (Some(r), Some(h_prev), Some(h_last), Some(m)) =
        (last_rsi, prev_hist, last_hist, last_volume_mean)
    else {
        return Signal::hold("indicators not ready");
    };

    let bullish_cross = h_prev <= 0.0 && h_last > 0.0;
    let bearish_cross = h_prev >= 0.0 && h_last < 0.0;
    let volume_spike = last_volume > m * config.volume_spike_mult;

    match position {
        None => {
            if r <= config.rsi_oversold && bullish_cross && volume_spike {
                Signal::buy("rsi oversold + bullish macd cross + volume spike")
            } else {
                Signal::hold("no entry")
            }
        }
        Some(_) => {
            if r >= config.rsi_overbought && bearish_cross && volume_spike {
                Signal::sell("rsi overbought + bearish macd cross + volume spike")
            } else {
                Signal::hold("hold position")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StrategyConfig {
        StrategyConfig {
            timeframe: "1h".to_string(),
            ohlcv_limit: 50,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            volume_ma_period: 20,
            volume_spike_mult: 1.2,
        }
    }

    fn candle(ts: i64, close: f64, volume: f64) -> Candle {
        Candle::new_unchecked(ts, close, close, close, close, volume)
    }

    #[test]
    fn insufficient_history_holds() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 100.0, 10.0)).collect();
        let signal = generate_signal(&candles, None, &config());
        assert_eq!(signal, Signal::hold("insufficient candle history"));
    }

    #[test]
    fn clean_long_entry_buys() {
        // 200 bars declining 0.2/bar (drives RSI into oversold territory),
        // then one rally bar with a volume spike: bullish MACD cross, RSI
        // oversold, and volume spike all hold at once.
        let mut candles = Vec::new();
        let mut price = 100.0;
        for i in 0..200 {
            candles.push(candle(i, price, 10.0));
            price -= 0.2;
        }
        price += 1.0;
        candles.push(candle(200, price, 50.0));

        let cfg = StrategyConfig {
            ohlcv_limit: 200,
            rsi_oversold: 30.0,
            volume_spike_mult: 1.2,
            ..config()
        };
        let signal = generate_signal(&candles, None, &cfg);
        assert!(matches!(signal, Signal::Buy { .. }));
    }

    #[test]
    fn existing_position_never_buys() {
        let candles: Vec<Candle> = (0..60).map(|i| candle(i, 100.0 + i as f64, 10.0)).collect();
        let position = Position {
            symbol: crate::types::Symbol::new("BTC/USDT"),
            amount: 1.0,
            entry_price: 100.0,
            entry_timestamp_ms: 0,
            stop_loss: 90.0,
            take_profit: 110.0,
            entry_fee: 0.1,
        };
        let signal = generate_signal(&candles, Some(&position), &config());
        assert!(!matches!(signal, Signal::Buy { .. }));
    }
}
