//! Pure indicator functions over ordered finite sequences of closes/volumes.
//!
//! Every function returns `Vec<Option<f64>>`, the same length as its input;
//! `None` is the "not yet defined" sentinel for positions before an
//! indicator's warmup period has elapsed.

/// Exponential moving average, `alpha = 2/(span+1)`, seeded with `e_0 = x_0`.
/// Defined at every position.
pub fn ema(series: &[f64], span: usize) -> Vec<Option<f64>> {
    if series.is_empty() {
        return Vec::new();
    }
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(series.len());
    let mut prev = series[0];
    out.push(Some(prev));
    for &x in &series[1..] {
        prev = alpha * x + (1.0 - alpha) * prev;
        out.push(Some(prev));
    }
    out
}

/// Wilder average, `alpha = 1/period`. The first `period` outputs are
/// `None`; position `period` (0-indexed) is the arithmetic mean of the
/// first `period` inputs; later positions follow the EMA-style recurrence.
pub fn wilder_average(series: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; series.len()];
    if period == 0 || series.len() <= period {
        return out;
    }
    let seed: f64 = series[..period].iter().sum::<f64>() / period as f64;
    out[period] = Some(seed);
    let alpha = 1.0 / period as f64;
    let mut prev = seed;
    for i in (period + 1)..series.len() {
        prev = alpha * series[i] + (1.0 - alpha) * prev;
        out[i] = Some(prev);
    }
    out
}

/// RSI via Wilder-smoothed gains/losses. `closes` has length `n`; the
/// returned series also has length `n`, with `None` until the Wilder
/// averages of gain/loss become defined. `RSI = 100` when `avg_loss = 0`.
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = closes.len();
    if n < 2 {
        return vec![None; n];
    }

    let mut gains = Vec::with_capacity(n - 1);
    let mut losses = Vec::with_capacity(n - 1);
    for pair in closes.windows(2) {
        let delta = pair[1] - pair[0];
        gains.push(delta.max(0.0));
        losses.push((-delta).max(0.0));
    }

    let avg_gain = wilder_average(&gains, period);
    let avg_loss = wilder_average(&losses, period);

    // gains/losses are deltas, so avg_gain[i] corresponds to closes[i+1].
    let mut out = vec![None; n];
    for i in 0..avg_gain.len() {
        if let (Some(g), Some(l)) = (avg_gain[i], avg_loss[i]) {
            let value = if l == 0.0 {
                100.0
            } else {
                100.0 - 100.0 / (1.0 + g / l)
            };
            out[i + 1] = Some(value);
        }
    }
    out
}

/// MACD line, signal line, and histogram. All three are defined at every
/// position (EMA has no warmup gap).
pub struct Macd {
    pub macd: Vec<Option<f64>>,
    pub signal: Vec<Option<f64>>,
    pub histogram: Vec<Option<f64>>,
}

pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    let ema_fast = ema(closes, fast);
    let ema_slow = ema(closes, slow);
    let macd_line: Vec<f64> = ema_fast
        .iter()
        .zip(ema_slow.iter())
        .map(|(f, s)| f.unwrap_or(0.0) - s.unwrap_or(0.0))
        .collect();
    let signal_line = ema(&macd_line, signal);
    let histogram: Vec<Option<f64>> = macd_line
        .iter()
        .zip(signal_line.iter())
        .map(|(m, s)| s.map(|s| m - s))
        .collect();

    Macd {
        macd: macd_line.into_iter().map(Some).collect(),
        signal: signal_line,
        histogram,
    }
}

/// Arithmetic mean of the trailing `window` values; `None` at positions
/// `< window - 1`.
pub fn rolling_mean(series: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; series.len()];
    if window == 0 {
        return out;
    }
    for i in (window - 1)..series.len() {
        let sum: f64 = series[(i + 1 - window)..=i].iter().sum();
        out[i] = Some(sum / window as f64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ema_seeds_at_first_value() {
        let series = [10.0, 20.0, 30.0];
        let out = ema(&series, 2);
        assert_eq!(out[0], Some(10.0));
        // alpha = 2/3
        assert_relative_eq!(out[1].unwrap(), 2.0 / 3.0 * 20.0 + 1.0 / 3.0 * 10.0);
    }

    #[test]
    fn wilder_average_undefined_before_period() {
        let series = [1.0, 2.0, 3.0, 4.0, 5.0];
        let out = wilder_average(&series, 3);
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert_eq!(out[2], None);
        assert_relative_eq!(out[3].unwrap(), 2.0); // mean of 1,2,3
    }

    #[test]
    fn rsi_is_100_when_no_losses() {
        let closes: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        let out = rsi(&closes, 14);
        assert_eq!(out.last().unwrap(), &Some(100.0));
    }

    #[test]
    fn rsi_undefined_before_period_plus_one() {
        let closes = vec![1.0, 2.0, 3.0];
        let out = rsi(&closes, 14);
        assert!(out.iter().all(|v| v.is_none()));
    }

    #[test]
    fn rolling_mean_matches_manual_average() {
        let series = [1.0, 2.0, 3.0, 4.0];
        let out = rolling_mean(&series, 2);
        assert_eq!(out[0], None);
        assert_relative_eq!(out[1].unwrap(), 1.5);
        assert_relative_eq!(out[3].unwrap(), 3.5);
    }

    #[test]
    fn macd_histogram_defined_from_start() {
        let closes: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let result = macd(&closes, 12, 26, 9);
        assert!(result.histogram.iter().all(|v| v.is_some()));
    }
}
