//! Risk governor: daily drawdown kill-switch, position sizing, stop/take.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::config::RiskConfig;
use crate::types::{Position, Symbol};

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("quote_to_spend must be > 0")]
    NonPositiveAllocation,
}

/// Daily-reset drawdown kill-switch plus sizing/stop-take policy.
///
/// Holds no reference to portfolio state; the Trading Loop and Backtester
/// feed it equity readings and ask it to build/evaluate positions.
#[derive(Debug, Clone)]
pub struct RiskGovernor {
    config: RiskConfig,
    current_date: Option<NaiveDate>,
    day_open_equity: Option<f64>,
    halted: bool,
    /// Consumed by the caller after reading: true exactly once per
    /// false->true transition, so the Trading Loop emits one notification.
    just_halted: bool,
}

impl RiskGovernor {
    pub fn new(config: RiskConfig) -> Self {
        RiskGovernor {
            config,
            current_date: None,
            day_open_equity: None,
            halted: false,
            just_halted: false,
        }
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn day_open_equity(&self) -> Option<f64> {
        self.day_open_equity
    }

    /// Restore kill-switch state from a checkpoint after a process restart,
    /// so resuming mid-day doesn't silently reopen a halted day.
    pub fn restore(&mut self, date: NaiveDate, day_open_equity: Option<f64>, halted: bool) {
        self.current_date = Some(date);
        self.day_open_equity = day_open_equity;
        self.halted = halted;
    }

    /// Returns true once, immediately after a halt transition, then false
    /// until the next transition.
    pub fn take_just_halted(&mut self) -> bool {
        std::mem::take(&mut self.just_halted)
    }

    /// Update the day-open equity snapshot and evaluate the kill-switch.
    pub fn update_daily_equity(&mut self, now_utc: DateTime<Utc>, equity: f64) {
        let today = now_utc.date_naive();
        if self.current_date != Some(today) {
            self.current_date = Some(today);
            self.day_open_equity = Some(equity);
            self.halted = false;
            return;
        }

        if let Some(open) = self.day_open_equity {
            let limit = self.config.daily_drawdown_limit_pct;
            if !self.halted && equity <= open * (1.0 - limit) {
                self.halted = true;
                self.just_halted = true;
            }
        }
    }

    /// Fixed-percentage sizing, clamped by free quote balance when given.
    pub fn max_quote_allocation(&self, equity: f64, free_quote: Option<f64>) -> f64 {
        let mut allocation = equity * self.config.max_position_pct;
        if let Some(free) = free_quote {
            allocation = allocation.min(free);
        }
        allocation.max(0.0)
    }

    /// Attach stop-loss/take-profit levels to a freshly filled position.
    pub fn build_position(
        &self,
        symbol: Symbol,
        amount: f64,
        entry_price: f64,
        entry_timestamp_ms: i64,
        entry_fee: f64,
    ) -> Position {
        Position {
            symbol,
            amount,
            entry_price,
            entry_timestamp_ms,
            stop_loss: entry_price * (1.0 - self.config.stop_loss_pct),
            take_profit: entry_price * (1.0 + self.config.take_profit_pct),
            entry_fee,
        }
    }

    /// `last_price` is the bar's close, matching the Trading Loop's and
    /// Backtester's single-price-per-tick model. Stop-loss is evaluated
    /// before take-profit when both would trigger against the same price.
    pub fn stop_take_reason(&self, position: &Position, last_price: f64) -> Option<&'static str> {
        if last_price <= position.stop_loss {
            Some("stop-loss")
        } else if last_price >= position.take_profit {
            Some("take-profit")
        } else {
            None
        }
    }
}

/// Reject a non-positive buy allocation before it reaches a backend.
pub fn validate_allocation(quote_to_spend: f64) -> Result<(), RiskError> {
    if quote_to_spend <= 0.0 {
        return Err(RiskError::NonPositiveAllocation);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> RiskConfig {
        RiskConfig {
            max_position_pct: 0.1,
            stop_loss_pct: 0.03,
            take_profit_pct: 0.06,
            daily_drawdown_limit_pct: 0.05,
        }
    }

    fn dt(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn halts_after_drawdown_breach() {
        let mut risk = RiskGovernor::new(config());
        risk.update_daily_equity(dt(0), 10_000.0);
        assert!(!risk.halted());
        risk.update_daily_equity(dt(1), 9_600.0);
        assert!(!risk.halted());
        risk.update_daily_equity(dt(2), 9_400.0);
        assert!(risk.halted());
    }

    #[test]
    fn halt_latches_for_remainder_of_day() {
        let mut risk = RiskGovernor::new(config());
        risk.update_daily_equity(dt(0), 10_000.0);
        risk.update_daily_equity(dt(1), 9_000.0);
        assert!(risk.halted());
        risk.update_daily_equity(dt(2), 9_900.0);
        assert!(risk.halted(), "halt must not clear within the same day");
    }

    #[test]
    fn halt_resets_on_utc_date_change() {
        let mut risk = RiskGovernor::new(config());
        risk.update_daily_equity(dt(0), 10_000.0);
        risk.update_daily_equity(dt(1), 9_000.0);
        assert!(risk.halted());

        let next_day = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        risk.update_daily_equity(next_day, 9_000.0);
        assert!(!risk.halted());
    }

    #[test]
    fn just_halted_is_one_shot() {
        let mut risk = RiskGovernor::new(config());
        risk.update_daily_equity(dt(0), 10_000.0);
        risk.update_daily_equity(dt(1), 9_000.0);
        assert!(risk.take_just_halted());
        assert!(!risk.take_just_halted());
    }

    #[test]
    fn zero_position_pct_means_no_buys() {
        let mut cfg = config();
        cfg.max_position_pct = 0.0;
        let risk = RiskGovernor::new(cfg);
        assert_eq!(risk.max_quote_allocation(10_000.0, None), 0.0);
    }

    #[test]
    fn allocation_clamped_by_free_quote() {
        let risk = RiskGovernor::new(config());
        assert_eq!(risk.max_quote_allocation(10_000.0, Some(50.0)), 50.0);
    }

    #[test]
    fn restore_reinstates_halted_state_for_the_checkpointed_day() {
        let mut risk = RiskGovernor::new(config());
        risk.restore(dt(0).date_naive(), Some(10_000.0), true);
        assert!(risk.halted());
        assert_eq!(risk.day_open_equity(), Some(10_000.0));

        // Same day again: halt must still latch, not reset.
        risk.update_daily_equity(dt(5), 9_900.0);
        assert!(risk.halted(), "restored halt must survive an update on the same day");

        let next_day = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        risk.update_daily_equity(next_day, 9_900.0);
        assert!(!risk.halted(), "halt still clears on the next UTC day");
    }

    #[test]
    fn stop_loss_takes_priority_over_take_profit() {
        let risk = RiskGovernor::new(config());
        let position = Position {
            symbol: Symbol::new("BTC/USDT"),
            amount: 1.0,
            entry_price: 100.0,
            entry_timestamp_ms: 0,
            stop_loss: 97.0,
            take_profit: 103.0,
            entry_fee: 0.1,
        };
        assert_eq!(risk.stop_take_reason(&position, 96.0), Some("stop-loss"));
    }
}
