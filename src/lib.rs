//! Algorithmic spot-crypto trading engine: market-data pipeline,
//! RSI+MACD+volume signal generation, a daily-drawdown risk governor,
//! paper/live execution backends, a trading loop, and a backtest simulator.

pub mod backtest;
pub mod config;
pub mod data;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod notify;
pub mod risk;
pub mod signal;
pub mod state_manager;
pub mod trading_loop;
pub mod types;

pub use config::Config;
pub use types::*;
