//! SQLite-backed trade log and restart checkpoints for the Trading Loop.
//!
//! The `trades` table is append-only and is the system's audit trail; the
//! `checkpoints` table holds only the latest row per run, overwritten on
//! every tick so a restarted loop can recover its last known equity without
//! replaying the whole trade log.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::types::{Mode, Position, Side, Symbol, TradeRecord};

pub struct StateManager {
    conn: Arc<Mutex<Connection>>,
}

/// Equity/position snapshot recorded at the end of each trading-loop tick,
/// used to resume after a process restart.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub timestamp_ms: i64,
    pub equity: f64,
    pub cash: f64,
    pub day_open_equity: Option<f64>,
    pub halted: bool,
    pub positions: HashMap<Symbol, Position>,
}

impl StateManager {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let manager = StateManager {
            conn: Arc::new(Mutex::new(conn)),
        };
        manager.create_tables()?;
        Ok(manager)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_ms INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                amount REAL NOT NULL,
                price REAL NOT NULL,
                fee REAL NOT NULL,
                pnl REAL NOT NULL,
                reason TEXT NOT NULL,
                mode TEXT NOT NULL,
                order_id TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_timestamp_ms ON trades(timestamp_ms)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                timestamp_ms INTEGER NOT NULL,
                equity REAL NOT NULL,
                cash REAL NOT NULL,
                day_open_equity REAL,
                halted INTEGER NOT NULL,
                positions_json TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;

        debug!("trades/checkpoints schema created or verified");
        Ok(())
    }

    /// Append a fill to the trade log. Never mutated or deleted afterward.
    pub fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trades
             (timestamp_ms, symbol, side, amount, price, fee, pnl, reason, mode, order_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                trade.timestamp_ms,
                trade.symbol.as_str(),
                trade.side.to_string(),
                trade.amount,
                trade.price,
                trade.fee,
                trade.pnl,
                trade.reason,
                trade.mode.to_string(),
                trade.order_id,
            ],
        )?;
        Ok(())
    }

    pub fn recent_trades(&self, symbol: &Symbol, limit: usize) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT timestamp_ms, symbol, side, amount, price, fee, pnl, reason, mode, order_id
             FROM trades WHERE symbol = ?1 ORDER BY timestamp_ms DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![symbol.as_str(), limit as i64], |row| {
            let side: String = row.get(2)?;
            let mode: String = row.get(8)?;
            Ok(TradeRecord {
                timestamp_ms: row.get(0)?,
                symbol: Symbol::new(row.get::<_, String>(1)?),
                side: if side == "buy" { Side::Buy } else { Side::Sell },
                amount: row.get(3)?,
                price: row.get(4)?,
                fee: row.get(5)?,
                pnl: row.get(6)?,
                reason: row.get(7)?,
                mode: if mode == "live" { Mode::Live } else { Mode::Paper },
                order_id: row.get(9)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Overwrite the single checkpoint row (there is at most one per process).
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let positions_json = serde_json::to_string(&checkpoint.positions)
            .context("failed to serialize checkpoint positions")?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO checkpoints (id, timestamp_ms, equity, cash, day_open_equity, halted, positions_json)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                timestamp_ms = excluded.timestamp_ms,
                equity = excluded.equity,
                cash = excluded.cash,
                day_open_equity = excluded.day_open_equity,
                halted = excluded.halted,
                positions_json = excluded.positions_json",
            params![
                checkpoint.timestamp_ms,
                checkpoint.equity,
                checkpoint.cash,
                checkpoint.day_open_equity,
                checkpoint.halted as i64,
                positions_json,
            ],
        )?;
        Ok(())
    }

    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT timestamp_ms, equity, cash, day_open_equity, halted, positions_json FROM checkpoints WHERE id = 1",
        )?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            let positions_json: String = row.get(5)?;
            let positions = serde_json::from_str(&positions_json).unwrap_or_else(|e| {
                warn!(error = %e, "corrupt checkpoint positions, recovering with no open positions");
                HashMap::new()
            });
            Ok(Some(Checkpoint {
                timestamp_ms: row.get(0)?,
                equity: row.get(1)?,
                cash: row.get(2)?,
                day_open_equity: row.get(3)?,
                halted: row.get::<_, i64>(4)? != 0,
                positions,
            }))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> StateManager {
        StateManager::open(":memory:").unwrap()
    }

    fn trade() -> TradeRecord {
        TradeRecord {
            timestamp_ms: 1_700_000_000_000,
            symbol: Symbol::new("BTC/USDT"),
            side: Side::Buy,
            amount: 1.0,
            price: 50_000.0,
            fee: 5.0,
            pnl: 0.0,
            reason: "test entry".to_string(),
            mode: Mode::Paper,
            order_id: None,
        }
    }

    #[test]
    fn trade_round_trips_through_sqlite() {
        let manager = manager();
        manager.record_trade(&trade()).unwrap();
        let rows = manager.recent_trades(&Symbol::new("BTC/USDT"), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].price, 50_000.0);
    }

    #[test]
    fn checkpoint_upsert_keeps_single_row() {
        let manager = manager();
        manager
            .save_checkpoint(&Checkpoint {
                timestamp_ms: 1,
                equity: 10_000.0,
                cash: 10_000.0,
                day_open_equity: Some(10_000.0),
                halted: false,
                positions: HashMap::new(),
            })
            .unwrap();
        manager
            .save_checkpoint(&Checkpoint {
                timestamp_ms: 2,
                equity: 9_500.0,
                cash: 9_500.0,
                day_open_equity: Some(10_000.0),
                halted: true,
                positions: HashMap::new(),
            })
            .unwrap();

        let loaded = manager.load_checkpoint().unwrap().unwrap();
        assert_eq!(loaded.timestamp_ms, 2);
        assert_eq!(loaded.equity, 9_500.0);
        assert!(loaded.halted);
    }

    #[test]
    fn checkpoint_round_trips_open_positions() {
        let manager = manager();
        let symbol = Symbol::new("BTC/USDT");
        let position = Position {
            symbol: symbol.clone(),
            amount: 0.5,
            entry_price: 50_000.0,
            entry_timestamp_ms: 1_700_000_000_000,
            stop_loss: 48_500.0,
            take_profit: 53_000.0,
            entry_fee: 25.0,
        };
        let mut positions = HashMap::new();
        positions.insert(symbol.clone(), position);

        manager
            .save_checkpoint(&Checkpoint {
                timestamp_ms: 1,
                equity: 35_000.0,
                cash: 10_000.0,
                day_open_equity: Some(36_000.0),
                halted: false,
                positions,
            })
            .unwrap();

        let loaded = manager.load_checkpoint().unwrap().unwrap();
        assert_eq!(loaded.positions.len(), 1);
        let restored = &loaded.positions[&symbol];
        assert_eq!(restored.amount, 0.5);
        assert_eq!(restored.entry_price, 50_000.0);
    }
}
