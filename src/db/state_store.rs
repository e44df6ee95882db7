//! SQLite-backed state store with a fill journal

use crate::core::bot_state::BotState;
use crate::core::types::Order;
use crate::db::Database;
use crate::error::{GridBotError, GridBotResult};
use crate::persistence::StateStore;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One completed order with fills, kept even after the snapshot prunes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub pair: String,
    pub side: String,
    pub price: f64,
    pub quantity: f64,
    pub final_state: String,
    pub level_index: i64,
    pub epoch: i64,
    pub completed_at: String,
}

impl FillRecord {
    pub fn from_order(pair: &str, order: &Order) -> Self {
        FillRecord {
            client_order_id: order.client_order_id.clone(),
            exchange_order_id: order.exchange_order_id.clone(),
            pair: pair.to_string(),
            side: order.side.to_string(),
            price: order.fill_price(),
            quantity: order.filled,
            final_state: order.state.to_string(),
            level_index: order.level_index as i64,
            epoch: order.epoch as i64,
            completed_at: order.updated_at.to_rfc3339(),
        }
    }

    fn from_row(row: &Row) -> SqlResult<Self> {
        Ok(FillRecord {
            client_order_id: row.get(0)?,
            exchange_order_id: row.get(1)?,
            pair: row.get(2)?,
            side: row.get(3)?,
            price: row.get(4)?,
            quantity: row.get(5)?,
            final_state: row.get(6)?,
            level_index: row.get(7)?,
            epoch: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    /// Journal entries are written once; later snapshots leave them alone.
    fn insert(&self, conn: &Connection, sequence: u64) -> SqlResult<usize> {
        conn.execute(
            "INSERT OR IGNORE INTO fill_journal (
                client_order_id, exchange_order_id, pair, side, price, quantity,
                final_state, level_index, epoch, recorded_sequence, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                self.client_order_id,
                self.exchange_order_id,
                self.pair,
                self.side,
                self.price,
                self.quantity,
                self.final_state,
                self.level_index,
                self.epoch,
                sequence as i64,
                self.completed_at,
            ],
        )
    }
}

pub struct SqliteStateStore {
    db: Database,
    location: Option<PathBuf>,
}

impl SqliteStateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> GridBotResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::new(&path)?;
        db.run_migrations()?;
        Ok(Self {
            db,
            location: Some(path.as_ref().to_path_buf()),
        })
    }

    pub fn in_memory() -> GridBotResult<Self> {
        let db = Database::new_in_memory()?;
        db.run_migrations()?;
        Ok(Self { db, location: None })
    }

    pub fn stored_sequence(&self) -> GridBotResult<Option<u64>> {
        let conn = self.db.lock();
        let sequence: Option<i64> = conn
            .query_row("SELECT sequence FROM bot_state WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        Ok(sequence.map(|s| s as u64))
    }

    /// Most recent journal entries first.
    pub fn fills(&self, limit: usize) -> GridBotResult<Vec<FillRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT client_order_id, exchange_order_id, pair, side, price, quantity,
                    final_state, level_index, epoch, completed_at
             FROM fill_journal
             ORDER BY completed_at DESC, client_order_id
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], FillRecord::from_row)?;
        let mut fills = Vec::new();
        for row in rows {
            fills.push(row?);
        }
        Ok(fills)
    }
}

impl StateStore for SqliteStateStore {
    fn load_state(&self) -> GridBotResult<Option<BotState>> {
        let conn = self.db.lock();
        let snapshot: Option<String> = conn
            .query_row("SELECT snapshot FROM bot_state WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        match snapshot {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn save_state(&self, state: &BotState) -> GridBotResult<()> {
        let snapshot = serde_json::to_string(state)?;
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let stored: Option<i64> = tx
            .query_row("SELECT sequence FROM bot_state WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        if let Some(stored) = stored {
            let stored = stored as u64;
            if state.sequence <= stored {
                return Err(GridBotError::StaleSnapshot {
                    attempted: state.sequence,
                    stored,
                });
            }
        }

        tx.execute(
            "INSERT INTO bot_state (id, sequence, pair, snapshot, halted, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                sequence = excluded.sequence,
                pair = excluded.pair,
                snapshot = excluded.snapshot,
                halted = excluded.halted,
                updated_at = excluded.updated_at",
            params![
                state.sequence as i64,
                state.pair,
                snapshot,
                state.is_halted(),
                state.updated_at.to_rfc3339(),
            ],
        )?;

        let mut journaled = 0;
        for order in state.terminal_orders().filter(|o| o.filled > 0.0) {
            journaled += FillRecord::from_order(&state.pair, order).insert(&tx, state.sequence)?;
        }

        tx.commit()?;
        debug!(sequence = state.sequence, journaled, "state snapshot committed");
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.location {
            Some(path) => format!("sqlite:{}", path.display()),
            None => "sqlite::memory:".to_string(),
        }
    }
}
