// Persisted bot snapshot

use crate::core::position::Position;
use crate::core::types::{GridPlan, HaltRecord, Order};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything needed to resume after a restart.
///
/// `position` always equals `archived_position` plus the signed fills of the
/// terminal orders still in `orders`, applied in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    pub sequence: u64,
    pub pair: String,
    pub plan: GridPlan,
    /// Keyed by client order id.
    pub orders: BTreeMap<String, Order>,
    pub position: Position,
    #[serde(default)]
    pub archived_position: Position,
    #[serde(default)]
    pub halt: Option<HaltRecord>,
    #[serde(default)]
    pub daily: Option<DailyCounters>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-UTC-day activity used by the daily risk limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyCounters {
    pub day: NaiveDate,
    /// Realized PnL when the day started.
    pub opening_realized_pnl: f64,
    pub fills: u32,
}

impl BotState {
    pub fn new(pair: impl Into<String>, plan: GridPlan) -> Self {
        let now = Utc::now();
        Self {
            sequence: 0,
            pair: pair.into(),
            plan,
            orders: BTreeMap::new(),
            position: Position::flat(),
            archived_position: Position::flat(),
            halt: None,
            daily: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_some()
    }

    pub fn active_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| o.state.is_active())
    }

    pub fn terminal_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| o.state.is_terminal())
    }

    /// The active order covering a level of the current plan epoch.
    pub fn active_order_for_level(&self, level_index: usize) -> Option<&Order> {
        let epoch = self.plan.epoch;
        self.active_orders()
            .find(|o| o.epoch == epoch && o.level_index == level_index)
    }

    /// Look an order up by exchange id first, then by client id.
    pub fn find_order_key(&self, id: &str) -> Option<String> {
        self.orders
            .values()
            .find(|o| o.exchange_order_id.as_deref() == Some(id))
            .or_else(|| self.orders.get(id))
            .map(|o| o.client_order_id.clone())
    }

    /// Position implied by the archived baseline and all terminal orders.
    pub fn recompute_position(&self) -> Position {
        let mut terminal: Vec<&Order> = self
            .terminal_orders()
            .filter(|o| o.filled > 0.0)
            .collect();
        terminal.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.client_order_id.cmp(&b.client_order_id))
        });

        let mut position = self.archived_position;
        for order in terminal {
            position.apply_fill(order.side, order.filled, order.fill_price());
        }
        position
    }

    /// Net quantity including partial fills of orders that are still resting.
    pub fn exposure(&self) -> Position {
        let mut position = self.position;
        for order in self.active_orders().filter(|o| o.filled > 0.0) {
            position.apply_fill(order.side, order.filled, order.fill_price());
        }
        position
    }
}

impl BotState {
    /// Counters for `day`. A record from an earlier day reads as a fresh one.
    pub fn daily_on(&self, day: NaiveDate) -> DailyCounters {
        match self.daily {
            Some(daily) if daily.day >= day => daily,
            _ => DailyCounters {
                day,
                opening_realized_pnl: self.position.realized_pnl,
                fills: 0,
            },
        }
    }

    /// Start a new day's counters once `day` is past the recorded one.
    /// Returns true when the counters were reset.
    pub fn roll_day(&mut self, day: NaiveDate) -> bool {
        let next = self.daily_on(day);
        let rolled = self.daily != Some(next);
        self.daily = Some(next);
        rolled
    }

    pub fn record_fill(&mut self, at: DateTime<Utc>) {
        self.roll_day(at.date_naive());
        if let Some(daily) = self.daily.as_mut() {
            daily.fills += 1;
        }
    }

    /// Realized PnL since the start of `day`.
    pub fn daily_realized_pnl(&self, day: NaiveDate) -> f64 {
        self.position.realized_pnl - self.daily_on(day).opening_realized_pnl
    }
}
