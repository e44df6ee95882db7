// Common types used across the grid engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tolerance used when comparing base-asset quantities.
pub const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpacingMode {
    #[default]
    Arithmetic,
    Geometric,
}

/// One rung of the grid with an order side assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: usize,
    pub price: f64,
    pub side: Side,
    pub quantity: f64,
}

/// A single grid generation.
///
/// `rungs` holds every price of the ladder. `levels` holds the rungs that are
/// armed with a side; the rung nearest the reference price starts idle.
/// `deferred` queues replacement levels whose rung was still occupied when
/// the fill that produced them was processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPlan {
    /// Bumped on every re-plan; orders from older epochs never cover levels.
    pub epoch: u32,
    /// Bumped on every re-level and re-plan.
    pub generation: u64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub spacing_mode: SpacingMode,
    pub rungs: Vec<f64>,
    pub levels: BTreeMap<usize, GridLevel>,
    #[serde(default)]
    pub deferred: BTreeMap<usize, Vec<GridLevel>>,
}

impl GridPlan {
    pub fn level(&self, index: usize) -> Option<&GridLevel> {
        self.levels.get(&index)
    }

    pub fn armed_levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.values()
    }

    /// Every price of the ladder, idle rungs included.
    pub fn rung_count(&self) -> usize {
        self.rungs.len()
    }

    pub fn armed_count(&self) -> usize {
        self.levels.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Cancelled | OrderState::Rejected)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// The lifecycle edge set. A further partial fill keeps a resting
    /// order in `PartiallyFilled`.
    pub fn can_transition_to(self, next: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, next),
            (Pending, Open)
                | (Pending, Rejected)
                | (Open, PartiallyFilled)
                | (Open, Filled)
                | (Open, Cancelled)
                | (PartiallyFilled, PartiallyFilled)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Cancelled)
        )
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderState::Pending => "pending",
            OrderState::Open => "open",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub level_index: usize,
    pub epoch: u32,
    pub generation: u64,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub filled: f64,
    #[serde(default)]
    pub average_fill_price: Option<f64>,
    pub state: OrderState,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Order {
    /// Limit orders fill at their own price unless the venue reported otherwise.
    pub fn fill_price(&self) -> f64 {
        self.average_fill_price.unwrap_or(self.price)
    }
}

/// Order-status event kinds reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderEventKind {
    Acknowledged,
    /// Incremental fill quantity.
    PartialFill { quantity: f64 },
    Filled,
    Cancelled,
    Rejected { reason: String },
}

impl OrderEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            OrderEventKind::Acknowledged => "acknowledged",
            OrderEventKind::PartialFill { .. } => "partial_fill",
            OrderEventKind::Filled => "filled",
            OrderEventKind::Cancelled => "cancelled",
            OrderEventKind::Rejected { .. } => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub kind: OrderEventKind,
    pub timestamp: DateTime<Utc>,
}

/// Emitted by the order manager when an order completes.
#[derive(Debug, Clone, PartialEq)]
pub struct FillNotice {
    pub client_order_id: String,
    pub level_index: usize,
    pub epoch: u32,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HaltReason {
    OutOfRange,
    DrawdownExceeded,
    InsufficientBalance,
    ReconciliationConflict,
    SubmissionFailed,
    DailyLossLimit,
    DailyFillLimit,
    ExposureLimit,
    EventStreamLost,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HaltReason::OutOfRange => "OutOfRange",
            HaltReason::DrawdownExceeded => "DrawdownExceeded",
            HaltReason::InsufficientBalance => "InsufficientBalance",
            HaltReason::ReconciliationConflict => "ReconciliationConflict",
            HaltReason::SubmissionFailed => "SubmissionFailed",
            HaltReason::DailyLossLimit => "DailyLossLimit",
            HaltReason::DailyFillLimit => "DailyFillLimit",
            HaltReason::ExposureLimit => "ExposureLimit",
            HaltReason::EventStreamLost => "EventStreamLost",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltRecord {
    pub reason: HaltReason,
    pub detail: String,
    pub halted_at: DateTime<Utc>,
}

/// Quote-currency balance reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub available: f64,
    pub equity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketSnapshot {
    pub reference_price: f64,
    pub balance: Balance,
    pub observed_at: DateTime<Utc>,
}
