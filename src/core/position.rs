// Net position accounting for a single pair

use crate::core::types::{Side, QTY_EPSILON};
use serde::{Deserialize, Serialize};

/// Signed base quantity with average cost and realized PnL.
///
/// Shorts are allowed, as on a margin venue: a sell with no long inventory
/// opens a short position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub quantity: f64,
    pub average_cost: f64,
    pub realized_pnl: f64,
}

impl Position {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.abs() < QTY_EPSILON
    }

    /// Apply a fill of `quantity` base units at `price`.
    pub fn apply_fill(&mut self, side: Side, quantity: f64, price: f64) {
        if quantity <= 0.0 {
            return;
        }

        let signed = side.sign() * quantity;
        let increasing = self.is_flat() || self.quantity.signum() == signed.signum();

        if increasing {
            let held = self.quantity.abs();
            self.average_cost = (held * self.average_cost + quantity * price) / (held + quantity);
            self.quantity += signed;
            return;
        }

        let held = self.quantity.abs();
        let closing = quantity.min(held);
        let direction = self.quantity.signum();
        self.realized_pnl += closing * (price - self.average_cost) * direction;
        self.quantity += signed;

        if self.quantity.abs() < QTY_EPSILON {
            self.quantity = 0.0;
            self.average_cost = 0.0;
        } else if quantity > held {
            // Crossed through zero; the remainder opened a position at the fill price
            self.average_cost = price;
        }
    }

    /// Mark-to-market PnL of the open quantity.
    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        if self.is_flat() {
            return 0.0;
        }
        (mark_price - self.average_cost) * self.quantity
    }

    pub fn total_pnl(&self, mark_price: f64) -> f64 {
        self.realized_pnl + self.unrealized_pnl(mark_price)
    }
}
