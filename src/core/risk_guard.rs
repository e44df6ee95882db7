// Stop-condition evaluation

use crate::config::{GridConfig, RiskConfig};
use crate::core::bot_state::BotState;
use crate::core::types::{HaltReason, MarketSnapshot, Side};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    pub capital: f64,
    pub leverage: f64,
    pub max_drawdown_pct: f64,
    pub out_of_range_tolerance_pct: f64,
    pub min_balance: f64,
    pub max_daily_loss: Option<f64>,
    pub max_daily_fills: Option<u32>,
    pub max_exposure: Option<f64>,
}

impl RiskLimits {
    pub fn from_config(grid: &GridConfig, risk: &RiskConfig) -> Self {
        Self {
            capital: grid.capital,
            leverage: grid.leverage,
            max_drawdown_pct: risk.max_drawdown_pct,
            out_of_range_tolerance_pct: risk.out_of_range_tolerance_pct,
            min_balance: risk.min_balance,
            max_daily_loss: risk.max_daily_loss,
            max_daily_fills: risk.max_daily_fills,
            max_exposure: risk.max_exposure,
        }
    }

    pub fn max_loss(&self) -> f64 {
        self.capital * self.max_drawdown_pct / 100.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskSignal {
    OutOfRange { price: f64, lower: f64, upper: f64 },
    DrawdownExceeded { loss: f64, limit: f64 },
    InsufficientBalance { required: f64, available: f64 },
    DailyLossLimit { loss: f64, limit: f64 },
    DailyFillLimit { fills: u32, limit: u32 },
    ExposureLimit { notional: f64, limit: f64 },
}

impl RiskSignal {
    pub fn halt_reason(&self) -> HaltReason {
        match self {
            RiskSignal::OutOfRange { .. } => HaltReason::OutOfRange,
            RiskSignal::DrawdownExceeded { .. } => HaltReason::DrawdownExceeded,
            RiskSignal::InsufficientBalance { .. } => HaltReason::InsufficientBalance,
            RiskSignal::DailyLossLimit { .. } => HaltReason::DailyLossLimit,
            RiskSignal::DailyFillLimit { .. } => HaltReason::DailyFillLimit,
            RiskSignal::ExposureLimit { .. } => HaltReason::ExposureLimit,
        }
    }
}

impl fmt::Display for RiskSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskSignal::OutOfRange { price, lower, upper } => write!(
                f,
                "price {:.4} left the tolerated range [{:.4}, {:.4}]",
                price, lower, upper
            ),
            RiskSignal::DrawdownExceeded { loss, limit } => {
                write!(f, "loss {:.2} exceeds drawdown limit {:.2}", loss, limit)
            }
            RiskSignal::InsufficientBalance { required, available } => write!(
                f,
                "available balance {:.2} is below the required {:.2}",
                available, required
            ),
            RiskSignal::DailyLossLimit { loss, limit } => {
                write!(f, "realized loss today {:.2} reached the daily limit {:.2}", loss, limit)
            }
            RiskSignal::DailyFillLimit { fills, limit } => {
                write!(f, "{} fills today reached the daily limit {}", fills, limit)
            }
            RiskSignal::ExposureLimit { notional, limit } => {
                write!(f, "position notional {:.2} exceeds the exposure limit {:.2}", notional, limit)
            }
        }
    }
}

/// Prices outside `[lower * (1 - pct), upper * (1 + pct)]` halt the grid.
pub fn tolerated_range(lower: f64, upper: f64, tolerance_pct: f64) -> (f64, f64) {
    let tol = tolerance_pct / 100.0;
    (lower * (1.0 - tol), upper * (1.0 + tol))
}

/// Margin needed to place `orders` given the current signed position.
///
/// Orders that reduce the position need no margin up to its size.
pub fn margin_requirement<I>(position_quantity: f64, orders: I, leverage: f64) -> f64
where
    I: IntoIterator<Item = (Side, f64, f64)>,
{
    let mut long_cover = position_quantity.max(0.0);
    let mut short_cover = (-position_quantity).max(0.0);
    let leverage = leverage.max(1.0);

    orders
        .into_iter()
        .map(|(side, price, quantity)| {
            let cover = match side {
                Side::Sell => &mut long_cover,
                Side::Buy => &mut short_cover,
            };
            let reducing = quantity.min(*cover);
            *cover -= reducing;
            (quantity - reducing) * price / leverage
        })
        .sum()
}

/// Pure evaluator: no I/O and no mutation.
#[derive(Debug, Clone)]
pub struct RiskGuard {
    limits: RiskLimits,
}

impl RiskGuard {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Checks range, drawdown, the daily limits, exposure and then balance.
    /// First hit wins.
    pub fn evaluate(&self, state: &BotState, market: &MarketSnapshot) -> Option<RiskSignal> {
        let price = market.reference_price;
        let (lower, upper) = tolerated_range(
            state.plan.lower_bound,
            state.plan.upper_bound,
            self.limits.out_of_range_tolerance_pct,
        );
        if price < lower || price > upper {
            return Some(RiskSignal::OutOfRange { price, lower, upper });
        }

        let exposure = state.exposure();
        let loss = -exposure.total_pnl(price);
        let limit = self.limits.max_loss();
        if loss > limit {
            return Some(RiskSignal::DrawdownExceeded { loss, limit });
        }

        let day = market.observed_at.date_naive();
        if let Some(limit) = self.limits.max_daily_loss {
            let loss = -state.daily_realized_pnl(day);
            if loss >= limit {
                return Some(RiskSignal::DailyLossLimit { loss, limit });
            }
        }
        if let Some(limit) = self.limits.max_daily_fills {
            let fills = state.daily_on(day).fills;
            if fills >= limit {
                return Some(RiskSignal::DailyFillLimit { fills, limit });
            }
        }

        if let Some(limit) = self.limits.max_exposure {
            let notional = exposure.quantity.abs() * price;
            if notional > limit {
                return Some(RiskSignal::ExposureLimit { notional, limit });
            }
        }

        let uncovered = state
            .plan
            .armed_levels()
            .filter(|level| state.active_order_for_level(level.index).is_none())
            .map(|level| (level.side, level.price, level.quantity));
        let needed = margin_requirement(exposure.quantity, uncovered, self.limits.leverage);
        let required = needed.max(self.limits.min_balance);
        let available = market.balance.available;
        if available < self.limits.min_balance || available < needed {
            return Some(RiskSignal::InsufficientBalance { required, available });
        }

        None
    }
}
