// Order lifecycle tracking for the grid

use crate::core::bot_state::BotState;
use crate::core::types::{
    FillNotice, GridLevel, Order, OrderEvent, OrderEventKind, OrderState, QTY_EPSILON,
};
use crate::error::{GridBotError, GridBotResult};
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

/// Result of one applied transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub client_order_id: String,
    pub from: OrderState,
    pub to: OrderState,
    /// Set when the order reached `Filled`.
    pub fill: Option<FillNotice>,
    /// Set when a cancel or reject left an armed level of the current plan
    /// without coverage.
    pub uncovered_level: Option<usize>,
}

/// Owns every state change of every order. Stateless itself: all data lives
/// in the `BotState` passed in, so a rejected change never touches it.
#[derive(Debug, Clone, Default)]
pub struct OrderManager;

impl OrderManager {
    pub fn new() -> Self {
        Self
    }

    /// Create a `Pending` order for an armed level without coverage.
    pub fn register(
        &self,
        state: &mut BotState,
        level_index: usize,
        now: DateTime<Utc>,
    ) -> GridBotResult<Order> {
        let level = state
            .plan
            .level(level_index)
            .cloned()
            .ok_or(GridBotError::LevelNotArmed(level_index))?;

        if let Some(existing) = state.active_order_for_level(level_index) {
            return Err(GridBotError::DuplicateCoverage {
                level: level_index,
                order_id: existing.client_order_id.clone(),
            });
        }

        let order = Order {
            client_order_id: Uuid::new_v4().to_string(),
            exchange_order_id: None,
            level_index,
            epoch: state.plan.epoch,
            generation: state.plan.generation,
            side: level.side,
            price: level.price,
            quantity: level.quantity,
            filled: 0.0,
            average_fill_price: None,
            state: OrderState::Pending,
            submitted_at: now,
            updated_at: now,
            reason: None,
        };

        debug!(
            order = %order.client_order_id,
            level = level_index,
            side = %order.side,
            price = order.price,
            quantity = order.quantity,
            "order registered"
        );
        state.orders.insert(order.client_order_id.clone(), order.clone());
        Ok(order)
    }

    /// Record the exchange id returned on acceptance.
    pub fn assign_exchange_id(
        &self,
        state: &mut BotState,
        client_order_id: &str,
        exchange_order_id: &str,
        now: DateTime<Utc>,
    ) -> GridBotResult<()> {
        let order = state
            .orders
            .get_mut(client_order_id)
            .ok_or_else(|| GridBotError::UnknownOrder(client_order_id.to_string()))?;

        match order.exchange_order_id.as_deref() {
            Some(existing) if existing == exchange_order_id => Ok(()),
            Some(existing) => Err(GridBotError::InvalidOrderTransition {
                order_id: client_order_id.to_string(),
                from: order.state,
                to: order.state,
                event: format!("reassign exchange id {} -> {}", existing, exchange_order_id),
            }),
            None => {
                order.exchange_order_id = Some(exchange_order_id.to_string());
                order.updated_at = now;
                Ok(())
            }
        }
    }

    /// Apply an exchange event to the order it names.
    pub fn apply_event(
        &self,
        state: &mut BotState,
        event: &OrderEvent,
        now: DateTime<Utc>,
    ) -> GridBotResult<TransitionOutcome> {
        let key = state
            .find_order_key(&event.order_id)
            .or_else(|| {
                event
                    .client_order_id
                    .as_deref()
                    .and_then(|id| state.find_order_key(id))
            })
            .ok_or_else(|| GridBotError::UnknownOrder(event.order_id.clone()))?;

        let exchange_id = if event.client_order_id.as_deref() == Some(event.order_id.as_str()) {
            None
        } else {
            Some(event.order_id.as_str())
        };

        self.apply(state, &key, &event.kind, exchange_id, now)
    }

    /// Apply an event kind to a known order. Validation happens before any
    /// mutation.
    pub fn apply(
        &self,
        state: &mut BotState,
        client_order_id: &str,
        kind: &OrderEventKind,
        exchange_order_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> GridBotResult<TransitionOutcome> {
        let current = state
            .orders
            .get(client_order_id)
            .ok_or_else(|| GridBotError::UnknownOrder(client_order_id.to_string()))?;

        let (next, filled) = Self::next_state(current, kind)?;
        let from = current.state;

        let reason = match kind {
            OrderEventKind::Rejected { reason } => Some(reason.clone()),
            _ => None,
        };

        let order = match state.orders.get_mut(client_order_id) {
            Some(order) => order,
            None => return Err(GridBotError::UnknownOrder(client_order_id.to_string())),
        };
        order.state = next;
        order.filled = filled;
        if filled > 0.0 && order.average_fill_price.is_none() {
            order.average_fill_price = Some(order.price);
        }
        if order.exchange_order_id.is_none() {
            order.exchange_order_id = exchange_order_id.map(str::to_string);
        }
        if reason.is_some() {
            order.reason = reason;
        }
        order.updated_at = now;
        let order = order.clone();

        Ok(self.finish(state, order, from))
    }

    /// Reconciliation-only edge: close an order the exchange no longer
    /// knows about, bypassing the normal edge set.
    pub fn force_terminal(
        &self,
        state: &mut BotState,
        client_order_id: &str,
        target: OrderState,
        reason: &str,
        now: DateTime<Utc>,
    ) -> GridBotResult<TransitionOutcome> {
        let current = state
            .orders
            .get(client_order_id)
            .ok_or_else(|| GridBotError::UnknownOrder(client_order_id.to_string()))?;

        if current.state.is_terminal() || !matches!(target, OrderState::Rejected | OrderState::Cancelled) {
            return Err(GridBotError::InvalidOrderTransition {
                order_id: client_order_id.to_string(),
                from: current.state,
                to: target,
                event: "force_terminal".to_string(),
            });
        }
        let from = current.state;

        let order = match state.orders.get_mut(client_order_id) {
            Some(order) => order,
            None => return Err(GridBotError::UnknownOrder(client_order_id.to_string())),
        };
        order.state = target;
        order.reason = Some(reason.to_string());
        order.updated_at = now;
        let order = order.clone();

        Ok(self.finish(state, order, from))
    }

    fn finish(&self, state: &mut BotState, order: Order, from: OrderState) -> TransitionOutcome {
        let to = order.state;
        let mut fill = None;
        let mut uncovered_level = None;

        if to.is_terminal() && order.filled > 0.0 {
            state
                .position
                .apply_fill(order.side, order.filled, order.fill_price());
        }

        match to {
            OrderState::Filled => {
                fill = Some(FillNotice {
                    client_order_id: order.client_order_id.clone(),
                    level_index: order.level_index,
                    epoch: order.epoch,
                    side: order.side,
                    price: order.fill_price(),
                    quantity: order.filled,
                });
            }
            OrderState::Cancelled | OrderState::Rejected => {
                if order.epoch == state.plan.epoch && state.plan.levels.contains_key(&order.level_index) {
                    uncovered_level = Some(order.level_index);
                }
            }
            _ => {}
        }

        if from != to {
            info!(
                order = %order.client_order_id,
                exchange_id = order.exchange_order_id.as_deref().unwrap_or("-"),
                level = order.level_index,
                side = %order.side,
                filled = order.filled,
                "📋 Order {} -> {}",
                from,
                to
            );
        }

        TransitionOutcome {
            client_order_id: order.client_order_id,
            from,
            to,
            fill,
            uncovered_level,
        }
    }

    /// Compute the target state and filled quantity without mutating.
    fn next_state(order: &Order, kind: &OrderEventKind) -> GridBotResult<(OrderState, f64)> {
        let (next, filled) = match kind {
            OrderEventKind::Acknowledged => (OrderState::Open, order.filled),
            OrderEventKind::PartialFill { quantity } => {
                let attempted = order.filled + quantity;
                if *quantity <= 0.0 || attempted > order.quantity + QTY_EPSILON {
                    return Err(GridBotError::Overfill {
                        order_id: order.client_order_id.clone(),
                        attempted: *quantity,
                        filled: order.filled,
                        quantity: order.quantity,
                    });
                }
                if attempted >= order.quantity - QTY_EPSILON {
                    (OrderState::Filled, order.quantity)
                } else {
                    (OrderState::PartiallyFilled, attempted)
                }
            }
            OrderEventKind::Filled => (OrderState::Filled, order.quantity),
            OrderEventKind::Cancelled => (OrderState::Cancelled, order.filled),
            OrderEventKind::Rejected { .. } => (OrderState::Rejected, order.filled),
        };

        if !order.state.can_transition_to(next) {
            return Err(GridBotError::InvalidOrderTransition {
                order_id: order.client_order_id.clone(),
                from: order.state,
                to: next,
                event: kind.name().to_string(),
            });
        }

        Ok((next, filled))
    }

    /// Armed levels of the current plan that no active order covers.
    pub fn uncovered_levels(&self, state: &BotState) -> Vec<GridLevel> {
        state
            .plan
            .armed_levels()
            .filter(|level| state.active_order_for_level(level.index).is_none())
            .cloned()
            .collect()
    }

    /// Fold all but the `keep` most recent terminal orders into the archived
    /// position baseline. Returns how many orders were pruned.
    pub fn prune_terminal(&self, state: &mut BotState, keep: usize) -> usize {
        let mut terminal: Vec<(DateTime<Utc>, String)> = state
            .terminal_orders()
            .map(|o| (o.updated_at, o.client_order_id.clone()))
            .collect();
        if terminal.len() <= keep {
            return 0;
        }
        terminal.sort();

        let excess = terminal.len() - keep;
        for (_, id) in terminal.into_iter().take(excess) {
            if let Some(order) = state.orders.remove(&id) {
                if order.filled > 0.0 {
                    state
                        .archived_position
                        .apply_fill(order.side, order.filled, order.fill_price());
                }
            }
        }
        debug!(pruned = excess, "terminal orders archived");
        excess
    }
}
