// Reconciliation of local intent against exchange-reported orders

use crate::core::bot_state::BotState;
use crate::core::grid_planner::GridPlanner;
use crate::core::order_manager::{OrderManager, TransitionOutcome};
use crate::core::types::{FillNotice, GridLevel, Order, OrderEventKind, OrderState, QTY_EPSILON};
use crate::error::{GridBotError, GridBotResult};
use crate::exchange::{ExchangeClient, ExchangeError, ExchangeOrder, ExchangeOrderStatus};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Open orders plus recent history for one pair, fetched together.
#[derive(Debug, Clone, Default)]
pub struct ExchangeSnapshot {
    pub open_orders: Vec<ExchangeOrder>,
    pub history: Vec<ExchangeOrder>,
}

impl ExchangeSnapshot {
    pub async fn fetch(exchange: &dyn ExchangeClient, pair: &str) -> Result<Self, ExchangeError> {
        let open_orders = exchange.get_open_orders(pair).await?;
        let history = exchange.get_order_history(pair).await?;
        Ok(Self { open_orders, history })
    }

    fn all(&self) -> impl Iterator<Item = &ExchangeOrder> {
        self.open_orders.iter().chain(self.history.iter())
    }

    /// Locate the record of a local order, by exchange id first.
    pub fn find(&self, order: &Order) -> Option<&ExchangeOrder> {
        order
            .exchange_order_id
            .as_deref()
            .and_then(|id| self.all().find(|r| r.order_id == id))
            .or_else(|| {
                self.all()
                    .find(|r| r.client_order_id.as_deref() == Some(order.client_order_id.as_str()))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationReport {
    pub transitions: Vec<TransitionOutcome>,
    pub fills: Vec<FillNotice>,
    /// Local orders the exchange had no record of.
    pub missing: Vec<String>,
    /// Exchange open orders unknown locally.
    pub orphans: Vec<ExchangeOrder>,
    pub uncovered: Vec<GridLevel>,
}

impl ReconciliationReport {
    pub fn changed(&self) -> bool {
        !self.transitions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationService {
    planner: GridPlanner,
    orders: OrderManager,
}

impl ReconciliationService {
    pub fn new(planner: GridPlanner) -> Self {
        Self {
            planner,
            orders: OrderManager::new(),
        }
    }

    /// Bring `state` in line with `snapshot`.
    ///
    /// Runs on a copy and commits only on success, so a conflict leaves
    /// `state` untouched. Applying the same snapshot twice yields the same
    /// state.
    pub fn apply(
        &self,
        state: &mut BotState,
        snapshot: &ExchangeSnapshot,
        now: DateTime<Utc>,
    ) -> GridBotResult<ReconciliationReport> {
        for order in state.orders.values() {
            if let Some(record) = snapshot.find(order) {
                if record.filled > order.quantity + QTY_EPSILON {
                    return Err(GridBotError::ReconciliationConflict {
                        order_id: order.client_order_id.clone(),
                        exchange_filled: record.filled,
                        local_quantity: order.quantity,
                    });
                }
            }
        }

        let mut work = state.clone();
        let mut report = ReconciliationReport::default();

        // Oldest exchange activity first so fills re-level in the order they happened
        let mut active: Vec<(Option<DateTime<Utc>>, String)> = work
            .active_orders()
            .map(|o| (snapshot.find(o).map(|r| r.updated_at), o.client_order_id.clone()))
            .collect();
        active.sort_by(|a, b| match (a.0, b.0) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.1.cmp(&b.1)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.1.cmp(&b.1),
        });

        for (_, id) in active {
            let order = match work.orders.get(&id) {
                Some(order) => order.clone(),
                None => continue,
            };
            match snapshot.find(&order) {
                Some(record) => {
                    let record = record.clone();
                    self.sync_order(&mut work, &order, &record, now, &mut report)?;
                }
                None => {
                    let outcome = if order.state == OrderState::PartiallyFilled {
                        self.orders
                            .apply(&mut work, &id, &OrderEventKind::Cancelled, None, now)?
                    } else {
                        self.orders.force_terminal(
                            &mut work,
                            &id,
                            OrderState::Rejected,
                            "no exchange record",
                            now,
                        )?
                    };
                    warn!(order = %id, level = order.level_index, to = %outcome.to, "exchange has no record of order");
                    report.missing.push(id.clone());
                    report.transitions.push(outcome);
                }
            }
        }

        for outcome in &report.transitions {
            if let Some(fill) = &outcome.fill {
                report.fills.push(fill.clone());
                if let Some(next) = self.planner.relevel(&work.plan, fill) {
                    work.plan = next;
                }
            }
        }

        work.position = work.recompute_position();

        report.orphans = snapshot
            .open_orders
            .iter()
            .filter(|record| !Self::is_known(&work, record))
            .cloned()
            .collect();
        report.uncovered = self.orders.uncovered_levels(&work);

        if report.changed() || !report.orphans.is_empty() {
            info!(
                transitions = report.transitions.len(),
                fills = report.fills.len(),
                missing = report.missing.len(),
                orphans = report.orphans.len(),
                uncovered = report.uncovered.len(),
                "🔄 Reconciliation applied"
            );
        }

        *state = work;
        Ok(report)
    }

    fn sync_order(
        &self,
        work: &mut BotState,
        order: &Order,
        record: &ExchangeOrder,
        now: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) -> GridBotResult<()> {
        let id = order.client_order_id.as_str();
        let exchange_id = Some(record.order_id.as_str());

        if order.state == OrderState::Pending {
            if record.status == ExchangeOrderStatus::Rejected {
                let kind = OrderEventKind::Rejected {
                    reason: "rejected by exchange".to_string(),
                };
                report.transitions.push(self.orders.apply(work, id, &kind, exchange_id, now)?);
                return Ok(());
            }
            report
                .transitions
                .push(self.orders.apply(work, id, &OrderEventKind::Acknowledged, exchange_id, now)?);
        }

        let local_filled = work.orders.get(id).map(|o| o.filled).unwrap_or(order.filled);
        let delta = record.filled - local_filled;
        if delta < -QTY_EPSILON {
            warn!(order = %id, exchange_filled = record.filled, local_filled, "exchange reports less fill than local; keeping local");
        }

        match record.status {
            ExchangeOrderStatus::Open | ExchangeOrderStatus::PartiallyFilled => {
                if delta > QTY_EPSILON {
                    let kind = OrderEventKind::PartialFill { quantity: delta };
                    report.transitions.push(self.orders.apply(work, id, &kind, exchange_id, now)?);
                }
            }
            ExchangeOrderStatus::Filled => {
                report
                    .transitions
                    .push(self.orders.apply(work, id, &OrderEventKind::Filled, exchange_id, now)?);
            }
            ExchangeOrderStatus::Cancelled | ExchangeOrderStatus::Rejected => {
                if delta > QTY_EPSILON {
                    let kind = OrderEventKind::PartialFill { quantity: delta };
                    let outcome = self.orders.apply(work, id, &kind, exchange_id, now)?;
                    let completed = outcome.to == OrderState::Filled;
                    report.transitions.push(outcome);
                    if completed {
                        return Ok(());
                    }
                }
                report
                    .transitions
                    .push(self.orders.apply(work, id, &OrderEventKind::Cancelled, exchange_id, now)?);
            }
        }

        Ok(())
    }

    fn is_known(state: &BotState, record: &ExchangeOrder) -> bool {
        state.orders.values().any(|o| {
            o.exchange_order_id.as_deref() == Some(record.order_id.as_str())
                || record.client_order_id.as_deref() == Some(o.client_order_id.as_str())
        })
    }
}
