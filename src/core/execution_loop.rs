// The sequential control loop driving the grid

use crate::config::{BotConfig, ConfigError};
use crate::core::bot_state::BotState;
use crate::core::error_handling::{RetryPolicy, ShutdownSignal};
use crate::core::grid_planner::GridPlanner;
use crate::core::order_manager::OrderManager;
use crate::core::reconciliation::{ExchangeSnapshot, ReconciliationService};
use crate::core::risk_guard::{RiskGuard, RiskLimits};
use crate::core::types::{
    HaltReason, HaltRecord, MarketSnapshot, OrderEvent, OrderEventKind, OrderState,
};
use crate::error::{GridBotError, GridBotResult};
use crate::exchange::{ExchangeClient, ExchangeError, OrderRequest, SubmitOutcome};
use crate::notify::{AlertLevel, HaltNotice, Notifier};
use crate::persistence::StateStore;
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Inputs the loop reacts to, one at a time.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    Market(MarketSnapshot),
    Order(OrderEvent),
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt(HaltReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Stopped,
    Halted(HaltReason),
}

enum Wake {
    Shutdown,
    Event(Option<OrderEvent>),
    Tick,
}

pub struct ExecutionLoop {
    config: BotConfig,
    exchange: Arc<dyn ExchangeClient>,
    store: Box<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    planner: GridPlanner,
    orders: OrderManager,
    risk: RiskGuard,
    reconciler: ReconciliationService,
    retry: RetryPolicy,
    shutdown: ShutdownSignal,
    state: Option<BotState>,
    events: Option<BoxStream<'static, OrderEvent>>,
    market: Option<MarketSnapshot>,
    ticks: u64,
    rejections: HashMap<usize, u32>,
    needs_reconcile: bool,
    stream_ends: u32,
    subscribed_at: Instant,
}

fn not_started() -> GridBotError {
    GridBotError::Internal("execution loop has not been started".to_string())
}

impl ExecutionLoop {
    pub fn new(
        config: BotConfig,
        exchange: Arc<dyn ExchangeClient>,
        store: Box<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let planner = GridPlanner::new(config.grid.clone());
        let risk = RiskGuard::new(RiskLimits::from_config(&config.grid, &config.risk));
        let retry = RetryPolicy::from_config(&config.execution);
        Self {
            reconciler: ReconciliationService::new(planner.clone()),
            planner,
            orders: OrderManager::new(),
            risk,
            retry,
            config,
            exchange,
            store,
            notifier,
            shutdown,
            state: None,
            events: None,
            market: None,
            ticks: 0,
            rejections: HashMap::new(),
            needs_reconcile: false,
            stream_ends: 0,
            subscribed_at: Instant::now(),
        }
    }

    pub fn state(&self) -> Option<&BotState> {
        self.state.as_ref()
    }

    pub fn market(&self) -> Option<&MarketSnapshot> {
        self.market.as_ref()
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    /// Load or create the state, reconcile it against the exchange and
    /// cover every armed level.
    pub async fn start(&mut self, resume: bool) -> GridBotResult<Flow> {
        self.subscribe();
        let pair = self.config.grid.pair.clone();

        match self.store.load_state()? {
            None => {
                let market = self.fetch_market().await?;
                let plan = self.planner.plan(market.reference_price)?;
                self.market = Some(market);
                self.state = Some(BotState::new(pair.clone(), plan));
                self.persist()?;
                info!(
                    pair = %pair,
                    store = %self.store.describe(),
                    price = market.reference_price,
                    "🚀 Started fresh grid"
                );
            }
            Some(loaded) => {
                if loaded.pair != pair {
                    return Err(GridBotError::Config(ConfigError::Validation(format!(
                        "persisted state is for {} but the configuration trades {}",
                        loaded.pair, pair
                    ))));
                }
                if let Some(halt) = &loaded.halt {
                    if !resume {
                        return Err(GridBotError::Halted { reason: halt.reason });
                    }
                    info!(reason = %halt.reason, detail = %halt.detail, "▶️ Resuming after halt");
                }
                info!(
                    sequence = loaded.sequence,
                    orders = loaded.orders.len(),
                    active = loaded.active_orders().count(),
                    generation = loaded.plan.generation,
                    "📂 Loaded persisted state from {}",
                    self.store.describe()
                );
                self.state = Some(loaded);

                if let Some(flow) = self.reconcile_state().await? {
                    return Ok(flow);
                }
                if let Some(state) = self.state.as_mut() {
                    if state.halt.take().is_some() {
                        info!("halt record cleared after reconciliation");
                    }
                }
                if self.config.execution.replan_on_start {
                    if let Some(flow) = self.replan().await? {
                        return Ok(flow);
                    }
                }
                self.persist()?;
                self.market = Some(self.fetch_market().await?);
            }
        }

        self.after_state_change().await
    }

    /// Drive the loop until shutdown or halt.
    pub async fn run(&mut self) -> GridBotResult<RunOutcome> {
        match self.state.as_ref() {
            None => return Err(not_started()),
            Some(state) => {
                if let Some(halt) = &state.halt {
                    return Ok(RunOutcome::Halted(halt.reason));
                }
            }
        }

        if self.events.is_none() {
            self.subscribe();
        }
        let mut events = match self.events.take() {
            Some(events) => events,
            None => return Err(not_started()),
        };
        let mut ticker = interval(Duration::from_secs(
            self.config.execution.poll_interval_seconds.max(1),
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.subscribe();

        info!(
            poll_interval_seconds = self.config.execution.poll_interval_seconds,
            reconcile_every_ticks = self.config.execution.reconcile_every_ticks,
            "🔄 Execution loop running"
        );

        loop {
            if self.shutdown.is_requested() {
                self.events = Some(events);
                return self.drain().await;
            }

            let wake = tokio::select! {
                biased;
                _ = shutdown.changed() => Wake::Shutdown,
                next = events.next() => Wake::Event(next),
                _ = ticker.tick() => Wake::Tick,
            };

            let flow = match wake {
                Wake::Shutdown => continue,
                Wake::Event(Some(event)) => self.process(LoopEvent::Order(event)).await?,
                Wake::Event(None) => {
                    let flow = self.on_stream_end().await?;
                    if let Some(next) = self.events.take() {
                        events = next;
                    }
                    flow
                }
                Wake::Tick => self.process(LoopEvent::Timer).await?,
            };

            if let Flow::Halt(reason) = flow {
                self.events = Some(events);
                return Ok(RunOutcome::Halted(reason));
            }
        }
    }

    /// Handle a single event. Refuses to act once halted.
    pub async fn process(&mut self, event: LoopEvent) -> GridBotResult<Flow> {
        let state = self.state.as_ref().ok_or_else(not_started)?;
        if let Some(halt) = &state.halt {
            return Ok(Flow::Halt(halt.reason));
        }

        match event {
            LoopEvent::Market(snapshot) => self.on_market(snapshot).await,
            LoopEvent::Order(event) => self.on_order_event(event).await,
            LoopEvent::Timer => self.on_timer().await,
        }
    }

    /// Process every order event already waiting on the subscription.
    pub async fn drain_ready_events(&mut self) -> GridBotResult<Flow> {
        loop {
            let next = match self.events.as_mut() {
                Some(stream) => stream.next().now_or_never(),
                None => return Ok(Flow::Continue),
            };
            let flow = match next {
                Some(Some(event)) => self.process(LoopEvent::Order(event)).await?,
                Some(None) => self.on_stream_end().await?,
                None => return Ok(Flow::Continue),
            };
            if let Flow::Halt(reason) = flow {
                return Ok(Flow::Halt(reason));
            }
        }
    }

    async fn on_market(&mut self, snapshot: MarketSnapshot) -> GridBotResult<Flow> {
        debug!(
            price = snapshot.reference_price,
            available = snapshot.balance.available,
            "market tick"
        );
        self.market = Some(snapshot);
        let rolled = match self.state.as_mut() {
            Some(state) => state.roll_day(snapshot.observed_at.date_naive()),
            None => false,
        };
        if rolled {
            info!(day = %snapshot.observed_at.date_naive(), "📅 New trading day; daily limits reset");
            self.persist()?;
        }
        self.after_state_change().await
    }

    async fn on_order_event(&mut self, event: OrderEvent) -> GridBotResult<Flow> {
        let now = Utc::now();
        let state = self.state.as_mut().ok_or_else(not_started)?;

        match self.orders.apply_event(state, &event, now) {
            Ok(outcome) => {
                if let Some(fill) = &outcome.fill {
                    state.record_fill(now);
                    self.rejections.remove(&fill.level_index);
                    if let Some(next) = self.planner.relevel(&state.plan, fill) {
                        info!(
                            level = fill.level_index,
                            side = %fill.side,
                            price = fill.price,
                            quantity = fill.quantity,
                            generation = next.generation,
                            "🔁 Fill re-leveled the grid"
                        );
                        state.plan = next;
                    }
                }
                self.persist()?;
                self.after_state_change().await
            }
            Err(GridBotError::UnknownOrder(id)) => {
                debug!(order = %id, kind = event.kind.name(), "event for an order we do not track");
                Ok(Flow::Continue)
            }
            Err(e) if e.is_transition_error() => {
                if Self::is_stale_event(state, &event) {
                    debug!(order = %event.order_id, kind = event.kind.name(), "duplicate event ignored");
                    return Ok(Flow::Continue);
                }
                warn!(error = %e, "order event rejected; reconciling with the exchange");
                self.reconcile_now().await
            }
            Err(e) => Err(e),
        }
    }

    /// An event repeating what the local state already records.
    fn is_stale_event(state: &BotState, event: &OrderEvent) -> bool {
        let order = state
            .find_order_key(&event.order_id)
            .and_then(|key| state.orders.get(&key));
        match (order.map(|o| o.state), &event.kind) {
            (Some(OrderState::Filled), OrderEventKind::Filled)
            | (Some(OrderState::Cancelled), OrderEventKind::Cancelled)
            | (Some(OrderState::Rejected), OrderEventKind::Rejected { .. }) => true,
            (Some(current), OrderEventKind::Acknowledged) => current != OrderState::Pending,
            _ => false,
        }
    }

    async fn on_timer(&mut self) -> GridBotResult<Flow> {
        self.ticks += 1;

        match self.fetch_market().await {
            Ok(snapshot) => {
                if let Flow::Halt(reason) = self.on_market(snapshot).await? {
                    return Ok(Flow::Halt(reason));
                }
            }
            Err(e) => {
                warn!(error = %e, "market refresh failed; will reconcile once reachable");
                self.needs_reconcile = true;
                return Ok(Flow::Continue);
            }
        }

        if self.needs_reconcile || self.ticks % self.config.execution.reconcile_every_ticks.max(1) == 0 {
            return self.reconcile_now().await;
        }
        Ok(Flow::Continue)
    }

    /// Back off, resubscribe and reconcile. Too many consecutive ends halt.
    async fn on_stream_end(&mut self) -> GridBotResult<Flow> {
        // A subscription that lived a full poll interval counts as healthy
        let healthy = Duration::from_secs(self.config.execution.poll_interval_seconds.max(1));
        if self.subscribed_at.elapsed() >= healthy {
            self.stream_ends = 0;
        }
        self.stream_ends += 1;
        let ends = self.stream_ends;

        if ends > self.config.execution.max_stream_restarts {
            let detail = format!("order event stream ended {} times in a row", ends);
            return self.halt(HaltReason::EventStreamLost, detail).await;
        }

        let delay = self.retry.delay_for(ends - 1);
        warn!(
            consecutive = ends,
            delay_ms = delay.as_millis() as u64,
            "order event stream ended; resubscribing"
        );
        self.notifier
            .alert(AlertLevel::Warning, "order event stream dropped; reconciling");

        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.requested() => {}
            _ = sleep(delay) => {}
        }
        self.subscribe();
        if self.shutdown.is_requested() {
            return Ok(Flow::Continue);
        }
        self.reconcile_now().await
    }

    fn subscribe(&mut self) {
        self.events = Some(self.exchange.order_events());
        self.subscribed_at = Instant::now();
    }

    async fn reconcile_now(&mut self) -> GridBotResult<Flow> {
        match self.reconcile_state().await {
            Ok(Some(flow)) => Ok(flow),
            Ok(None) => self.after_state_change().await,
            Err(GridBotError::Exchange(e)) => {
                warn!(error = %e, "reconciliation deferred; exchange unreachable");
                self.needs_reconcile = true;
                Ok(Flow::Continue)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch a snapshot and apply it. `Some(flow)` when it ended in a halt.
    async fn reconcile_state(&mut self) -> GridBotResult<Option<Flow>> {
        let snapshot = {
            let exchange = self.exchange.as_ref();
            let pair = self.config.grid.pair.as_str();
            self.retry
                .execute("fetch_snapshot", || ExchangeSnapshot::fetch(exchange, pair))
                .await?
        };

        let state = self.state.as_mut().ok_or_else(not_started)?;
        let report = match self.reconciler.apply(state, &snapshot, Utc::now()) {
            Ok(report) => report,
            Err(e @ GridBotError::ReconciliationConflict { .. }) => {
                let flow = self.halt(HaltReason::ReconciliationConflict, e.to_string()).await?;
                return Ok(Some(flow));
            }
            Err(e) => return Err(e),
        };

        self.needs_reconcile = false;
        let now = Utc::now();
        for fill in &report.fills {
            state.record_fill(now);
            self.rejections.remove(&fill.level_index);
        }
        self.persist()?;

        if !report.orphans.is_empty() {
            if self.config.execution.cancel_orphans {
                for orphan in &report.orphans {
                    let cancelled = self.cancel_on_exchange(&orphan.order_id).await;
                    warn!(order = %orphan.order_id, side = %orphan.side, price = orphan.price, cancelled, "orphan order cancelled");
                }
                self.notifier.alert(
                    AlertLevel::Warning,
                    &format!("cancelled {} orphan order(s) unknown to the bot", report.orphans.len()),
                );
            } else {
                warn!(count = report.orphans.len(), "orphan orders left on the exchange");
            }
        }

        Ok(None)
    }

    /// Cancel all orders and rebuild the grid around the current price.
    async fn replan(&mut self) -> GridBotResult<Option<Flow>> {
        info!("♻️ Re-plan requested; cancelling active orders");
        self.cancel_active_orders().await;
        if let Some(flow) = self.reconcile_state().await? {
            return Ok(Some(flow));
        }

        let price = self.fetch_price().await?;
        let state = self.state.as_mut().ok_or_else(not_started)?;
        let plan = self.planner.replan(price, &state.plan)?;
        info!(epoch = plan.epoch, generation = plan.generation, price, "new grid generation planned");
        state.plan = plan;
        self.rejections.clear();
        Ok(None)
    }

    async fn after_state_change(&mut self) -> GridBotResult<Flow> {
        let signal = match (&self.state, &self.market) {
            (Some(state), Some(market)) => self.risk.evaluate(state, market),
            _ => None,
        };
        if let Some(signal) = signal {
            return self.halt(signal.halt_reason(), signal.to_string()).await;
        }
        self.cover_uncovered().await
    }

    async fn cover_uncovered(&mut self) -> GridBotResult<Flow> {
        let levels = {
            let state = self.state.as_ref().ok_or_else(not_started)?;
            self.orders.uncovered_levels(state)
        };

        for level in levels {
            if self.shutdown.is_requested() {
                break;
            }
            if let Flow::Halt(reason) = self.submit_level(level.index).await? {
                return Ok(Flow::Halt(reason));
            }
        }
        Ok(Flow::Continue)
    }

    /// Register, persist, then submit. The order is on disk as `Pending`
    /// before the exchange sees it.
    async fn submit_level(&mut self, level_index: usize) -> GridBotResult<Flow> {
        let now = Utc::now();
        let state = self.state.as_mut().ok_or_else(not_started)?;
        let order = match self.orders.register(state, level_index, now) {
            Ok(order) => order,
            Err(e) if e.is_transition_error() => {
                warn!(level = level_index, error = %e, "cannot register order; reconciling later");
                self.needs_reconcile = true;
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e),
        };
        self.persist()?;

        let request = OrderRequest {
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            price: order.price,
            quantity: order.quantity,
        };
        let result = {
            let exchange = self.exchange.as_ref();
            let pair = self.config.grid.pair.as_str();
            self.retry
                .execute("submit_order", || exchange.submit_order(pair, &request))
                .await
        };

        match result {
            Ok(SubmitOutcome::Accepted { order_id }) => {
                let state = self.state.as_mut().ok_or_else(not_started)?;
                self.orders
                    .assign_exchange_id(state, &order.client_order_id, &order_id, Utc::now())?;
                self.rejections.remove(&level_index);
                self.persist()?;
                info!(
                    order = %order.client_order_id,
                    exchange_id = %order_id,
                    level = level_index,
                    side = %order.side,
                    price = order.price,
                    quantity = order.quantity,
                    "📤 Order submitted"
                );
                Ok(Flow::Continue)
            }
            Ok(SubmitOutcome::Rejected { reason }) => {
                let state = self.state.as_mut().ok_or_else(not_started)?;
                let kind = OrderEventKind::Rejected { reason: reason.clone() };
                self.orders
                    .apply(state, &order.client_order_id, &kind, None, Utc::now())?;
                self.persist()?;

                let count = self.rejections.entry(level_index).or_insert(0);
                *count += 1;
                let count = *count;
                warn!(level = level_index, rejections = count, reason = %reason, "❌ Order rejected by exchange");

                if count > self.retry.max_retries() {
                    let detail = format!(
                        "level {} rejected {} times in a row: {}",
                        level_index, count, reason
                    );
                    return self.halt(HaltReason::SubmissionFailed, detail).await;
                }
                Ok(Flow::Continue)
            }
            Err(e) => {
                // Outcome unknown; the order stays Pending for reconciliation
                let detail = format!("submitting level {} failed: {}", level_index, e);
                self.halt(HaltReason::SubmissionFailed, detail).await
            }
        }
    }

    async fn halt(&mut self, reason: HaltReason, detail: String) -> GridBotResult<Flow> {
        let state = self.state.as_mut().ok_or_else(not_started)?;
        state.halt = Some(HaltRecord {
            reason,
            detail: detail.clone(),
            halted_at: Utc::now(),
        });
        self.persist()?;

        if self.config.risk.cancel_on_halt {
            let cancelled = self.cancel_active_orders().await;
            info!(cancelled, "open orders cancelled after halt");
        }

        if let Some(state) = self.state.as_ref() {
            let notice = HaltNotice::from_state(state, reason, detail);
            self.notifier.halt(&notice);
        }
        Ok(Flow::Halt(reason))
    }

    async fn drain(&mut self) -> GridBotResult<RunOutcome> {
        info!("🛑 Draining before shutdown");
        if self.config.execution.cancel_on_shutdown {
            let cancelled = self.cancel_active_orders().await;
            info!(cancelled, "open orders cancelled for shutdown");
        }
        self.persist()?;
        info!("✅ State persisted; stopped");
        Ok(RunOutcome::Stopped)
    }

    /// Best effort; local state follows through events or reconciliation.
    async fn cancel_active_orders(&mut self) -> usize {
        let ids: Vec<String> = match self.state.as_ref() {
            Some(state) => state
                .active_orders()
                .filter_map(|o| o.exchange_order_id.clone())
                .collect(),
            None => return 0,
        };

        let mut cancelled = 0;
        for id in ids {
            if self.cancel_on_exchange(&id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    async fn cancel_on_exchange(&self, order_id: &str) -> bool {
        let exchange = self.exchange.as_ref();
        let pair = self.config.grid.pair.as_str();
        match self
            .retry
            .execute("cancel_order", || exchange.cancel_order(pair, order_id))
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(order = %order_id, error = %e, "cancel failed");
                false
            }
        }
    }

    async fn fetch_price(&self) -> Result<f64, ExchangeError> {
        let exchange = self.exchange.as_ref();
        let pair = self.config.grid.pair.as_str();
        self.retry
            .execute("reference_price", || exchange.reference_price(pair))
            .await
    }

    async fn fetch_market(&self) -> Result<MarketSnapshot, ExchangeError> {
        let reference_price = self.fetch_price().await?;
        let exchange = self.exchange.as_ref();
        let balance = self
            .retry
            .execute("get_balance", || exchange.get_balance())
            .await?;
        Ok(MarketSnapshot {
            reference_price,
            balance,
            observed_at: Utc::now(),
        })
    }

    /// Bump the sequence and write the snapshot.
    fn persist(&mut self) -> GridBotResult<()> {
        let state = self.state.as_mut().ok_or_else(not_started)?;
        self.orders
            .prune_terminal(state, self.config.execution.keep_terminal_orders);
        state.sequence += 1;
        state.updated_at = Utc::now();
        self.store.save_state(state)
    }
}
