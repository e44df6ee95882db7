// Integration tests for the execution loop against the paper exchange

mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::{TestHarness, PAIR};
use conservative_grid_bot::core::{Balance, OrderEvent, OrderEventKind};
use conservative_grid_bot::exchange::{
    ExchangeOrder, ExchangeOrderStatus, OrderRequest, SubmitOutcome,
};
use conservative_grid_bot::{
    BotState, ExchangeClient, ExchangeError, ExecutionLoop, Flow, GridBotError, GridPlanner,
    HaltReason, LoopEvent, OrderManager, OrderState, PaperExchange, RunOutcome, Side, StateStore,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

/// State on disk with one registered order that never reached the venue
fn persisted_with_pending(harness: &TestHarness, level: usize) -> (BotState, String) {
    let planner = GridPlanner::new(harness.config.grid.clone());
    let mut state = BotState::new(PAIR, planner.plan(100.0).unwrap());
    let pending = OrderManager::new()
        .register(&mut state, level, Utc::now())
        .unwrap();
    state.sequence = 1;
    harness.store().save_state(&state).unwrap();
    (state, pending.client_order_id)
}

#[tokio::test]
async fn test_fresh_start_covers_every_armed_level() {
    let harness = TestHarness::new(100.0, 1_000.0);
    let mut engine = harness.engine();

    assert_eq!(engine.start(false).await.unwrap(), Flow::Continue);
    assert_eq!(engine.drain_ready_events().await.unwrap(), Flow::Continue);

    let state = engine.state().unwrap();
    assert_eq!(state.plan.rungs, vec![90.0, 95.0, 100.0, 105.0, 110.0]);
    assert!(state.plan.level(2).is_none());

    for (index, side) in [(0, Side::Buy), (1, Side::Buy), (3, Side::Sell), (4, Side::Sell)] {
        let order = state
            .active_order_for_level(index)
            .unwrap_or_else(|| panic!("level {} should be covered", index));
        assert_eq!(order.side, side);
        assert_eq!(order.state, OrderState::Open);
        assert!(order.exchange_order_id.is_some());
    }
    assert_eq!(harness.exchange.open_orders().len(), 4);

    let persisted = harness.store().load_state().unwrap().unwrap();
    assert_eq!(persisted.sequence, state.sequence);
    assert_eq!(persisted.orders.len(), 4);
}

#[tokio::test]
async fn test_buy_fill_arms_sell_and_round_trip_realizes_profit() {
    let harness = TestHarness::new(100.0, 1_000.0);
    let mut engine = harness.engine();
    engine.start(false).await.unwrap();
    engine.drain_ready_events().await.unwrap();

    let bought = engine.state().unwrap().active_order_for_level(1).unwrap().clone();

    harness.exchange.set_price(95.0);
    assert_eq!(engine.drain_ready_events().await.unwrap(), Flow::Continue);

    let state = engine.state().unwrap();
    assert_eq!(state.orders[&bought.client_order_id].state, OrderState::Filled);
    assert!(state.plan.level(1).is_none(), "filled rung goes idle");

    let sell_level = state.plan.level(2).expect("sell armed one rung up");
    assert_eq!(sell_level.side, Side::Sell);
    assert_eq!(sell_level.price, 100.0);
    assert!(approx(sell_level.quantity, bought.quantity));

    let sell = state.active_order_for_level(2).expect("replacement submitted");
    assert_eq!(sell.state, OrderState::Open);
    assert!(approx(state.position.quantity, bought.quantity));

    harness.exchange.set_price(100.0);
    engine.drain_ready_events().await.unwrap();

    let state = engine.state().unwrap();
    assert!(state.position.is_flat());
    assert!(approx(state.position.realized_pnl, bought.quantity * 5.0));
    assert_eq!(state.plan.level(1).unwrap().side, Side::Buy);
    assert!(state.plan.level(2).is_none());
    assert!(state.active_order_for_level(1).is_some());
}

#[tokio::test]
async fn test_duplicate_fill_event_is_ignored() {
    let harness = TestHarness::new(100.0, 1_000.0);
    let mut engine = harness.engine();
    engine.start(false).await.unwrap();
    engine.drain_ready_events().await.unwrap();

    let bought = engine.state().unwrap().active_order_for_level(1).unwrap().clone();
    harness.exchange.set_price(95.0);
    engine.drain_ready_events().await.unwrap();

    let before = engine.state().unwrap().clone();
    let duplicate = OrderEvent {
        order_id: bought.exchange_order_id.clone().unwrap(),
        client_order_id: Some(bought.client_order_id.clone()),
        kind: OrderEventKind::Filled,
        timestamp: Utc::now(),
    };
    let flow = engine.process(LoopEvent::Order(duplicate)).await.unwrap();

    assert_eq!(flow, Flow::Continue);
    assert_eq!(engine.state().unwrap(), &before);
}

#[tokio::test]
async fn test_out_of_range_halts_cancels_and_persists() {
    let harness = TestHarness::new(100.0, 1_000.0);
    let mut engine = harness.engine();
    engine.start(false).await.unwrap();
    engine.drain_ready_events().await.unwrap();
    let submissions = harness.exchange.submission_count();

    let mut snapshot = harness.market().await;
    snapshot.reference_price = 115.0;
    let flow = engine.process(LoopEvent::Market(snapshot)).await.unwrap();

    assert_eq!(flow, Flow::Halt(HaltReason::OutOfRange));
    assert!(harness.exchange.open_orders().is_empty(), "cancel_on_halt clears the book");

    let persisted = harness.store().load_state().unwrap().unwrap();
    assert_eq!(persisted.halt.unwrap().reason, HaltReason::OutOfRange);
    assert_eq!(harness.notifier.history().halts().len(), 1);

    // Halted loops refuse further work
    let flow = engine.process(LoopEvent::Timer).await.unwrap();
    assert_eq!(flow, Flow::Halt(HaltReason::OutOfRange));
    assert_eq!(harness.exchange.submission_count(), submissions);
}

#[tokio::test]
async fn test_halted_state_needs_explicit_resume() {
    let harness = TestHarness::new(100.0, 1_000.0);
    let mut engine = harness.engine();
    engine.start(false).await.unwrap();
    engine.drain_ready_events().await.unwrap();
    let mut snapshot = harness.market().await;
    snapshot.reference_price = 80.0;
    engine.process(LoopEvent::Market(snapshot)).await.unwrap();
    drop(engine);

    let mut restarted = harness.engine();
    let err = restarted.start(false).await.unwrap_err();
    assert!(matches!(err, GridBotError::Halted { reason: HaltReason::OutOfRange }));

    let mut resumed = harness.engine();
    assert_eq!(resumed.start(true).await.unwrap(), Flow::Continue);
    resumed.drain_ready_events().await.unwrap();

    let state = resumed.state().unwrap();
    assert!(state.halt.is_none());
    assert_eq!(state.active_orders().count(), 4);
    assert_eq!(
        state.orders.values().filter(|o| o.state == OrderState::Cancelled).count(),
        4
    );
    assert_eq!(harness.exchange.open_orders().len(), 4);
}

#[tokio::test]
async fn test_drawdown_halts() {
    let harness = TestHarness::with_config(100.0, 1_000.0, |config| {
        config.risk.max_drawdown_pct = 0.5;
    });
    let mut engine = harness.engine();
    engine.start(false).await.unwrap();
    engine.drain_ready_events().await.unwrap();

    harness.exchange.set_price(95.0);
    assert_eq!(engine.drain_ready_events().await.unwrap(), Flow::Continue);

    // Long ~1.05 from 95; at 91 the loss is ~4.2 against a 2.5 limit
    harness.exchange.set_price(91.0);
    let snapshot = harness.market().await;
    let flow = engine.process(LoopEvent::Market(snapshot)).await.unwrap();
    assert_eq!(flow, Flow::Halt(HaltReason::DrawdownExceeded));
}

#[tokio::test]
async fn test_insufficient_balance_halts_before_submitting() {
    let harness = TestHarness::new(100.0, 300.0);
    let mut engine = harness.engine();

    let flow = engine.start(false).await.unwrap();

    assert_eq!(flow, Flow::Halt(HaltReason::InsufficientBalance));
    assert_eq!(harness.exchange.submission_count(), 0);
    assert!(engine.state().unwrap().orders.is_empty());
}

#[tokio::test]
async fn test_crash_before_submit_resubmits_level() {
    let harness = TestHarness::new(100.0, 1_000.0);
    let (_, pending) = persisted_with_pending(&harness, 0);

    let mut engine = harness.engine();
    assert_eq!(engine.start(false).await.unwrap(), Flow::Continue);
    engine.drain_ready_events().await.unwrap();

    let state = engine.state().unwrap();
    assert_eq!(state.orders[&pending].state, OrderState::Rejected);
    let replacement = state.active_order_for_level(0).unwrap();
    assert_ne!(replacement.client_order_id, pending);
    assert_eq!(harness.exchange.open_orders().len(), 4);
}

#[tokio::test]
async fn test_crash_after_submit_adopts_exchange_order() {
    let harness = TestHarness::new(100.0, 1_000.0);
    let (state, pending) = persisted_with_pending(&harness, 0);
    let order = &state.orders[&pending];
    harness
        .exchange
        .submit_order(
            PAIR,
            &OrderRequest {
                client_order_id: pending.clone(),
                side: order.side,
                price: order.price,
                quantity: order.quantity,
            },
        )
        .await
        .unwrap();

    let mut engine = harness.engine();
    engine.start(false).await.unwrap();
    engine.drain_ready_events().await.unwrap();

    let state = engine.state().unwrap();
    let adopted = &state.orders[&pending];
    assert_eq!(adopted.state, OrderState::Open);
    assert_eq!(adopted.exchange_order_id.as_deref(), Some("P-1"));
    assert_eq!(harness.exchange.submission_count(), 4, "no duplicate for level 0");
    assert_eq!(harness.exchange.open_orders().len(), 4);
}

#[tokio::test]
async fn test_reconciliation_conflict_halts() {
    let harness = TestHarness::new(100.0, 1_000.0);
    let (state, pending) = persisted_with_pending(&harness, 0);
    let order = &state.orders[&pending];

    // The venue fills twice what the bot asked for
    harness
        .exchange
        .submit_order(
            PAIR,
            &OrderRequest {
                client_order_id: pending.clone(),
                side: order.side,
                price: order.price,
                quantity: order.quantity * 2.0,
            },
        )
        .await
        .unwrap();
    harness.exchange.set_price(order.price);
    harness.exchange.set_price(100.0);

    let mut engine = harness.engine();
    let flow = engine.start(false).await.unwrap();

    assert_eq!(flow, Flow::Halt(HaltReason::ReconciliationConflict));
    let persisted = harness.store().load_state().unwrap().unwrap();
    assert_eq!(persisted.halt.unwrap().reason, HaltReason::ReconciliationConflict);
    assert_eq!(persisted.orders[&pending].state, OrderState::Pending);
    assert_eq!(harness.exchange.submission_count(), 1);
}

#[tokio::test]
async fn test_transient_submit_errors_are_retried() {
    let harness = TestHarness::new(100.0, 1_000.0);
    harness.exchange.fail_next_submissions(vec![
        ExchangeError::Timeout("slow venue".to_string()),
        ExchangeError::RateLimited("burst".to_string()),
    ]);

    let mut engine = harness.engine();
    assert_eq!(engine.start(false).await.unwrap(), Flow::Continue);

    assert_eq!(harness.exchange.open_orders().len(), 4);
    assert_eq!(harness.exchange.submission_count(), 6);
}

#[tokio::test]
async fn test_permanent_submit_error_halts_then_resume_recovers() {
    let harness = TestHarness::new(100.0, 1_000.0);
    harness
        .exchange
        .fail_next_submissions(vec![ExchangeError::Api("invalid signature".to_string())]);

    let mut engine = harness.engine();
    assert_eq!(
        engine.start(false).await.unwrap(),
        Flow::Halt(HaltReason::SubmissionFailed)
    );

    let persisted = harness.store().load_state().unwrap().unwrap();
    assert_eq!(persisted.orders.len(), 1);
    let stranded = persisted.orders.values().next().unwrap().clone();
    assert_eq!(stranded.state, OrderState::Pending);
    assert!(stranded.exchange_order_id.is_none());
    drop(engine);

    let mut resumed = harness.engine();
    assert_eq!(resumed.start(true).await.unwrap(), Flow::Continue);
    let state = resumed.state().unwrap();
    assert_eq!(state.orders[&stranded.client_order_id].state, OrderState::Rejected);
    assert_eq!(harness.exchange.open_orders().len(), 4);
}

#[tokio::test]
async fn test_repeated_rejections_exhaust_budget() {
    let harness = TestHarness::new(100.0, 1_000.0);
    harness.exchange.reject_next(100, "post-only would cross");

    let mut engine = harness.engine();
    assert_eq!(engine.start(false).await.unwrap(), Flow::Continue);
    assert_eq!(engine.state().unwrap().active_orders().count(), 0);

    for _ in 0..2 {
        assert_eq!(engine.process(LoopEvent::Timer).await.unwrap(), Flow::Continue);
    }
    let flow = engine.process(LoopEvent::Timer).await.unwrap();
    assert_eq!(flow, Flow::Halt(HaltReason::SubmissionFailed));
}

#[tokio::test]
async fn test_dropped_event_stream_recovers_fill_by_reconciliation() {
    let harness = TestHarness::new(100.0, 1_000.0);
    let mut engine = harness.engine();
    engine.start(false).await.unwrap();
    engine.drain_ready_events().await.unwrap();
    let bought = engine.state().unwrap().active_order_for_level(1).unwrap().clone();

    harness.exchange.drop_event_stream();
    harness.exchange.set_price(95.0);
    assert_eq!(engine.drain_ready_events().await.unwrap(), Flow::Continue);

    let state = engine.state().unwrap();
    assert_eq!(state.orders[&bought.client_order_id].state, OrderState::Filled);
    assert_eq!(state.plan.level(2).unwrap().side, Side::Sell);
    assert!(state.active_order_for_level(2).is_some());
    assert!(!harness.notifier.history().snapshot().is_empty());
}

#[tokio::test]
async fn test_orphan_orders_are_cancelled() {
    let harness = TestHarness::with_config(100.0, 1_000.0, |config| {
        config.execution.reconcile_every_ticks = 1;
    });
    let mut engine = harness.engine();
    engine.start(false).await.unwrap();
    engine.drain_ready_events().await.unwrap();

    let external = harness.exchange.place_external_order(Side::Buy, 80.0, 1.0);
    assert_eq!(engine.process(LoopEvent::Timer).await.unwrap(), Flow::Continue);
    assert_eq!(
        harness.exchange.order(&external).unwrap().status,
        ExchangeOrderStatus::Cancelled
    );

    // The cancellation event names an order the bot never tracked
    assert_eq!(engine.drain_ready_events().await.unwrap(), Flow::Continue);
    assert_eq!(engine.state().unwrap().active_orders().count(), 4);
}

#[tokio::test]
async fn test_shutdown_drains_and_persists() {
    let harness = TestHarness::with_config(100.0, 1_000.0, |config| {
        config.execution.cancel_on_shutdown = true;
    });
    let mut engine = harness.engine();
    engine.start(false).await.unwrap();
    engine.drain_ready_events().await.unwrap();
    let sequence = engine.state().unwrap().sequence;

    harness.shutdown.request();
    assert_eq!(engine.run().await.unwrap(), RunOutcome::Stopped);

    assert!(harness.exchange.open_orders().is_empty());
    let persisted = harness.store().load_state().unwrap().unwrap();
    assert!(persisted.sequence > sequence);
    assert!(persisted.halt.is_none());
}

/// Paper venue whose order-event subscription ends as soon as it is polled.
struct DeadFeedExchange {
    inner: Arc<PaperExchange>,
    subscriptions: AtomicUsize,
}

impl DeadFeedExchange {
    fn new(inner: Arc<PaperExchange>) -> Self {
        Self {
            inner,
            subscriptions: AtomicUsize::new(0),
        }
    }

    fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeClient for DeadFeedExchange {
    async fn reference_price(&self, pair: &str) -> Result<f64, ExchangeError> {
        self.inner.reference_price(pair).await
    }

    async fn get_open_orders(&self, pair: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.inner.get_open_orders(pair).await
    }

    async fn get_order_history(&self, pair: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.inner.get_order_history(pair).await
    }

    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        self.inner.get_balance().await
    }

    async fn submit_order(
        &self,
        pair: &str,
        request: &OrderRequest,
    ) -> Result<SubmitOutcome, ExchangeError> {
        self.inner.submit_order(pair, request).await
    }

    async fn cancel_order(&self, pair: &str, order_id: &str) -> Result<bool, ExchangeError> {
        self.inner.cancel_order(pair, order_id).await
    }

    fn order_events(&self) -> BoxStream<'static, OrderEvent> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        stream::empty().boxed()
    }
}

fn dead_feed_engine(harness: &TestHarness) -> (ExecutionLoop, Arc<DeadFeedExchange>) {
    let feed = Arc::new(DeadFeedExchange::new(harness.exchange.clone()));
    let exchange: Arc<dyn ExchangeClient> = feed.clone();
    let engine = ExecutionLoop::new(
        harness.config.clone(),
        exchange,
        Box::new(harness.store()),
        harness.notifier.clone(),
        harness.shutdown.clone(),
    );
    (engine, feed)
}

#[tokio::test]
async fn test_ending_event_stream_backs_off_then_halts() {
    let harness = TestHarness::with_config(100.0, 1_000.0, |config| {
        config.execution.max_stream_restarts = 3;
        config.execution.retry_base_delay_ms = 20;
        config.execution.retry_max_delay_ms = 40;
    });
    let (mut engine, feed) = dead_feed_engine(&harness);
    engine.start(false).await.unwrap();

    let started = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .expect("run must not spin")
        .unwrap();

    assert_eq!(outcome, RunOutcome::Halted(HaltReason::EventStreamLost));
    // Backoff of 20 + 40 + 40 ms before the fourth end gives up
    assert!(started.elapsed() >= Duration::from_millis(80));
    assert_eq!(feed.subscriptions(), 4, "initial subscription plus three restarts");

    let persisted = harness.store().load_state().unwrap().unwrap();
    assert_eq!(persisted.halt.unwrap().reason, HaltReason::EventStreamLost);
    assert_eq!(harness.notifier.history().halts().len(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_a_loop_whose_stream_keeps_ending() {
    let harness = TestHarness::with_config(100.0, 1_000.0, |config| {
        config.execution.max_stream_restarts = 100_000;
    });
    let (mut engine, feed) = dead_feed_engine(&harness);
    engine.start(false).await.unwrap();

    let shutdown = harness.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.request();
    });

    let started = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .expect("shutdown must reach a current-thread runtime")
        .unwrap();

    assert_eq!(outcome, RunOutcome::Stopped);
    // Every restart waits at least the 1 ms base delay
    let restarts = feed.subscriptions() as u128 - 1;
    assert!(restarts <= started.elapsed().as_millis() + 1);
}

#[tokio::test]
async fn test_daily_fill_limit_halts_the_loop() {
    let harness = TestHarness::with_config(100.0, 1_000.0, |config| {
        config.risk.max_daily_fills = Some(1);
    });
    let mut engine = harness.engine();
    engine.start(false).await.unwrap();
    engine.drain_ready_events().await.unwrap();

    harness.exchange.set_price(95.0);
    let flow = engine.drain_ready_events().await.unwrap();

    assert_eq!(flow, Flow::Halt(HaltReason::DailyFillLimit));
    let persisted = harness.store().load_state().unwrap().unwrap();
    assert_eq!(persisted.daily.unwrap().fills, 1);
    assert_eq!(persisted.halt.unwrap().reason, HaltReason::DailyFillLimit);
}
