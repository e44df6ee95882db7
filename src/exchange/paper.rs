// In-memory paper exchange
// Resting limit orders fill when the reference price crosses them

use crate::core::risk_guard::margin_requirement;
use crate::core::types::{Balance, OrderEvent, OrderEventKind, Side, QTY_EPSILON};
use crate::exchange::{
    ExchangeClient, ExchangeError, ExchangeOrder, ExchangeOrderStatus, OrderRequest, SubmitOutcome,
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

const HISTORY_LIMIT: usize = 500;

#[derive(Debug)]
struct PaperBook {
    pair: String,
    price: f64,
    cash: f64,
    position: f64,
    leverage: f64,
    next_id: u64,
    open: BTreeMap<String, ExchangeOrder>,
    history: VecDeque<ExchangeOrder>,
    submit_faults: VecDeque<ExchangeError>,
    pending_rejections: VecDeque<String>,
    silent_acks: bool,
    offline: bool,
    submissions: usize,
    events: Option<UnboundedSender<OrderEvent>>,
}

impl PaperBook {
    fn emit(&mut self, order: &ExchangeOrder, kind: OrderEventKind) {
        let event = OrderEvent {
            order_id: order.order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            kind,
            timestamp: Utc::now(),
        };
        let delivered = match &self.events {
            Some(sender) => sender.send(event).is_ok(),
            None => return,
        };
        if !delivered {
            self.events = None;
        }
    }

    fn settle(&mut self, side: Side, quantity: f64, price: f64) {
        self.cash -= side.sign() * quantity * price;
        self.position += side.sign() * quantity;
    }

    fn archive(&mut self, order: ExchangeOrder) {
        self.history.push_back(order);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    fn crosses(order: &ExchangeOrder, price: f64) -> bool {
        match order.side {
            Side::Buy => price <= order.price,
            Side::Sell => price >= order.price,
        }
    }

    /// Fill every resting order the current price crosses.
    fn match_resting(&mut self) {
        let price = self.price;
        let crossed: Vec<String> = self
            .open
            .values()
            .filter(|o| Self::crosses(o, price))
            .map(|o| o.order_id.clone())
            .collect();

        for id in crossed {
            if let Some(mut order) = self.open.remove(&id) {
                let remaining = order.quantity - order.filled;
                self.settle(order.side, remaining, order.price);
                order.filled = order.quantity;
                order.status = ExchangeOrderStatus::Filled;
                order.updated_at = Utc::now();
                debug!(order = %order.order_id, side = %order.side, price = order.price, "paper fill");
                self.emit(&order, OrderEventKind::Filled);
                self.archive(order);
            }
        }
    }

    fn balance(&self) -> Balance {
        let equity = self.cash + self.position * self.price;
        let resting = self
            .open
            .values()
            .map(|o| (o.side, o.price, o.quantity - o.filled));
        let used = self.position.abs() * self.price / self.leverage
            + margin_requirement(self.position, resting, self.leverage);
        Balance {
            available: equity - used,
            equity,
        }
    }

    fn find_any(&self, order_id: &str) -> Option<&ExchangeOrder> {
        self.open
            .get(order_id)
            .or_else(|| self.history.iter().find(|o| o.order_id == order_id))
    }
}

/// Paper venue for dry runs and tests. Prices move only through
/// [`PaperExchange::set_price`]; the fault controls simulate an unreliable
/// venue.
#[derive(Debug)]
pub struct PaperExchange {
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(pair: impl Into<String>, price: f64, starting_balance: f64, leverage: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                pair: pair.into(),
                price,
                cash: starting_balance,
                position: 0.0,
                leverage: leverage.max(1.0),
                next_id: 1,
                open: BTreeMap::new(),
                history: VecDeque::new(),
                submit_faults: VecDeque::new(),
                pending_rejections: VecDeque::new(),
                silent_acks: false,
                offline: false,
                submissions: 0,
                events: None,
            }),
        }
    }

    fn book(&self) -> MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_pair(book: &PaperBook, pair: &str) -> Result<(), ExchangeError> {
        if book.offline {
            return Err(ExchangeError::Network("paper exchange offline".to_string()));
        }
        if book.pair != pair {
            return Err(ExchangeError::Api(format!("unknown pair {}", pair)));
        }
        Ok(())
    }

    /// Move the market and fill whatever the new price crosses.
    pub fn set_price(&self, price: f64) {
        let mut book = self.book();
        book.price = price;
        book.match_resting();
    }

    pub fn price(&self) -> f64 {
        self.book().price
    }

    /// Fill part of a resting order. Completing the order reports `Filled`.
    pub fn partial_fill(&self, order_id: &str, quantity: f64) -> bool {
        let mut book = self.book();
        let Some(mut order) = book.open.remove(order_id) else {
            return false;
        };

        let quantity = quantity.min(order.quantity - order.filled);
        book.settle(order.side, quantity, order.price);
        order.filled += quantity;
        order.updated_at = Utc::now();

        if order.filled >= order.quantity - QTY_EPSILON {
            order.filled = order.quantity;
            order.status = ExchangeOrderStatus::Filled;
            book.emit(&order, OrderEventKind::Filled);
            book.archive(order);
        } else {
            order.status = ExchangeOrderStatus::PartiallyFilled;
            book.emit(&order, OrderEventKind::PartialFill { quantity });
            book.open.insert(order.order_id.clone(), order);
        }
        true
    }

    /// The next submissions fail with these errors, in order.
    pub fn fail_next_submissions(&self, errors: Vec<ExchangeError>) {
        self.book().submit_faults.extend(errors);
    }

    /// The next `count` submissions are rejected by the venue.
    pub fn reject_next(&self, count: usize, reason: &str) {
        let mut book = self.book();
        for _ in 0..count {
            book.pending_rejections.push_back(reason.to_string());
        }
    }

    /// Accept orders without emitting acknowledgements.
    pub fn set_silent_acks(&self, silent: bool) {
        self.book().silent_acks = silent;
    }

    pub fn set_offline(&self, offline: bool) {
        self.book().offline = offline;
    }

    /// End the current event subscription.
    pub fn drop_event_stream(&self) {
        self.book().events = None;
    }

    /// Erase every trace of an order, as if the venue never saw it.
    pub fn forget_order(&self, order_id: &str) -> bool {
        let mut book = self.book();
        let removed = book.open.remove(order_id).is_some();
        let before = book.history.len();
        book.history.retain(|o| o.order_id != order_id);
        removed || book.history.len() != before
    }

    /// Place an order that did not come from the bot.
    pub fn place_external_order(&self, side: Side, price: f64, quantity: f64) -> String {
        let mut book = self.book();
        let order_id = format!("EXT-{}", book.next_id);
        book.next_id += 1;
        let order = ExchangeOrder {
            order_id: order_id.clone(),
            client_order_id: None,
            side,
            price,
            quantity,
            filled: 0.0,
            status: ExchangeOrderStatus::Open,
            updated_at: Utc::now(),
        };
        book.open.insert(order_id.clone(), order);
        order_id
    }

    pub fn open_orders(&self) -> Vec<ExchangeOrder> {
        self.book().open.values().cloned().collect()
    }

    pub fn order(&self, order_id: &str) -> Option<ExchangeOrder> {
        self.book().find_any(order_id).cloned()
    }

    /// Number of submission attempts that reached the venue.
    pub fn submission_count(&self) -> usize {
        self.book().submissions
    }

    pub fn position(&self) -> f64 {
        self.book().position
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn reference_price(&self, pair: &str) -> Result<f64, ExchangeError> {
        let book = self.book();
        Self::check_pair(&book, pair)?;
        Ok(book.price)
    }

    async fn get_open_orders(&self, pair: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let book = self.book();
        Self::check_pair(&book, pair)?;
        Ok(book.open.values().cloned().collect())
    }

    async fn get_order_history(&self, pair: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let book = self.book();
        Self::check_pair(&book, pair)?;
        Ok(book.history.iter().cloned().collect())
    }

    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        let book = self.book();
        if book.offline {
            return Err(ExchangeError::Network("paper exchange offline".to_string()));
        }
        Ok(book.balance())
    }

    async fn submit_order(
        &self,
        pair: &str,
        request: &OrderRequest,
    ) -> Result<SubmitOutcome, ExchangeError> {
        let mut book = self.book();
        Self::check_pair(&book, pair)?;
        book.submissions += 1;

        if let Some(fault) = book.submit_faults.pop_front() {
            return Err(fault);
        }

        let order_id = format!("P-{}", book.next_id);
        book.next_id += 1;
        let mut order = ExchangeOrder {
            order_id: order_id.clone(),
            client_order_id: Some(request.client_order_id.clone()),
            side: request.side,
            price: request.price,
            quantity: request.quantity,
            filled: 0.0,
            status: ExchangeOrderStatus::Open,
            updated_at: Utc::now(),
        };

        let rejection = if let Some(reason) = book.pending_rejections.pop_front() {
            Some(reason)
        } else if request.price <= 0.0 || request.quantity <= 0.0 {
            Some("invalid price or quantity".to_string())
        } else {
            None
        };

        if let Some(reason) = rejection {
            order.status = ExchangeOrderStatus::Rejected;
            book.archive(order);
            return Ok(SubmitOutcome::Rejected { reason });
        }

        if !book.silent_acks {
            book.emit(&order, OrderEventKind::Acknowledged);
        }
        book.open.insert(order_id.clone(), order);
        book.match_resting();

        Ok(SubmitOutcome::Accepted { order_id })
    }

    async fn cancel_order(&self, pair: &str, order_id: &str) -> Result<bool, ExchangeError> {
        let mut book = self.book();
        Self::check_pair(&book, pair)?;

        match book.open.remove(order_id) {
            Some(mut order) => {
                order.status = ExchangeOrderStatus::Cancelled;
                order.updated_at = Utc::now();
                book.emit(&order, OrderEventKind::Cancelled);
                book.archive(order);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn order_events(&self) -> BoxStream<'static, OrderEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        // A new subscription replaces the previous one
        self.book().events = Some(tx);
        stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed()
    }
}
