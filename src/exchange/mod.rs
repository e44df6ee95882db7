// Exchange capability consumed by the engine

pub mod paper;

pub use paper::PaperExchange;

use crate::core::types::{Balance, OrderEvent, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("exchange API error: {0}")]
    Api(String),
}

impl ExchangeError {
    /// Timeouts, rate limits and dropped connections are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout(_) | ExchangeError::RateLimited(_) | ExchangeError::Network(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted { order_id: String },
    Rejected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeOrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// An order as the exchange reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    /// Cumulative filled quantity.
    pub filled: f64,
    pub status: ExchangeOrderStatus,
    pub updated_at: DateTime<Utc>,
}

/// Everything the engine needs from a venue. Implementations own the wire
/// protocol, authentication and rate limiting.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn reference_price(&self, pair: &str) -> Result<f64, ExchangeError>;

    async fn get_open_orders(&self, pair: &str) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    /// Recently closed orders with final status and cumulative fills.
    async fn get_order_history(&self, pair: &str) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn get_balance(&self) -> Result<Balance, ExchangeError>;

    async fn submit_order(
        &self,
        pair: &str,
        request: &OrderRequest,
    ) -> Result<SubmitOutcome, ExchangeError>;

    /// Returns false when the exchange has no open order with that id.
    async fn cancel_order(&self, pair: &str, order_id: &str) -> Result<bool, ExchangeError>;

    /// Subscribe to order-status events. The stream ends when the
    /// subscription drops.
    fn order_events(&self) -> BoxStream<'static, OrderEvent>;
}
