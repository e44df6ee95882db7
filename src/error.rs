//! Error handling for the grid bot
//!
//! One error type for the whole engine. Risk signals are not errors; they are
//! evaluated by the risk guard and end the run through a halt instead.

use crate::config::ConfigError;
use crate::core::types::{HaltReason, OrderState};
use crate::exchange::ExchangeError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GridBotError {
    // Configuration errors
    #[error("Invalid grid configuration: {0}")]
    InvalidGridConfig(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    // Order lifecycle errors
    #[error("Invalid transition for order {order_id}: {from} -> {to} ({event})")]
    InvalidOrderTransition {
        order_id: String,
        from: OrderState,
        to: OrderState,
        event: String,
    },

    #[error("Fill of {attempted} on order {order_id} exceeds quantity {quantity} (already filled {filled})")]
    Overfill {
        order_id: String,
        attempted: f64,
        filled: f64,
        quantity: f64,
    },

    #[error("Unknown order: {0}")]
    UnknownOrder(String),

    #[error("Level {level} is already covered by order {order_id}")]
    DuplicateCoverage { level: usize, order_id: String },

    #[error("Level {0} is not armed in the current plan")]
    LevelNotArmed(usize),

    // Exchange errors
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    // Consistency errors
    #[error("Reconciliation conflict on order {order_id}: exchange filled {exchange_filled}, local quantity {local_quantity}")]
    ReconciliationConflict {
        order_id: String,
        exchange_filled: f64,
        local_quantity: f64,
    },

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Stale snapshot: sequence {attempted} is not newer than stored sequence {stored}")]
    StaleSnapshot { attempted: u64, stored: u64 },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Run control
    #[error("Bot is halted ({reason}); restart with --resume to reconcile and continue")]
    Halted { reason: HaltReason },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GridBotError {
    /// Get a user-friendly error message with a hint on how to recover
    pub fn user_message(&self) -> String {
        match self {
            GridBotError::InvalidGridConfig(msg) => {
                format!(
                    "Grid configuration rejected: {}\n\n\
                    💡 Check the [grid] section of config.toml:\n\
                    - lower_bound < upper_bound, both positive\n\
                    - level_count >= 2\n\
                    - capital large enough for min_order_size at every level",
                    msg
                )
            }
            GridBotError::Halted { reason } => {
                format!(
                    "The bot halted earlier with {}.\n\n\
                    💡 Inspect with: grid-bot status\n\
                    Then restart with: grid-bot run --resume",
                    reason
                )
            }
            GridBotError::StaleSnapshot { .. } => {
                format!(
                    "{}\n\n\
                    💡 Another bot instance may be writing the same state file",
                    self
                )
            }
            GridBotError::ReconciliationConflict { .. } => {
                format!(
                    "{}\n\n\
                    💡 Local and exchange records disagree; review the exchange \
                    order history manually before resuming",
                    self
                )
            }
            _ => self.to_string(),
        }
    }

    /// Only transient exchange failures are retried
    pub fn is_retryable(&self) -> bool {
        match self {
            GridBotError::Exchange(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Lifecycle errors are recovered by forcing a reconciliation
    pub fn is_transition_error(&self) -> bool {
        matches!(
            self,
            GridBotError::InvalidOrderTransition { .. }
                | GridBotError::Overfill { .. }
                | GridBotError::UnknownOrder(_)
                | GridBotError::DuplicateCoverage { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            GridBotError::InvalidGridConfig(_) | GridBotError::Config(_) => "config",

            GridBotError::InvalidOrderTransition { .. }
            | GridBotError::Overfill { .. }
            | GridBotError::UnknownOrder(_)
            | GridBotError::DuplicateCoverage { .. }
            | GridBotError::LevelNotArmed(_) => "transition",

            GridBotError::Exchange(_) => "exchange",

            GridBotError::ReconciliationConflict { .. } => "consistency",

            GridBotError::Persistence(_)
            | GridBotError::StaleSnapshot { .. }
            | GridBotError::Database(_)
            | GridBotError::Serialization(_) => "persistence",

            GridBotError::Halted { .. } => "halt",
            GridBotError::Internal(_) => "internal",
        }
    }
}

impl From<io::Error> for GridBotError {
    fn from(err: io::Error) -> Self {
        GridBotError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for GridBotError {
    fn from(err: serde_json::Error) -> Self {
        GridBotError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GridBotError {
    fn from(err: toml::de::Error) -> Self {
        GridBotError::Config(ConfigError::Parse(err.to_string()))
    }
}

impl From<rusqlite::Error> for GridBotError {
    fn from(err: rusqlite::Error) -> Self {
        GridBotError::Database(err.to_string())
    }
}

/// Result type alias for grid bot operations
pub type GridBotResult<T> = Result<T, GridBotError>;
