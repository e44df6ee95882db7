// Conservative Grid Bot Library
//
// Plans a bounded price grid, keeps one order per armed level, and halts
// instead of guessing whenever local and exchange state disagree.

pub mod core;
pub mod config;
pub mod db;          // SQLite state store
pub mod error;       // Unified error handling
pub mod exchange;
pub mod notify;
pub mod persistence;
pub mod validation;  // Pre-flight validation

// Re-export core engine types
pub use core::{
    BotState, ExecutionLoop, Flow, GridPlan, GridPlanner, HaltReason, LoopEvent, Order,
    OrderManager, OrderState, Position, ReconciliationService, RiskGuard, RunOutcome,
    ShutdownSignal, Side,
};

// Re-export error types
pub use error::{GridBotError, GridBotResult};

// Re-export validation types
pub use validation::{PreFlightValidator, ValidationResult, ValidationCheck, ValidationLevel};

// Re-export exchange seam
pub use exchange::{ExchangeClient, ExchangeError, PaperExchange};

// Re-export configuration
pub use config::{
    BotConfig, ConfigError, ExecutionConfig, GridConfig, LoggingConfig, PersistenceConfig,
    RiskConfig, StoreBackend,
};

// Re-export persistence
pub use persistence::{JsonFileStore, StateStore};
pub use db::{Database, FillRecord, SqliteStateStore};

// Re-export notifications
pub use notify::{AlertLevel, HaltNotice, LogNotifier, Notifier};
