// Core grid engine modules

pub mod types;
pub mod position;
pub mod bot_state;
pub mod grid_planner;
pub mod order_manager;
pub mod risk_guard;
pub mod reconciliation;
pub mod error_handling;
pub mod execution_loop;

// Re-export commonly used types
pub use types::{
    Balance, FillNotice, GridLevel, GridPlan, HaltReason, HaltRecord, MarketSnapshot, Order,
    OrderEvent, OrderEventKind, OrderState, Side, SpacingMode,
};
pub use position::Position;
pub use bot_state::{BotState, DailyCounters};
pub use grid_planner::GridPlanner;
pub use order_manager::{OrderManager, TransitionOutcome};
pub use risk_guard::{margin_requirement, tolerated_range, RiskGuard, RiskLimits, RiskSignal};
pub use reconciliation::{ExchangeSnapshot, ReconciliationReport, ReconciliationService};
pub use error_handling::{RetryPolicy, Retryable, ShutdownSignal};
pub use execution_loop::{ExecutionLoop, Flow, LoopEvent, RunOutcome};
