//! Pre-flight checks run before the execution loop takes control
//!
//! Catches configuration mistakes, an unreadable state store and an
//! unreachable or underfunded exchange before any order is placed.

use crate::config::BotConfig;
use crate::core::grid_planner::GridPlanner;
use crate::core::risk_guard::{margin_requirement, tolerated_range};
use crate::exchange::ExchangeClient;
use crate::persistence::StateStore;
use tracing::{error, info, warn};

/// Validation result with detailed findings
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub passed: bool,
    pub checks: Vec<ValidationCheck>,
}

#[derive(Debug, Clone)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub level: ValidationLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationLevel {
    Critical, // Blocks startup
    Warning,
    Info,
}

impl ValidationCheck {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        ValidationCheck {
            name: name.to_string(),
            passed: true,
            message: message.into(),
            level: ValidationLevel::Info,
        }
    }

    fn fail(name: &str, level: ValidationLevel, message: impl Into<String>) -> Self {
        ValidationCheck {
            name: name.to_string(),
            passed: false,
            message: message.into(),
            level,
        }
    }
}

impl ValidationResult {
    pub fn new() -> Self {
        ValidationResult {
            passed: true,
            checks: Vec::new(),
        }
    }

    pub fn add_check(&mut self, check: ValidationCheck) {
        if !check.passed && check.level == ValidationLevel::Critical {
            self.passed = false;
        }
        self.checks.push(check);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        for check in other.checks {
            self.add_check(check);
        }
    }

    pub fn critical_failures(&self) -> Vec<&ValidationCheck> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.level == ValidationLevel::Critical)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&ValidationCheck> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.level == ValidationLevel::Warning)
            .collect()
    }

    pub fn display(&self) {
        info!("🔍 Pre-flight Validation");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        for check in &self.checks {
            let icon = if check.passed {
                "✅"
            } else {
                match check.level {
                    ValidationLevel::Critical => "❌",
                    ValidationLevel::Warning => "⚠️",
                    ValidationLevel::Info => "ℹ️",
                }
            };

            info!("{} {} - {}", icon, check.name, check.message);
        }

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if !self.passed {
            let failures = self.critical_failures();
            error!("❌ Validation failed: {} critical issue(s)", failures.len());
            for failure in failures {
                error!("   • {}: {}", failure.name, failure.message);
            }
        } else {
            let warnings = self.warnings();
            if !warnings.is_empty() {
                warn!("⚠️  {} warning(s) detected", warnings.len());
                for warning in warnings {
                    warn!("   • {}: {}", warning.name, warning.message);
                }
            }
            info!("✅ All critical checks passed");
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PreFlightValidator {
    config: BotConfig,
}

impl PreFlightValidator {
    pub fn new(config: BotConfig) -> Self {
        PreFlightValidator { config }
    }

    /// Everything, in the order startup needs it.
    pub async fn validate_for_trading(
        &self,
        store: &dyn StateStore,
        exchange: &dyn ExchangeClient,
    ) -> ValidationResult {
        let mut result = self.validate_config();
        result.add_check(self.check_store(store));
        result.merge(self.validate_exchange(exchange).await);
        result
    }

    /// Offline checks on the configuration and the grid it produces.
    pub fn validate_config(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        match self.config.validate() {
            Ok(()) => result.add_check(ValidationCheck::pass("Configuration", "Loaded successfully")),
            Err(e) => result.add_check(ValidationCheck::fail(
                "Configuration",
                ValidationLevel::Critical,
                e.to_string(),
            )),
        }

        let grid = &self.config.grid;
        let planner = GridPlanner::new(grid.clone());
        let rungs = match planner.rungs() {
            Ok(rungs) => rungs,
            Err(e) => {
                result.add_check(ValidationCheck::fail("Grid", ValidationLevel::Critical, e.to_string()));
                return result;
            }
        };

        if rungs.len() > 50 {
            result.add_check(ValidationCheck::fail(
                "Grid Levels",
                ValidationLevel::Warning,
                format!("{} rungs exceeds the recommended maximum (50)", rungs.len()),
            ));
        } else {
            result.add_check(ValidationCheck::pass(
                "Grid Levels",
                format!("{} rungs from {:.4} to {:.4}", rungs.len(), grid.lower_bound, grid.upper_bound),
            ));
        }

        // The planner already refused rungs below the minimum order size
        let per_rung = grid.capital / rungs.len() as f64;
        result.add_check(ValidationCheck::pass(
            "Order Size",
            format!("{:.2} per rung, {:.8} at the top rung", per_rung, per_rung / grid.upper_bound),
        ));

        result
    }

    /// The store must load, and any persisted state must belong to this pair.
    pub fn check_store(&self, store: &dyn StateStore) -> ValidationCheck {
        match store.load_state() {
            Ok(None) => ValidationCheck::pass("State Store", format!("{} is empty; a fresh grid will be planned", store.describe())),
            Ok(Some(state)) if state.pair != self.config.grid.pair => ValidationCheck::fail(
                "State Store",
                ValidationLevel::Critical,
                format!("{} holds state for {}, not {}", store.describe(), state.pair, self.config.grid.pair),
            ),
            Ok(Some(state)) => match &state.halt {
                Some(halt) => ValidationCheck::fail(
                    "State Store",
                    ValidationLevel::Warning,
                    format!("persisted state is halted ({}); resume explicitly", halt.reason),
                ),
                None => ValidationCheck::pass(
                    "State Store",
                    format!("sequence {} with {} active order(s)", state.sequence, state.active_orders().count()),
                ),
            },
            Err(e) => ValidationCheck::fail("State Store", ValidationLevel::Critical, e.to_string()),
        }
    }

    /// Reachability, price position and funding for the initial grid.
    pub async fn validate_exchange(&self, exchange: &dyn ExchangeClient) -> ValidationResult {
        let mut result = ValidationResult::new();
        let grid = &self.config.grid;

        let price = match exchange.reference_price(&grid.pair).await {
            Ok(price) => {
                result.add_check(ValidationCheck::pass("Exchange", format!("reachable, {} at {:.4}", grid.pair, price)));
                price
            }
            Err(e) => {
                result.add_check(ValidationCheck::fail(
                    "Exchange",
                    ValidationLevel::Critical,
                    format!("cannot fetch a price: {}", e),
                ));
                return result;
            }
        };

        let (lower, upper) = tolerated_range(
            grid.lower_bound,
            grid.upper_bound,
            self.config.risk.out_of_range_tolerance_pct,
        );
        if price < lower || price > upper {
            result.add_check(ValidationCheck::fail(
                "Price Range",
                ValidationLevel::Critical,
                format!(
                    "{:.4} is outside the tolerated range {:.4} - {:.4}",
                    price, lower, upper
                ),
            ));
            return result;
        }
        result.add_check(ValidationCheck::pass("Price Range", format!("{:.4} inside the grid", price)));

        let plan = match GridPlanner::new(grid.clone()).plan(price) {
            Ok(plan) => plan,
            Err(e) => {
                result.add_check(ValidationCheck::fail("Grid", ValidationLevel::Critical, e.to_string()));
                return result;
            }
        };
        let required = margin_requirement(
            0.0,
            plan.levels.values().map(|l| (l.side, l.price, l.quantity)),
            grid.leverage,
        );

        match exchange.get_balance().await {
            Ok(balance) if balance.available + 1e-9 < required => result.add_check(ValidationCheck::fail(
                "Balance",
                ValidationLevel::Critical,
                format!("available {:.2} cannot fund the initial grid ({:.2})", balance.available, required),
            )),
            Ok(balance) => result.add_check(ValidationCheck::pass(
                "Balance",
                format!("available {:.2}, initial grid needs {:.2}", balance.available, required),
            )),
            Err(e) => result.add_check(ValidationCheck::fail(
                "Balance",
                ValidationLevel::Critical,
                format!("cannot fetch balance: {}", e),
            )),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::persistence::JsonFileStore;
    use tempfile::TempDir;

    #[test]
    fn test_validation_result() {
        let mut result = ValidationResult::new();
        assert!(result.passed);

        result.add_check(ValidationCheck::pass("Test", "OK"));
        assert!(result.passed);

        result.add_check(ValidationCheck::fail("Soft", ValidationLevel::Warning, "meh"));
        assert!(result.passed);
        assert_eq!(result.warnings().len(), 1);

        result.add_check(ValidationCheck::fail("Fail", ValidationLevel::Critical, "Failed"));
        assert!(!result.passed);
        assert_eq!(result.critical_failures().len(), 1);
    }

    #[test]
    fn test_config_validation() {
        let validator = PreFlightValidator::new(BotConfig::default());
        assert!(validator.validate_config().passed);

        let mut config = BotConfig::default();
        config.grid.upper_bound = config.grid.lower_bound;
        let result = PreFlightValidator::new(config).validate_config();
        assert!(!result.passed);

        let mut config = BotConfig::default();
        config.grid.min_order_size = 10.0;
        let result = PreFlightValidator::new(config).validate_config();
        assert!(!result.passed);
    }

    #[test]
    fn test_store_check() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"));
        let check = PreFlightValidator::new(BotConfig::default()).check_store(&store);
        assert!(check.passed);
    }

    #[tokio::test]
    async fn test_exchange_checks() {
        let validator = PreFlightValidator::new(BotConfig::default());

        let funded = PaperExchange::new("BTC/USDT", 100.0, 1_000.0, 1.0);
        assert!(validator.validate_exchange(&funded).await.passed);

        let broke = PaperExchange::new("BTC/USDT", 100.0, 10.0, 1.0);
        let result = validator.validate_exchange(&broke).await;
        assert!(!result.passed);
        assert_eq!(result.critical_failures()[0].name, "Balance");

        let outside = PaperExchange::new("BTC/USDT", 150.0, 1_000.0, 1.0);
        let result = validator.validate_exchange(&outside).await;
        assert_eq!(result.critical_failures()[0].name, "Price Range");
    }

    #[tokio::test]
    async fn test_price_range_matches_risk_guard() {
        // Default grid 90 - 110 with 2% tolerance: the guard halts above 112.2
        let validator = PreFlightValidator::new(BotConfig::default());

        let inside = PaperExchange::new("BTC/USDT", 112.1, 1_000.0, 1.0);
        let result = validator.validate_exchange(&inside).await;
        assert!(result.critical_failures().iter().all(|c| c.name != "Price Range"));

        let above = PaperExchange::new("BTC/USDT", 112.3, 1_000.0, 1.0);
        let result = validator.validate_exchange(&above).await;
        assert_eq!(result.critical_failures()[0].name, "Price Range");

        let below = PaperExchange::new("BTC/USDT", 88.1, 1_000.0, 1.0);
        let result = validator.validate_exchange(&below).await;
        assert_eq!(result.critical_failures()[0].name, "Price Range");
    }

    #[test]
    fn test_tiny_fixed_spacing_fails_validation() {
        let mut config = BotConfig::default();
        config.grid.fixed_spacing = Some(1e-300);
        let result = PreFlightValidator::new(config).validate_config();
        assert!(!result.passed);
        assert_eq!(result.critical_failures()[0].name, "Grid");
    }
}
