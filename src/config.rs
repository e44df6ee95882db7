// Configuration management for the grid bot

use crate::core::types::SpacingMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub pair: String,
    #[serde(alias = "lowerBound")]
    pub lower_bound: f64,
    #[serde(alias = "upperBound")]
    pub upper_bound: f64,
    #[serde(alias = "levelCount", default = "default_level_count")]
    pub level_count: usize,
    #[serde(alias = "spacingMode", default)]
    pub spacing_mode: SpacingMode,
    /// Absolute step (arithmetic) or percent step (geometric). Overrides
    /// `level_count` when set.
    #[serde(alias = "fixedSpacing", default)]
    pub fixed_spacing: Option<f64>,
    #[serde(alias = "totalCapital")]
    pub capital: f64,
    #[serde(alias = "minOrderSize", default)]
    pub min_order_size: f64,
    /// Exchange lot size; quantities are rounded down to a multiple of it.
    #[serde(alias = "quantityStep", default)]
    pub quantity_step: Option<f64>,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(alias = "maxDrawdownPct", default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    #[serde(alias = "outOfRangeTolerancePct", default = "default_out_of_range_tolerance_pct")]
    pub out_of_range_tolerance_pct: f64,
    #[serde(alias = "minBalance", default)]
    pub min_balance: f64,
    #[serde(alias = "cancelOnHalt", default = "default_true")]
    pub cancel_on_halt: bool,
    /// Realized loss per UTC day, in quote currency.
    #[serde(alias = "maxDailyLoss", default)]
    pub max_daily_loss: Option<f64>,
    /// Completed fills per UTC day.
    #[serde(alias = "maxDailyFills", default)]
    pub max_daily_fills: Option<u32>,
    /// Net position notional at the reference price, in quote currency.
    #[serde(alias = "maxExposure", default)]
    pub max_exposure: Option<f64>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: default_max_drawdown_pct(),
            out_of_range_tolerance_pct: default_out_of_range_tolerance_pct(),
            min_balance: 0.0,
            cancel_on_halt: true,
            max_daily_loss: None,
            max_daily_fills: None,
            max_exposure: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(alias = "pollIntervalSeconds", default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(alias = "reconcileEveryTicks", default = "default_reconcile_every_ticks")]
    pub reconcile_every_ticks: u64,
    #[serde(alias = "maxSubmitRetries", default = "default_max_submit_retries")]
    pub max_submit_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(alias = "cancelOnShutdown", default)]
    pub cancel_on_shutdown: bool,
    #[serde(alias = "cancelOrphans", default = "default_true")]
    pub cancel_orphans: bool,
    #[serde(alias = "replanOnStart", default)]
    pub replan_on_start: bool,
    #[serde(default = "default_keep_terminal_orders")]
    pub keep_terminal_orders: usize,
    /// Consecutive order-event stream ends tolerated before halting.
    #[serde(alias = "maxStreamRestarts", default = "default_max_stream_restarts")]
    pub max_stream_restarts: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            reconcile_every_ticks: default_reconcile_every_ticks(),
            max_submit_retries: default_max_submit_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            cancel_on_shutdown: false,
            cancel_orphans: true,
            replan_on_start: false,
            keep_terminal_orders: default_keep_terminal_orders(),
            max_stream_restarts: default_max_stream_restarts(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Json,
            path: default_state_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub grid: GridConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_level_count() -> usize {
    10
}

fn default_leverage() -> f64 {
    1.0
}

fn default_max_drawdown_pct() -> f64 {
    10.0
}

fn default_out_of_range_tolerance_pct() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_seconds() -> u64 {
    30
}

fn default_reconcile_every_ticks() -> u64 {
    10
}

fn default_max_submit_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_keep_terminal_orders() -> usize {
    200
}

fn default_max_stream_restarts() -> u32 {
    10
}

fn default_state_path() -> PathBuf {
    PathBuf::from("data/grid_state.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            grid: GridConfig {
                pair: "BTC/USDT".to_string(),
                lower_bound: 90.0,
                upper_bound: 110.0,
                level_count: 5,
                spacing_mode: SpacingMode::Arithmetic,
                fixed_spacing: None,
                capital: 500.0,
                min_order_size: 0.001,
                quantity_step: None,
                leverage: 1.0,
            },
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::FileRead(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BotConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ConfigError::FileWrite(e.to_string()))?;
            }
        }
        fs::write(path, content).map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Load configuration from file, or create default if file doesn't exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.to_file(&path)?;
            info!("📁 Created default config file: {}", path.as_ref().display());
            Ok(config)
        }
    }

    /// Validate configuration values.
    ///
    /// Grid geometry (bound ordering, level count, minimum order size) is
    /// checked by the planner, which reports `InvalidGridConfig`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid.pair.trim().is_empty() {
            return Err(ConfigError::Validation("grid.pair must not be empty".to_string()));
        }

        if !self.grid.leverage.is_finite() || self.grid.leverage < 1.0 {
            return Err(ConfigError::Validation("grid.leverage must be at least 1".to_string()));
        }

        if self.grid.min_order_size < 0.0 {
            return Err(ConfigError::Validation(
                "grid.min_order_size must be non-negative".to_string(),
            ));
        }

        if let Some(step) = self.grid.quantity_step {
            if step <= 0.0 {
                return Err(ConfigError::Validation(
                    "grid.quantity_step must be positive".to_string(),
                ));
            }
        }

        if self.risk.max_drawdown_pct <= 0.0 || self.risk.max_drawdown_pct > 100.0 {
            return Err(ConfigError::Validation(
                "risk.max_drawdown_pct must be in (0, 100]".to_string(),
            ));
        }

        if self.risk.out_of_range_tolerance_pct < 0.0 {
            return Err(ConfigError::Validation(
                "risk.out_of_range_tolerance_pct must be non-negative".to_string(),
            ));
        }

        if self.risk.min_balance < 0.0 {
            return Err(ConfigError::Validation("risk.min_balance must be non-negative".to_string()));
        }

        if matches!(self.risk.max_daily_loss, Some(limit) if !limit.is_finite() || limit <= 0.0) {
            return Err(ConfigError::Validation(
                "risk.max_daily_loss must be positive when set".to_string(),
            ));
        }

        if self.risk.max_daily_fills == Some(0) {
            return Err(ConfigError::Validation(
                "risk.max_daily_fills must be greater than 0 when set".to_string(),
            ));
        }

        if matches!(self.risk.max_exposure, Some(limit) if !limit.is_finite() || limit <= 0.0) {
            return Err(ConfigError::Validation(
                "risk.max_exposure must be positive when set".to_string(),
            ));
        }

        if self.execution.poll_interval_seconds == 0 {
            return Err(ConfigError::Validation(
                "execution.poll_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.execution.reconcile_every_ticks == 0 {
            return Err(ConfigError::Validation(
                "execution.reconcile_every_ticks must be greater than 0".to_string(),
            ));
        }

        if self.execution.max_stream_restarts == 0 {
            return Err(ConfigError::Validation(
                "execution.max_stream_restarts must be greater than 0".to_string(),
            ));
        }

        if self.execution.retry_base_delay_ms > self.execution.retry_max_delay_ms {
            return Err(ConfigError::Validation(
                "execution.retry_base_delay_ms must not exceed retry_max_delay_ms".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),

    #[error("Failed to write config file: {0}")]
    FileWrite(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}
