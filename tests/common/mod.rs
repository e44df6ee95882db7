// Common test utilities and helpers
#![allow(dead_code)]

use chrono::Utc;
use conservative_grid_bot::core::MarketSnapshot;
use conservative_grid_bot::{
    BotConfig, ExchangeClient, ExecutionLoop, JsonFileStore, LogNotifier, PaperExchange,
    ShutdownSignal,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const PAIR: &str = "BTC/USDT";

/// Default grid (90 - 110, five rungs, 500 capital) with fast retries
pub fn create_test_config(state_path: PathBuf) -> BotConfig {
    let mut config = BotConfig::default();
    config.execution.retry_base_delay_ms = 1;
    config.execution.retry_max_delay_ms = 5;
    config.execution.poll_interval_seconds = 1;
    config.persistence.path = state_path;
    config
}

/// Create a temporary directory holding the state file
pub fn create_temp_state_path() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let state_path = temp_dir.path().join("state").join("grid_state.json");
    (temp_dir, state_path)
}

/// Paper venue plus everything an execution loop needs around it
pub struct TestHarness {
    pub _dir: TempDir,
    pub config: BotConfig,
    pub exchange: Arc<PaperExchange>,
    pub notifier: Arc<LogNotifier>,
    pub shutdown: ShutdownSignal,
}

impl TestHarness {
    pub fn new(price: f64, balance: f64) -> Self {
        Self::with_config(price, balance, |_| {})
    }

    pub fn with_config(price: f64, balance: f64, adjust: impl FnOnce(&mut BotConfig)) -> Self {
        let (dir, path) = create_temp_state_path();
        let mut config = create_test_config(path);
        adjust(&mut config);
        Self {
            _dir: dir,
            exchange: Arc::new(PaperExchange::new(PAIR, price, balance, config.grid.leverage)),
            config,
            notifier: Arc::new(LogNotifier::new()),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn store(&self) -> JsonFileStore {
        JsonFileStore::new(&self.config.persistence.path)
    }

    /// A loop over the shared venue and a fresh handle on the state file,
    /// as a restarted process would see them.
    pub fn engine(&self) -> ExecutionLoop {
        let exchange: Arc<dyn ExchangeClient> = self.exchange.clone();
        ExecutionLoop::new(
            self.config.clone(),
            exchange,
            Box::new(self.store()),
            self.notifier.clone(),
            self.shutdown.clone(),
        )
    }

    pub async fn market(&self) -> MarketSnapshot {
        MarketSnapshot {
            reference_price: self.exchange.price(),
            balance: self.exchange.get_balance().await.expect("paper balance"),
            observed_at: Utc::now(),
        }
    }
}
