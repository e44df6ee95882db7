// Trading commands against the built-in paper exchange
use conservative_grid_bot::persistence::open_store;
use conservative_grid_bot::{
    BotConfig, ExchangeClient, ExecutionLoop, Flow, GridBotError, GridBotResult, LogNotifier,
    PaperExchange, PreFlightValidator, RunOutcome, ShutdownSignal,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{error, info, warn};

pub struct PaperRunOptions {
    pub price: Option<f64>,
    pub balance: Option<f64>,
    pub volatility_pct: f64,
    pub step_ms: u64,
    pub minutes: Option<f64>,
    pub resume: bool,
}

fn paper_exchange(config: &BotConfig, price: Option<f64>, balance: Option<f64>) -> Arc<PaperExchange> {
    let grid = &config.grid;
    let price = price.unwrap_or((grid.lower_bound + grid.upper_bound) / 2.0);
    let balance = balance.unwrap_or(grid.capital);
    Arc::new(PaperExchange::new(grid.pair.clone(), price, balance, grid.leverage))
}

pub async fn validate(config: &BotConfig, price: Option<f64>, balance: Option<f64>) -> GridBotResult<()> {
    let store = open_store(&config.persistence)?;
    let exchange = paper_exchange(config, price, balance);

    let validator = PreFlightValidator::new(config.clone());
    let result = validator
        .validate_for_trading(&*store, &*exchange)
        .await;
    result.display();

    if !result.passed {
        return Err(GridBotError::Internal(
            "critical pre-flight checks did not pass".to_string(),
        ));
    }
    Ok(())
}

pub async fn run_paper(config: BotConfig, options: PaperRunOptions) -> GridBotResult<()> {
    info!("🧪 PAPER TRADING mode");

    let store = open_store(&config.persistence)?;
    let exchange = paper_exchange(&config, options.price, options.balance);

    let validator = PreFlightValidator::new(config.clone());
    let validation = validator
        .validate_for_trading(&*store, &*exchange)
        .await;
    validation.display();
    if !validation.passed && !options.resume {
        error!("❌ Pre-flight validation failed. Cannot proceed.");
        return Err(GridBotError::Internal(
            "critical pre-flight checks did not pass".to_string(),
        ));
    }

    let shutdown = ShutdownSignal::new();
    spawn_ctrl_c(shutdown.clone());
    if let Some(minutes) = options.minutes {
        let signal = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(minutes * 60.0)).await;
            info!("⏰ Run duration reached");
            signal.request();
        });
    }
    let feed = spawn_price_walk(
        Arc::clone(&exchange),
        options.volatility_pct,
        Duration::from_millis(options.step_ms.max(10)),
        shutdown.clone(),
    );

    let notifier = Arc::new(LogNotifier::new());
    let client: Arc<dyn ExchangeClient> = exchange.clone();
    let mut engine = ExecutionLoop::new(config, client, store, notifier.clone(), shutdown.clone());

    let outcome = match engine.start(options.resume).await? {
        Flow::Halt(reason) => RunOutcome::Halted(reason),
        Flow::Continue => engine.run().await?,
    };

    shutdown.request();
    log_task_exit("price feed", feed.await);

    match outcome {
        RunOutcome::Stopped => info!("👋 Stopped cleanly"),
        RunOutcome::Halted(reason) => {
            error!("🛑 Halted: {}", reason);
            info!("💡 Inspect with `grid-bot status --detailed`, then `grid-bot run --resume`");
        }
    }

    if let Some(state) = engine.state() {
        let mark = exchange.price();
        info!(
            position = state.position.quantity,
            realized_pnl = state.position.realized_pnl,
            unrealized_pnl = state.position.unrealized_pnl(mark),
            orders = state.orders.len(),
            "📈 Session summary"
        );
    }
    let alerts = notifier.history().snapshot();
    if !alerts.is_empty() {
        warn!("{} alert(s) raised during the session", alerts.len());
    }
    Ok(())
}

/// Report a background task that panicked or was cancelled. Returns true on a clean exit.
fn log_task_exit(task: &str, result: Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) if e.is_panic() => {
            warn!(task, "background task panicked: {}", e);
            false
        }
        Err(e) => {
            warn!(task, "background task did not finish: {}", e);
            false
        }
    }
}

fn spawn_ctrl_c(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            shutdown.request();
        }
    });
}

/// Moves the paper price by a bounded random step until shutdown.
fn spawn_price_walk(
    exchange: Arc<PaperExchange>,
    volatility_pct: f64,
    step: Duration,
    shutdown: ShutdownSignal,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut ticker = tokio::time::interval(step);
        let bound = (volatility_pct / 100.0).abs();

        loop {
            tokio::select! {
                _ = shutdown.requested() => break,
                _ = ticker.tick() => {
                    let change = if bound > 0.0 { rng.gen_range(-bound..=bound) } else { 0.0 };
                    let price = (exchange.price() * (1.0 + change)).max(f64::EPSILON);
                    exchange.set_price(price);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_exit_reports_panics() {
        let clean = tokio::spawn(async {});
        assert!(log_task_exit("clean", clean.await));

        let panicked = tokio::spawn(async { panic!("price walk failed") });
        assert!(!log_task_exit("panicked", panicked.await));
    }

    #[tokio::test]
    async fn test_price_walk_stops_on_shutdown() {
        let exchange = Arc::new(PaperExchange::new("BTC/USDT", 100.0, 1_000.0, 1.0));
        let shutdown = ShutdownSignal::new();
        let feed = spawn_price_walk(exchange.clone(), 1.0, Duration::from_millis(1), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.request();
        assert!(log_task_exit("price feed", feed.await));
        assert!(exchange.price() > 0.0);
    }
}
