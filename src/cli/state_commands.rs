// Offline commands: workspace setup, grid preview and state inspection
use conservative_grid_bot::persistence::open_store;
use conservative_grid_bot::{
    BotConfig, GridBotResult, GridPlanner, SqliteStateStore, StoreBackend,
};
use std::path::Path;
use tracing::{info, warn};

pub fn init_workspace(config_path: &str, force: bool) -> GridBotResult<()> {
    info!("🔧 Initializing workspace...");

    if Path::new(config_path).exists() && !force {
        warn!("⚠️  {} already exists, skipping (use --force to overwrite)", config_path);
        return Ok(());
    }

    let config = BotConfig::default();
    config.to_file(config_path)?;
    info!("📝 Created {}", config_path);

    info!("✅ Workspace initialized successfully!");
    info!("💡 Next steps:");
    info!("   1. Edit {} with your pair, bounds and capital", config_path);
    info!("   2. Run: grid-bot plan");
    info!("   3. Run: grid-bot run");
    Ok(())
}

pub fn show_plan(config: &BotConfig, price: Option<f64>) -> GridBotResult<()> {
    let grid = &config.grid;
    let reference = price.unwrap_or((grid.lower_bound + grid.upper_bound) / 2.0);
    let plan = GridPlanner::new(grid.clone()).plan(reference)?;

    println!("\n📐 Grid for {} around {:.4}", grid.pair, reference);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{:>5}  {:>14}  {:>6}  {:>14}", "rung", "price", "side", "quantity");
    for (index, rung) in plan.rungs.iter().enumerate().rev() {
        match plan.level(index) {
            Some(level) => println!(
                "{:>5}  {:>14.4}  {:>6}  {:>14.8}",
                index, rung, level.side, level.quantity
            ),
            None => println!("{:>5}  {:>14.4}  {:>6}  {:>14}", index, rung, "idle", "-"),
        }
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "{} rungs, {} armed levels, {:?} spacing, capital {:.2}",
        plan.rung_count(),
        plan.armed_count(),
        plan.spacing_mode,
        grid.capital
    );
    Ok(())
}

pub fn show_status(config: &BotConfig, detailed: bool) -> GridBotResult<()> {
    let store = open_store(&config.persistence)?;
    let state = match store.load_state()? {
        Some(state) => state,
        None => {
            println!("\n📭 No persisted state in {}", store.describe());
            return Ok(());
        }
    };

    println!("\n📊 Grid Bot Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Store:        {}", store.describe());
    println!("Pair:         {}", state.pair);
    println!("Sequence:     {}", state.sequence);
    println!("Updated:      {}", state.updated_at.to_rfc3339());
    println!(
        "Grid:         {:.4} - {:.4}, epoch {}, generation {}",
        state.plan.lower_bound, state.plan.upper_bound, state.plan.epoch, state.plan.generation
    );
    println!(
        "Levels:       {} armed of {} rungs",
        state.plan.armed_count(),
        state.plan.rung_count()
    );
    println!("Active:       {}", state.active_orders().count());
    println!(
        "Position:     {:.8} @ {:.4} (realized {:.4})",
        state.position.quantity, state.position.average_cost, state.position.realized_pnl
    );
    if let Some(daily) = state.daily {
        println!(
            "Day {}:  {} fill(s), realized {:.4}",
            daily.day,
            daily.fills,
            state.daily_realized_pnl(daily.day)
        );
    }
    match &state.halt {
        Some(halt) => println!(
            "Status:       🛑 HALTED {} at {}: {}",
            halt.reason,
            halt.halted_at.to_rfc3339(),
            halt.detail
        ),
        None => println!("Status:       ✅ running"),
    }

    if detailed {
        println!("\nOrders:");
        for order in state.orders.values() {
            println!(
                "  {} level {:>3} {:>4} {:>12.4} qty {:.8} filled {:.8} [{}]",
                order.client_order_id,
                order.level_index,
                order.side,
                order.price,
                order.quantity,
                order.filled,
                order.state
            );
        }

        if config.persistence.backend == StoreBackend::Sqlite {
            let journal = SqliteStateStore::open(&config.persistence.path)?;
            let fills = journal.fills(20)?;
            println!("\nRecent fills ({}):", fills.len());
            for fill in fills {
                println!(
                    "  {} {} {:.8} @ {:.4} level {} ({})",
                    fill.completed_at, fill.side, fill.quantity, fill.price, fill.level_index, fill.final_state
                );
            }
        }
    }
    Ok(())
}
