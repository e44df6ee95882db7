// Conservative Grid Bot - command line entry point

use clap::{Parser, Subcommand};
use conservative_grid_bot::{BotConfig, ConfigError, LoggingConfig};
use tracing::{info, Level};

#[path = "../cli/state_commands.rs"]
mod state_commands;
#[path = "../cli/run_commands.rs"]
mod run_commands;

#[derive(Parser)]
#[command(name = "grid-bot")]
#[command(version = "0.3.0")]
#[command(about = "Conservative grid trading bot", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the grid the planner would build around a price
    Plan {
        /// Reference price (defaults to the middle of the range)
        #[arg(short, long)]
        price: Option<f64>,
    },

    /// Show the persisted bot state
    Status {
        /// List individual orders and recent fills
        #[arg(short, long)]
        detailed: bool,
    },

    /// Run pre-flight checks against a paper exchange
    Validate {
        /// Starting price of the paper market
        #[arg(short, long)]
        price: Option<f64>,

        /// Starting quote balance of the paper account
        #[arg(short, long)]
        balance: Option<f64>,
    },

    /// Trade against the built-in paper exchange
    Run {
        /// Starting price of the paper market
        #[arg(short, long)]
        price: Option<f64>,

        /// Starting quote balance of the paper account
        #[arg(short, long)]
        balance: Option<f64>,

        /// Per-step random walk size, in percent
        #[arg(long, default_value = "0.3")]
        volatility: f64,

        /// Milliseconds between paper price moves
        #[arg(long, default_value = "1000")]
        step_ms: u64,

        /// Stop after this many minutes
        #[arg(short, long)]
        minutes: Option<f64>,

        /// Continue from a halted state
        #[arg(long)]
        resume: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        init_logging(&LoggingConfig::default(), cli.verbose);
        state_commands::init_workspace(&cli.config, force)?;
        return Ok(());
    }

    let config = load_config_or_exit(&cli.config);
    init_logging(&config.logging, cli.verbose);

    info!("🚀 Grid Bot v0.3.0");
    info!("📁 Config: {}", cli.config);

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Plan { price } => {
            state_commands::show_plan(&config, price)?;
        }
        Commands::Status { detailed } => {
            state_commands::show_status(&config, detailed)?;
        }
        Commands::Validate { price, balance } => {
            run_commands::validate(&config, price, balance).await?;
        }
        Commands::Run {
            price,
            balance,
            volatility,
            step_ms,
            minutes,
            resume,
        } => {
            let options = run_commands::PaperRunOptions {
                price,
                balance,
                volatility_pct: volatility,
                step_ms,
                minutes,
                resume,
            };
            run_commands::run_paper(config, options).await?;
        }
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose {
        Level::DEBUG
    } else {
        logging.level.parse().unwrap_or(Level::INFO)
    };

    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(false);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load config or exit with a helpful error message
fn load_config_or_exit(path: &str) -> BotConfig {
    match BotConfig::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Configuration Error");
            eprintln!("{}", e);

            if matches!(e, ConfigError::FileRead(_)) {
                eprintln!();
                eprintln!("💡 Quick fix:");
                eprintln!("   1. Run: grid-bot init");
                eprintln!("   2. Edit {} with your grid bounds and capital", path);
                eprintln!("   3. Try again");
            }

            std::process::exit(1);
        }
    }
}
