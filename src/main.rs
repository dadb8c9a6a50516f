//! EVM New-Pool Sniper - buys freshly created DEX pools through a nonce-sequenced queue
//!
//! # WARNING
//! - This bot trades with real money. Only use funds you can afford to lose.
//! - Most freshly launched tokens go to zero (rug pulls, honeypots, abandonment).
//! - Other searchers compete for the same pools and may outbid you.
//! - Testnet success does NOT equal mainnet success.

use alloy_primitives::Address;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

// Use the library crate
use evm_pool_sniper::cli::commands;
use evm_pool_sniper::config::Config;

/// EVM New-Pool Sniper
#[derive(Parser)]
#[command(name = "snipe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "SNIPER_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sniper
    Start {
        /// Detect and log only, never broadcast buys
        #[arg(long)]
        dry_run: bool,
    },

    /// Clear stuck pending transactions for the signer and exit
    Cleanup,

    /// Show strategy exposure, open trades and recent transactions
    Status,

    /// Manually sell an open trade
    Sell {
        /// Trade id (see `snipe status`)
        trade_id: String,

        /// Percentage of the remaining tokens to sell
        #[arg(short, long, default_value_t = 100, value_parser = clap::value_parser!(u8).range(1..=100))]
        percent: u8,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration (secrets masked)
    Config,

    /// Check system health (RPC, subscription endpoint, signer nonces)
    Health,
}

impl Commands {
    /// Commands that broadcast from the signer
    fn needs_signer(&self) -> bool {
        matches!(self, Commands::Start { .. } | Commands::Cleanup | Commands::Sell { .. })
    }
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("evm_pool_sniper=info".parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    init_tracing(cli.json_logs)?;

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Perform startup checks
    if let Err(e) = startup_checks(&config, cli.command.needs_signer()) {
        error!("Startup checks failed: {}", e);
        std::process::exit(1);
    }

    // Execute command
    let result = match cli.command {
        Commands::Start { dry_run } => commands::start(&config, dry_run).await,
        Commands::Cleanup => commands::cleanup(&config).await,
        Commands::Status => commands::status(&config).await,
        Commands::Sell {
            trade_id,
            percent,
            force,
        } => commands::sell(&config, &trade_id, percent, force).await,
        Commands::Config => commands::show_config(&config),
        Commands::Health => commands::health(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Perform startup safety checks
fn startup_checks(config: &Config, needs_signer: bool) -> Result<()> {
    info!("Performing startup checks...");

    if needs_signer && config.wallet.address == Address::ZERO {
        anyhow::bail!("wallet.address must be set (or SNIPER__WALLET__ADDRESS)");
    }

    if config.rpc.ws_endpoint.trim().is_empty() {
        warn!("rpc.ws_endpoint not set - pool detection falls back to eth_getLogs polling");
    }

    // Warn about safety limits
    match config.queue.gas_cap_wei() {
        Some(_) => warn!(
            "Safety limits active: max_gas_price={}gwei, max_attempts={}",
            config.queue.max_gas_price_gwei, config.queue.max_attempts
        ),
        None => warn!("queue.max_gas_price_gwei is 0 - broadcasts have no fee cap"),
    }

    for tracker in config.trackers.iter().filter(|t| t.enabled) {
        if tracker.max_trades == 0 && tracker.max_active_buy_eth == 0.0 {
            warn!(
                "Tracker {} has no max_trades or max_active_buy_eth limit",
                tracker.id
            );
        }
    }

    info!("Startup checks passed");
    Ok(())
}
