//! Market Node
//!
//! Runs one node of the market (`run`, the default) or performs a single
//! administrative operation against the shared stores and exits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use ledger_service::{Direction, OpenRequest};
use market_node_service::{
    graceful_shutdown, initialize_logging_with_config, load_configuration, setup_signal_handlers,
    NodeConfig, NodeService,
};

#[derive(Parser)]
#[command(name = "market-node")]
#[command(about = "Leveraged trading market node and admin commands")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to market-node.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until SIGINT/SIGTERM
    Run,

    /// Open a leveraged position
    Open {
        actor: String,
        symbol: String,
        #[arg(value_enum)]
        direction: DirectionArg,
        quantity: Decimal,
        #[arg(long, default_value_t = 1)]
        leverage: u32,
        /// Take-profit threshold on gains
        #[arg(long)]
        upper_margin: Decimal,
        /// Stop-loss threshold on losses
        #[arg(long)]
        lower_margin: Decimal,
    },

    /// Close a position manually
    Close { actor: String, symbol: String, position_id: Uuid },

    /// Move external cash into a ledger
    Deposit { actor: String, amount: Decimal },

    /// Move ledger balance back to external cash
    Withdraw { actor: String, amount: Decimal },

    /// Toggle covering bankruptcies from external cash
    AutoLiquidate {
        actor: String,
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /// Wipe a symbol's price history
    PruneHistory { symbol: String },

    /// Pay a symbol's dividend immediately
    ForceDividend { symbol: String },

    /// Show an actor's balance and open positions
    Summary { actor: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Long,
    Short,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Long => Direction::Long,
            DirectionArg::Short => Direction::Short,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_configuration(cli.config.as_deref())?;
    initialize_logging_with_config(&config.logging)?;

    match cli.command {
        None | Some(Commands::Run) => run(config).await,
        Some(command) => admin(config, command).await,
    }
}

async fn run(config: NodeConfig) -> Result<()> {
    info!("Starting Market Node v{}", env!("CARGO_PKG_VERSION"));

    let service = Arc::new(NodeService::new(config).await?);
    service.bootstrap().await.context("Failed to restore state")?;

    let shutdown_signal = setup_signal_handlers()?;
    service.start().await?;

    info!("Market node is running. Press Ctrl+C to shutdown gracefully.");
    let _ = shutdown_signal.await;

    info!("Shutdown signal received. Initiating graceful shutdown...");
    graceful_shutdown(service).await?;

    info!("Market node shutdown complete");
    Ok(())
}

/// One-shot operation from a short-lived replica with its own node id, so the
/// running nodes receive its change notices
async fn admin(mut config: NodeConfig, command: Commands) -> Result<()> {
    config.node.node_id = format!("admin-{}", Uuid::new_v4());
    config.node.authority = false;

    let service = NodeService::new(config).await?;
    service.bootstrap().await.context("Failed to restore state")?;

    match command {
        Commands::Run => anyhow::bail!("`run` is not an admin command"),
        Commands::Open {
            actor,
            symbol,
            direction,
            quantity,
            leverage,
            upper_margin,
            lower_margin,
        } => {
            let request = OpenRequest {
                symbol,
                direction: direction.into(),
                quantity,
                leverage,
                upper_margin,
                lower_margin,
            };
            print_json(&service.open_position(&actor, request).await?)
        }
        Commands::Close { actor, symbol, position_id } => {
            print_json(&service.close_position(&actor, &symbol, position_id).await?)
        }
        Commands::Deposit { actor, amount } => print_json(&service.deposit(&actor, amount).await?),
        Commands::Withdraw { actor, amount } => {
            print_json(&service.withdraw(&actor, amount).await?)
        }
        Commands::AutoLiquidate { actor, enabled } => {
            service.set_auto_liquidate(&actor, enabled).await?;
            print_json(&serde_json::json!({ "actor_id": actor, "auto_liquidate": enabled }))
        }
        Commands::PruneHistory { symbol } => {
            service.prune_history(&symbol).await?;
            print_json(&serde_json::json!({ "symbol": symbol, "pruned": true }))
        }
        Commands::ForceDividend { symbol } => {
            let dividend = service.force_dividend(&symbol).await?;
            print_json(&serde_json::json!({ "symbol": symbol, "dividend_per_unit": dividend }))
        }
        Commands::Summary { actor } => print_json(&service.summary(&actor).await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
