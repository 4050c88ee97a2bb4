//! ChainVault command line
//!
//! Runs the deposit scanner and the operator tools around it: wallet
//! management, deposit history, balances and scan status.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use chainvault_service::config::Config;
use chainvault_service::observability::{init_tracing, serve_metrics};
use chainvault_service::services::NewWallet;
use chainvault_service::AppState;

#[derive(Parser)]
#[command(name = "chainvault")]
#[command(about = "Multi-chain wallet custody and deposit scanner")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "chainvault.toml")]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the deposit scanner until interrupted
    Scan {
        /// Run a single cycle on every chain and exit
        #[arg(long)]
        once: bool,
    },
    /// Wallet management
    Wallet {
        #[command(subcommand)]
        action: WalletCommands,
    },
    /// Deposit history of a user, newest first
    Deposits {
        #[arg(long)]
        user: String,
    },
    /// Token balances of a user
    Balances {
        #[arg(long)]
        user: String,
    },
    /// Scan checkpoints per chain
    Status,
    /// Check the configuration file and exit
    ValidateConfig,
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Create a wallet and print its seed phrase once
    Create {
        #[arg(long)]
        user: String,
    },
    /// Replace a wallet with a new seed phrase
    Reset {
        #[arg(long)]
        user: String,
    },
    /// Print a user's deposit addresses
    Addresses {
        #[arg(long)]
        user: String,
    },
    /// Decrypt a user's seed phrase. Every recovery is audited.
    Recover {
        #[arg(long)]
        user: String,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    if let Commands::ValidateConfig = cli.command {
        let warnings = config.validate()?;
        println!(
            "Configuration OK: {} chain(s) enabled, {} warning(s)",
            config.enabled_chains().count(),
            warnings.len()
        );
        for warning in warnings {
            println!("  warning: {}", warning);
        }
        return Ok(());
    }

    config.validate()?;
    let state = AppState::from_config(&config).await?;

    let outcome = match cli.command {
        Commands::Scan { once } => run_scanner(&state, &config, once).await,
        Commands::Wallet { action } => run_wallet_command(&state, action).await,
        Commands::Deposits { user } => print_deposits(&state, &user).await,
        Commands::Balances { user } => print_balances(&state, &user).await,
        Commands::Status => print_status(&state).await,
        Commands::ValidateConfig => Ok(()),
    };

    state.database_pool.close().await;
    outcome
}

async fn run_scanner(state: &AppState, config: &Config, once: bool) -> Result<()> {
    let scanner = state.build_scanner(config)?;
    if scanner.chains().is_empty() {
        bail!("No chains are enabled in the configuration");
    }

    if once {
        let mut failed = 0;
        for (chain, result) in scanner.scan_once().await {
            match result {
                Ok(report) => println!(
                    "{:<10} ok      events={} pending={} completed={} parked={} conflicts={} ignored={} checkpoint={}",
                    chain,
                    report.events,
                    report.pending,
                    report.completed,
                    report.parked,
                    report.conflicts,
                    report.ignored,
                    report.checkpoint
                ),
                Err(e) => {
                    failed += 1;
                    println!("{:<10} failed  {}", chain, e);
                }
            }
        }

        if failed > 0 {
            bail!("{} chain(s) failed to scan", failed);
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested, finishing in-flight cycles"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal.cancel();
    });

    let metrics_server = if config.metrics.enabled {
        let address = config.metrics_address()?;
        let metrics = state.metrics.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = serve_metrics(address, metrics, shutdown).await {
                error!(error = %e, "Metrics endpoint failed");
            }
        }))
    } else {
        None
    };

    Arc::new(scanner).run(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(server) = metrics_server {
        if let Err(e) = server.await {
            error!(error = %e, "Metrics server task aborted");
        }
    }
    Ok(())
}

async fn run_wallet_command(state: &AppState, action: WalletCommands) -> Result<()> {
    match action {
        WalletCommands::Create { user } => {
            let wallet = state.wallets.create_wallet(&user).await?;
            print_new_wallet(&wallet);
        }
        WalletCommands::Reset { user } => {
            let wallet = state.wallets.reset_wallet(&user).await?;
            print_new_wallet(&wallet);
        }
        WalletCommands::Addresses { user } => {
            for (chain, address) in state.wallets.get_addresses(&user).await? {
                println!("{:<10} {}", chain, address);
            }
        }
        WalletCommands::Recover { user, operator, reason } => {
            let mnemonic = state.wallets.recover_mnemonic(&user, &operator, &reason).await?;
            println!("Recovery recorded for {} by {}", user, operator);
            println!("{}", mnemonic.expose());
        }
    }
    Ok(())
}

fn print_new_wallet(wallet: &NewWallet) {
    println!("Wallet for {} created at {}", wallet.user_id, wallet.created_at.to_rfc3339());
    for (chain, address) in &wallet.addresses {
        println!("{:<10} {}", chain, address);
    }
    println!();
    println!("Seed phrase (shown once, store it offline):");
    println!("{}", wallet.mnemonic.expose());
}

async fn print_deposits(state: &AppState, user: &str) -> Result<()> {
    let history = state.ledger.transaction_history(user).await?;
    if history.is_empty() {
        println!("No deposits for {}", user);
        return Ok(());
    }

    for tx in history {
        println!(
            "{} {:<10} {:<6} {:>24} {:<9} confirmations={} {}{}",
            tx.created_at.to_rfc3339(),
            tx.chain,
            tx.token,
            tx.amount.normalize(),
            tx.status,
            tx.confirmations,
            tx.tx_hash,
            tx.failure_reason.map(|reason| format!(" ({})", reason)).unwrap_or_default()
        );
    }
    Ok(())
}

async fn print_balances(state: &AppState, user: &str) -> Result<()> {
    let balances = state.ledger.balances(user).await?;
    if balances.is_empty() {
        println!("No balances for {}", user);
    }
    for balance in balances {
        println!("{:<6} {}", balance.token, balance.amount.normalize());
    }
    Ok(())
}

async fn print_status(state: &AppState) -> Result<()> {
    state.database_pool.health_check().await?;

    let checkpoints = state.checkpoints.list().await?;
    if checkpoints.is_empty() {
        println!("No chain has been scanned yet");
    }
    for stored in checkpoints {
        println!(
            "{:<10} {:<30} updated {}",
            stored.chain,
            stored.checkpoint.to_string(),
            stored.updated_at.to_rfc3339()
        );
    }

    let stats = state.database_pool.get_stats();
    println!("database: {} connection(s), {} idle", stats.size, stats.idle);
    Ok(())
}
