//! Dip-buying crypto trading bot
//!
//! Buys watch-list assets after a 24h drop, averages down on further dips, and
//! sells on a trailing stop or after holding a small loss for long enough.

mod api;
mod bot;
mod config;
mod models;
mod store;
mod trading;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{
    trading_pair, CoinbaseClient, Credentials, MarketData, OrderExecution, PaperExchange,
};
use crate::bot::{Bot, BotConfig, Snapshot};
use crate::config::AppConfig;
use crate::store::PositionStore;
use crate::trading::{Strategy, StrategyEngine};

const DEFAULT_CONFIG: &str = "config.json";

/// Dip-buying trading bot CLI.
#[derive(Parser)]
#[command(name = "diptrader")]
#[command(about = "Buy the dip, average down, and sell on a trailing stop", long_about = None)]
struct Cli {
    /// Config file path (defaults to ./config.json, or built-in defaults if absent)
    #[arg(short, long, global = true, env = "DIPTRADER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot with an interactive console
    Run {
        /// Force simulated order execution regardless of the config file
        #[arg(long)]
        dry_run: bool,
    },

    /// Show held positions from the state file
    Status {
        /// Skip fetching live prices
        #[arg(long)]
        offline: bool,

        /// Show the dry-run state file regardless of the config file
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let (config, source) = load_config(cli.config.as_deref())?;
    init_logging(cli.log_level.as_deref(), &config.log_level)?;

    match cli.command {
        Commands::Run { dry_run } => run(config, dry_run).await,
        Commands::Status { offline, dry_run } => status(config, offline, dry_run).await,
        Commands::Config => {
            print_config(&config, source.as_deref());
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<(AppConfig, Option<PathBuf>)> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if !default.exists() {
                return Ok((AppConfig::default(), None));
            }
            default
        }
    };

    let config = AppConfig::load(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    Ok((config, Some(path)))
}

fn init_logging(cli_level: Option<&str>, config_level: &str) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)?,
        _ => EnvFilter::try_new(cli_level.unwrap_or(config_level))
            .context("Invalid log level")?,
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn run(config: AppConfig, force_dry_run: bool) -> Result<()> {
    let dry_run = force_dry_run || config.exchange.dry_run;
    let strategy = &config.strategy;

    let state_path = config.state_path(dry_run);
    let store = PositionStore::new(&state_path);
    let mut portfolio = store
        .load()
        .await
        .context("Failed to load positions; refusing to start")?;

    let client = Arc::new(
        CoinbaseClient::new(
            &config.exchange.base_url,
            Credentials::from_env().context("Invalid COINBASE_API_KEY / COINBASE_API_SECRET")?,
        )
        .context("Failed to create exchange client")?,
    );

    let (market, orders): (Arc<dyn MarketData>, Arc<dyn OrderExecution>) = if dry_run {
        let cash = *portfolio.paper_cash.get_or_insert(config.exchange.paper_cash);
        portfolio.cash = cash;
        let paper = Arc::new(
            PaperExchange::new(
                client.clone(),
                &strategy.quote_currency,
                cash,
                strategy.taker_fee_percentage,
            )
            .with_holdings(&portfolio),
        );
        let market: Arc<dyn MarketData> = paper.clone();
        let orders: Arc<dyn OrderExecution> = paper;
        (market, orders)
    } else {
        if portfolio.paper_cash.is_some() {
            bail!(
                "{} holds simulated positions; point stateFile at the live position file",
                state_path.display()
            );
        }
        if !client.has_credentials() {
            bail!("COINBASE_API_KEY and COINBASE_API_SECRET must be set for live trading");
        }
        let market: Arc<dyn MarketData> = client.clone();
        let orders: Arc<dyn OrderExecution> = client;
        (market, orders)
    };

    let held = portfolio.len();
    let engine = StrategyEngine::new(strategy.clone(), market, orders, store, portfolio);
    let mut bot = Bot::new(
        engine,
        BotConfig {
            schedule: config.schedule.clone(),
            dry_run,
            time_zone: config.time_zone,
        },
    );

    println!("\n=== Dip Trader ===");
    println!("Watch-list:       {}", strategy.coins.join(", "));
    println!("Quote currency:   {}", strategy.quote_currency);
    println!("Held positions:   {}", held);
    println!("State file:       {}", state_path.display());
    println!("Mode:             {}", if dry_run { "DRY RUN (simulated orders)" } else { "LIVE TRADING" });
    println!("\nType 'help' for commands. Press Ctrl+C or type 'exit' to stop.\n");

    bot.start();
    console(&bot).await;
    bot.shutdown().await;

    Ok(())
}

/// Read operator commands from stdin until `exit` or a shutdown signal.
async fn console(bot: &Bot) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let signal = shutdown_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_command(bot, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => {
                    // No console attached; keep trading until signalled.
                    (&mut signal).await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Console input failed, waiting for a shutdown signal");
                    (&mut signal).await;
                    break;
                }
            },
            _ = &mut signal => break,
        }
    }
}

/// Resolves on Ctrl+C, or on SIGTERM where the platform has it.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

/// Handle one console line. Returns false when the operator asked to exit.
async fn handle_command(bot: &Bot, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next().map(str::to_lowercase).as_deref() {
        None => {}
        Some("status") => println!("{}", bot.snapshot().await),
        Some("sell") => match parts.next() {
            Some(symbol) => {
                let symbol = symbol.to_uppercase();
                match bot.sell(&symbol).await {
                    Ok(()) => println!("Sold {}", symbol),
                    Err(e) => println!("Sell failed: {}", e),
                }
            }
            None => println!("Usage: sell <SYMBOL>"),
        },
        Some("help") => {
            println!("Commands:");
            println!("  status          Show held positions");
            println!("  sell <SYMBOL>   Sell a held position now");
            println!("  help            Show this help");
            println!("  exit            Stop the bot");
        }
        Some("exit") | Some("quit") => return false,
        Some(other) => println!("Unknown command '{}'. Type 'help' for commands.", other),
    }
    true
}

async fn status(config: AppConfig, offline: bool, force_dry_run: bool) -> Result<()> {
    let dry_run = force_dry_run || config.exchange.dry_run;
    let state_path = config.state_path(dry_run);
    let store = PositionStore::new(&state_path);
    let portfolio = store
        .load()
        .await
        .with_context(|| format!("Failed to read {}", state_path.display()))?;

    let mut prices = std::collections::BTreeMap::new();
    if !offline && !portfolio.is_empty() {
        let client = CoinbaseClient::new(&config.exchange.base_url, None)
            .context("Failed to create exchange client")?;
        for symbol in portfolio.symbols() {
            let pair = trading_pair(&symbol, &config.strategy.quote_currency);
            match client.current_price(&pair).await {
                Ok(price) => {
                    prices.insert(symbol, price);
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "Could not fetch price"),
            }
        }
    }

    let snapshot = Snapshot {
        portfolio,
        prices,
        stats: None,
        strategy: Strategy::new(config.strategy.clone()),
        taken_at: Utc::now(),
        dry_run,
        time_zone: config.time_zone,
    };
    println!("\n{}", snapshot);
    Ok(())
}

fn print_config(config: &AppConfig, source: Option<&Path>) {
    let s = &config.strategy;
    let pct = |values: &[Decimal]| {
        values
            .iter()
            .map(|v| format!("{}%", v))
            .collect::<Vec<_>>()
            .join(", ")
    };

    println!(
        "\n=== Configuration ({}) ===\n",
        source
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "built-in defaults".to_string())
    );
    println!("Strategy:");
    println!("  Watch-list:             {}", s.coins.join(", "));
    println!("  Quote Currency:         {}", s.quote_currency);
    println!("  Purchase Drop:          {}%", s.purchase_drop_percent);
    println!("  Average-Down Steps:     {}", pct(&s.average_down_steps));
    println!("  Minimum Profit:         {}%", s.minimum_profit_percentage);
    println!("  Stop Loss Sale:         {}%", s.stop_loss_sale_percentage);
    println!("  Negative Profit Levels: {}", pct(&s.negative_profit_levels));
    println!("  Min Weeks For Loss:     {}", s.minimum_weeks_for_loss_sale);
    println!("  Max Held Coins:         {}", s.max_held_coins);
    println!("  Funds Portion:          {}", s.use_funds_portion_per_trade);
    println!("  Taker Fee:              {}%", s.taker_fee_percentage);

    println!("\nSchedule:");
    println!("  Candidate Interval:     {}s", config.schedule.candidate_interval_secs);
    println!("  Held Interval:          {}s", config.schedule.held_position_interval_secs);
    println!("  Stagger:                {}s", config.schedule.stagger_secs);
    println!("  Shutdown Grace:         {}s", config.schedule.shutdown_grace_secs);

    println!("\nExchange:");
    println!("  Base URL:               {}", config.exchange.base_url);
    println!("  Dry Run:                {}", config.exchange.dry_run);
    println!("  Paper Cash:             {}", config.exchange.paper_cash);
    let credentials = match Credentials::from_env() {
        Ok(Some(_)) => "set",
        Ok(None) => "not set",
        Err(_) => "invalid",
    };
    println!("  Credentials:            {}", credentials);

    println!("\nState File:               {}", config.state_path(false).display());
    println!("Dry-Run State File:       {}", config.state_path(true).display());
    println!("Log Level:                {}", config.log_level);
    println!("Time Zone:                {}", config.time_zone);
}
