//! OTrade CLI — paper trading, config checks and memory inspection.
//!
//! Commands:
//! - `paper` — run the trading loop against the synthetic market and paper
//!   broker, restarting it with backoff when broker connectivity is lost
//! - `config check` — load and validate a config file, print its hash
//! - `memory stats` — summarize what the pattern store has learned

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use otrade_core::analysis::MultiTimeframeAnalyzer;
use otrade_core::memory::{JsonFileStore, LearningSummary, PatternMemory, PatternStore};
use otrade_runner::{
    logging, BotConfig, Collaborators, HttpOracle, LoopError, MemoryService, NoForcedExits,
    NoOracle, PaperBroker, ScoringOracle, SessionStats, SyntheticMarket, TradeJournal,
    TradingLoopController,
};

#[derive(Parser)]
#[command(
    name = "otrade",
    about = "OTrade — multi-timeframe trading decision engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading loop against the paper broker until Ctrl-C.
    Paper {
        /// Path to a TOML config file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the paper market seed.
        #[arg(long)]
        seed: Option<u64>,

        /// Override the traded symbols.
        #[arg(long, num_args = 1..)]
        symbols: Option<Vec<String>>,
    },
    /// Configuration commands.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Pattern memory commands.
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate a config file and print its hash.
    Check {
        /// Path to the TOML config file.
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Summarize the stored patterns.
    Stats {
        /// Config file naming the store. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Store path, overriding the config.
        #[arg(long)]
        path: Option<PathBuf>,

        /// Print the summary as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Paper {
            config,
            seed,
            symbols,
        } => run_paper(config.as_deref(), seed, symbols).await,
        Commands::Config { action } => match action {
            ConfigAction::Check { config } => run_config_check(&config),
        },
        Commands::Memory { action } => match action {
            MemoryAction::Stats { config, path, json } => {
                run_memory_stats(config.as_deref(), path, json)
            }
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<BotConfig> {
    match path {
        Some(path) => BotConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(BotConfig::default()),
    }
}

async fn run_paper(
    config_path: Option<&Path>,
    seed: Option<u64>,
    symbols: Option<Vec<String>>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(seed) = seed {
        config.paper.seed = seed;
    }
    if let Some(symbols) = symbols {
        config.symbols = symbols;
    }
    config.validate()?;
    logging::init(&config.logging)?;

    let hash = config.config_hash()?;
    tracing::info!(
        config_hash = %hash.short(),
        seed = config.paper.seed,
        symbols = ?config.symbols,
        "starting paper session"
    );

    // Paper collaborators
    let bars = MultiTimeframeAnalyzer::new(
        &config.timeframes,
        config.primary_timeframe,
        config.analyzer.clone(),
    )
    .bars_needed();
    let market = Arc::new(SyntheticMarket::new(
        config.paper.clone(),
        SyntheticMarket::history_for(&config.timeframes, bars),
    ));
    let broker = Arc::new(PaperBroker::new(Arc::clone(&market), &config.paper));
    let oracle: Arc<dyn ScoringOracle> =
        match HttpOracle::from_config(&config.oracle, config.timeouts.oracle()) {
            Some(http) => {
                tracing::info!(url = %http.url(), "using HTTP oracle");
                Arc::new(http)
            }
            None => Arc::new(NoOracle),
        };

    let store: Arc<dyn PatternStore> = Arc::new(JsonFileStore::new(&config.memory.path));
    let memory = MemoryService::open(
        PatternMemory::new(config.memory.clone()),
        store,
        config.timeouts.storage(),
    )
    .await?;
    let journal = if config.journal.enabled {
        let journal = TradeJournal::open(&config.journal.dir, Utc::now())?;
        if let Some(path) = journal.path() {
            tracing::info!(path = %path.display(), "journaling trades");
        }
        journal
    } else {
        TradeJournal::in_memory()
    };

    // Shutdown on Ctrl-C
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, stopping after the current cycle");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for Ctrl-C");
                // Keep the sender alive so the loop is not stopped
                std::future::pending::<()>().await;
            }
        }
    });
    let driver = tokio::spawn(Arc::clone(&market).drive(shutdown_rx.clone()));

    let collaborators = Collaborators {
        market,
        broker,
        oracle,
        forced_exits: Arc::new(NoForcedExits),
    };
    let supervision = config.supervision.clone();
    let mut controller =
        TradingLoopController::new(config, collaborators, Arc::new(memory), journal)?;

    let result = supervise(&mut controller, &supervision, shutdown_rx).await;
    driver.abort();
    let stats = result?;

    let summary = controller.memory().summary().await;
    print_session(&stats, &summary);
    Ok(())
}

/// Re-run the loop after connectivity losses, with exponential backoff.
async fn supervise(
    controller: &mut TradingLoopController,
    supervision: &otrade_runner::SupervisionConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<SessionStats, LoopError> {
    let mut restarts = 0u32;
    loop {
        match controller.run(shutdown.clone()).await {
            Ok(stats) => return Ok(stats),
            Err(LoopError::ConnectivityLost { consecutive })
                if restarts < supervision.max_restarts =>
            {
                restarts += 1;
                let delay = supervision.backoff(restarts);
                tracing::warn!(
                    consecutive,
                    restart = restarts,
                    max_restarts = supervision.max_restarts,
                    delay_secs = delay.as_secs(),
                    "broker connectivity lost, restarting loop"
                );
                let mut waiter = shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = waiter.changed() => {}
                }
                if *shutdown.borrow() {
                    return Ok(controller.stats().clone());
                }
            }
            Err(e) => {
                tracing::error!(error = %e, restarts, "trading loop stopped");
                return Err(e);
            }
        }
    }
}

fn run_config_check(path: &Path) -> Result<()> {
    let config = load_config(Some(path))?;
    let hash = config.config_hash()?;
    println!("Config OK: {}", path.display());
    println!("  Hash:        {}", hash.short());
    println!("  Symbols:     {}", config.symbols.join(", "));
    let timeframes: Vec<String> = config.timeframes.iter().map(|t| t.to_string()).collect();
    println!(
        "  Timeframes:  {} (primary {})",
        timeframes.join(", "),
        config.primary_timeframe
    );
    println!("  Cadence:     {}s", config.cadence_secs);
    println!(
        "  Risk:        {:.2}% per trade, max {} open",
        config.risk.risk_fraction * 100.0,
        config.risk.max_open_positions
    );
    println!("  Memory:      {}", config.memory.path.display());
    Ok(())
}

fn run_memory_stats(config_path: Option<&Path>, path: Option<PathBuf>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let path = path.unwrap_or_else(|| config.memory.path.clone());
    let store = JsonFileStore::new(&path);
    let mut memory = PatternMemory::new(config.memory);
    memory
        .load(&store)
        .with_context(|| format!("loading pattern store {}", path.display()))?;
    let summary = memory.summary();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("Pattern store: {}", path.display());
    print_memory(&summary);
    Ok(())
}

fn print_memory(summary: &LearningSummary) {
    println!("  Patterns:    {}", summary.total);
    println!(
        "  Outcomes:    {} win / {} loss / {} neutral",
        summary.wins, summary.losses, summary.neutral
    );
    println!("  Win rate:    {:.1}%", summary.win_rate * 100.0);
    println!("  Avg return:  {:.4}%", summary.average_return * 100.0);
    if let Some((id, count)) = &summary.most_matched {
        println!("  Most recalled: {id} ({count} matches)");
    }
}

fn print_session(stats: &SessionStats, memory: &LearningSummary) {
    println!();
    println!("=== Session Summary ===");
    println!("Trades:        {}", stats.trades);
    println!(
        "Wins/Losses:   {}/{} ({:.1}% win rate)",
        stats.wins,
        stats.losses,
        stats.win_rate() * 100.0
    );
    println!("Net profit:    {:.2}", stats.net_profit());
    match stats.profit_factor() {
        Some(pf) => println!("Profit factor: {pf:.2}"),
        None => println!("Profit factor: n/a"),
    }
    println!("Total return:  {:.4}%", stats.total_return * 100.0);
    if stats.estimated > 0 {
        println!("Estimated:     {} closes confirmed by re-query", stats.estimated);
    }
    println!();
    println!("=== Pattern Memory ===");
    print_memory(memory);
}
