mod config;
mod metrics;
mod models;
mod pipeline;
mod scoring;
mod screener;
mod source;
mod storage;
mod utils;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::models::EnrichedStock;
use crate::pipeline::progress::{cycle_id_for, ProgressTracker};
use crate::pipeline::{recalculate_all, Orchestrator, PipelineError};
use crate::scoring::grip_grade;
use crate::screener::{build_leaderboards, turnaround_match, Leaderboards, ScreenConfig};
use crate::source::universe::{provider_for, UniverseSpec};
use crate::source::{FinancialDataSource, FmpClient};
use crate::storage::exclusions::ExclusionStore;
use crate::storage::master::MasterStore;
use crate::storage::ranking::RankingStore;
use crate::storage::{DuckDbStore, KeyValueStore};
use crate::utils::{fmt_money, fmt_number, fmt_opt};

#[derive(Parser)]
#[command(name = "grip-tracker", about = "GRIP growth-at-a-reasonable-price stock screener", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Process the next batch of the current cycle (cron entry point)
    RunBatch {
        /// Cycle id (default: today's UTC date)
        #[arg(long)]
        cycle: Option<String>,

        /// Keep running batches until the cycle is complete
        #[arg(long)]
        drain: bool,
    },

    /// Analyze one ticker, served from cache when fresh
    Analyze {
        ticker: String,

        /// Ignore the cache and fetch live data
        #[arg(long)]
        fresh: bool,
    },

    /// Recompute every cached record from stored raw data (no API calls)
    Recalculate,

    /// Print a ranked leaderboard from the cache
    Leaderboard {
        #[arg(short, long, value_enum, default_value_t = Track::Quality)]
        track: Track,

        /// Rows to print (default: output.ranking_count)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Explain where a ticker stands on each leaderboard
    Explain { ticker: String },

    /// Show cycle progress and store statistics
    Status,

    /// Write the ranking cache as JSON
    Export {
        #[arg(short, long, default_value = "data/grip-cache.json")]
        out: PathBuf,
    },

    /// Apply schema migrations without processing anything
    Migrate,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Track {
    Quality,
    Turnaround,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "grip_tracker=info,warn",
        1 => "grip_tracker=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::RunBatch { cycle, drain } => {
            let _t = utils::Timer::start("Batch run");
            let store = open_store(&config)?;
            let orchestrator = build_orchestrator(&config, store)?;
            let cycle_id = cycle.unwrap_or_else(|| cycle_id_for(Utc::now()));

            loop {
                let report = orchestrator.run_batch(&cycle_id).await?;
                println!("{}", serde_json::to_string(&report)?);
                if !drain || report.is_cycle_complete() {
                    break;
                }
            }
        }

        Command::Analyze { ticker, fresh } => {
            let store = open_store(&config)?;
            let orchestrator = build_orchestrator(&config, store)?;
            let max_age = (!fresh).then(|| Duration::from_secs(config.output.cache_ttl_hours * 3600));

            match orchestrator.analyze_symbol(&ticker, max_age).await? {
                Some(stock) => print_stock(&stock, config.output.decimals),
                None => println!("No usable data for {}.", ticker.to_uppercase()),
            }
        }

        Command::Recalculate => {
            let _t = utils::Timer::start("Recalculation");
            let store = open_store(&config)?;
            let report = recalculate_all(
                &MasterStore::new(store.clone()),
                &RankingStore::new(store.clone()),
                &ExclusionStore::new(store),
                &config.thresholds,
            )?;
            println!("Recalculated {} records ({} excluded).", report.recalculated, report.excluded);
        }

        Command::Leaderboard { track, limit } => {
            let boards = load_leaderboards(&config)?;
            let limit = limit.unwrap_or(config.output.ranking_count);
            match track {
                Track::Quality => print_quality(&boards, limit, config.output.decimals),
                Track::Turnaround => print_turnaround(&boards, limit, config.output.decimals),
            }
        }

        Command::Explain { ticker } => {
            let ticker = ticker.trim().to_uppercase();
            let store = open_store(&config)?;
            if let Some(e) = ExclusionStore::new(store.clone()).get(&ticker)? {
                println!("{}:", ticker);
                println!("  {:<10} excluded at {}: {}", "pipeline", e.stage, e.reason);
                return Ok(());
            }
            if RankingStore::new(store).get(&ticker)?.is_none() {
                println!("{} has not been processed yet.", ticker);
                return Ok(());
            }
            let boards = load_leaderboards(&config)?;
            explain(&boards, &ticker);
        }

        Command::Status => {
            let store = Arc::new(
                DuckDbStore::open(&config.storage.db_path).context("Failed to open DuckDB")?,
            );
            store.run_migrations()?;
            print_status(&store)?;
        }

        Command::Export { out } => {
            let store = open_store(&config)?;
            let cache = RankingStore::new(store).load()?;
            if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Could not create dir {:?}", parent))?;
            }
            std::fs::write(&out, serde_json::to_string_pretty(&cache)?)
                .with_context(|| format!("Could not write {:?}", out))?;
            println!("Exported {} records to {:?}.", cache.stocks.len(), out);
        }

        Command::Migrate => {
            DuckDbStore::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}

// ── Wiring ────────────────────────────────────────────────────────────────────

fn open_store(config: &AppConfig) -> Result<Arc<dyn KeyValueStore>> {
    let store = DuckDbStore::open(&config.storage.db_path)
        .with_context(|| format!("Failed to open DuckDB at {:?}", config.storage.db_path))?;
    if config.storage.run_migrations {
        store.run_migrations()?;
    }
    Ok(Arc::new(store))
}

fn build_orchestrator(config: &AppConfig, store: Arc<dyn KeyValueStore>) -> Result<Orchestrator> {
    let api_key = config.provider.api_key().ok_or_else(|| {
        PipelineError::Configuration(
            "no FMP API key (set provider.api_key, GRIP__PROVIDER__API_KEY or FMP_API_KEY)".into(),
        )
    })?;

    let source: Arc<dyn FinancialDataSource> =
        Arc::new(FmpClient::new(&config.provider, api_key).context("Failed to build FMP client")?);
    let spec: UniverseSpec = config.pipeline.universe.parse()?;
    let universe = provider_for(&spec, Arc::clone(&source));

    Ok(Orchestrator::new(config.clone(), source, universe, store))
}

fn load_leaderboards(config: &AppConfig) -> Result<Leaderboards> {
    let store = open_store(config)?;
    let cache = RankingStore::new(store).load()?;
    info!(
        "Ranking cache: {} records (updated {})",
        cache.stocks.len(),
        cache.last_updated.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into())
    );

    Ok(build_leaderboards(&cache.stocks, &ScreenConfig::from(config)))
}

// ── Output ────────────────────────────────────────────────────────────────────

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

fn print_quality(boards: &Leaderboards, limit: usize, d: usize) {
    println!(
        "Quality leaderboard: {} qualifying (benchmark growth {}%)",
        boards.quality_total,
        fmt_opt(boards.benchmark_growth, 1)
    );
    println!(
        "{:>3}  {:<6} {:<24} {:>9} {:>8} {:>6} {:>6} {:>6} {:>5}  {}",
        "#", "Ticker", "Name", "Price", "Fwd P/E", "PEG", "Gap", "GRIP", "Grade", "Status"
    );
    for (i, s) in boards.quality.iter().take(limit).enumerate() {
        println!(
            "{:>3}  {:<6} {:<24} {:>9} {:>8} {:>6} {:>6} {:>6} {:>5}  {}",
            i + 1,
            s.ticker,
            truncate(&s.name, 24),
            format!("{:.*}", d, s.price),
            fmt_opt(s.forward_pe, 1),
            fmt_opt(s.peg, d),
            fmt_opt(s.gap_ratio, d),
            fmt_opt(s.grip_score, 1),
            grip_grade(s.grip_score),
            s.grip_status
        );
    }
}

fn print_turnaround(boards: &Leaderboards, limit: usize, d: usize) {
    println!("Turnaround leaderboard: {} qualifying", boards.turnaround_total);
    println!(
        "{:>3}  {:<6} {:<24} {:>8} {:>8} {:>7} {:>7} {:>9}  {}",
        "#", "Ticker", "Name", "TTM EPS", "NTM EPS", "Δ EPS", "T-GRIP", "Runway Q", "Rule"
    );
    for (i, s) in boards.turnaround.iter().take(limit).enumerate() {
        println!(
            "{:>3}  {:<6} {:<24} {:>8} {:>8} {:>7} {:>7} {:>9}  {}",
            i + 1,
            s.ticker,
            truncate(&s.name, 24),
            format!("{:.*}", d, s.ttm_eps),
            format!("{:.*}", d, s.ntm_eps),
            fmt_opt(s.turnaround_delta, d),
            fmt_opt(s.t_grip_score, 1),
            fmt_opt(s.cash_runway_quarters, 1),
            turnaround_match(s).unwrap_or("-")
        );
    }
}

fn explain(boards: &Leaderboards, ticker: &str) {
    let (quality_excl, turnaround_excl) = boards.explain(ticker);

    let line = |name: &str, board: &[EnrichedStock], total: usize, excl: Option<&models::Exclusion>| {
        match (board.iter().position(|s| s.ticker == ticker), excl) {
            (Some(r), _) => println!("  {:<10} ranked #{} of {}", name, r + 1, total),
            (None, Some(e)) => println!("  {:<10} excluded at {}: {}", name, e.stage, e.reason),
            (None, None) => println!("  {:<10} qualifies, outside the top {}", name, board.len()),
        }
    };

    println!("{}:", ticker);
    line("quality", boards.quality.as_slice(), boards.quality_total, quality_excl);
    line("turnaround", boards.turnaround.as_slice(), boards.turnaround_total, turnaround_excl);
}

fn print_stock(s: &EnrichedStock, d: usize) {
    println!("─────────────────────────────────");
    println!("  {} · {}", s.ticker, s.name);
    println!("  {} / {} · {}", s.sector, s.industry, s.exchange);
    println!("─────────────────────────────────");
    println!("  Price        : {:.*}", d, s.price);
    println!("  Market cap   : {}", fmt_money(s.market_cap));
    println!("  TTM EPS      : {:.*}", d, s.ttm_eps);
    println!(
        "  FY1 / FY2    : {:.*} / {:.*}{}",
        d,
        s.fy1_eps,
        d,
        s.fy2_eps,
        if s.estimates_synthesized { " (synthesized)" } else { "" }
    );
    println!("  NTM EPS      : {:.*}", d, s.ntm_eps);
    println!("  TTM / Fwd P/E: {} / {}", fmt_opt(s.ttm_pe, 1), fmt_opt(s.forward_pe, 1));
    println!("  EPS growth   : {}%", fmt_opt(s.eps_growth_rate, 1));
    println!("  PEG / Fwd PEG: {} / {}", fmt_opt(s.peg, d), fmt_opt(s.forward_peg, d));
    println!("  Gap ratio    : {}", fmt_opt(s.gap_ratio, d));
    println!("  GRIP status  : {}", s.grip_status);
    println!("  Rule of 40   : {}", fmt_opt(s.rule_of_40, 1));
    println!("  Cash runway  : {} quarters", fmt_opt(s.cash_runway_quarters, 1));
    for warning in &s.eps_warnings {
        println!("  ⚠ {}", warning);
    }
    println!("  Updated      : {}", s.last_updated.to_rfc3339());
    println!("─────────────────────────────────");
}

fn print_status(store: &Arc<DuckDbStore>) -> Result<()> {
    let kv: Arc<dyn KeyValueStore> = store.clone();
    let state = ProgressTracker::peek(kv.as_ref())?;
    let ranking = RankingStore::new(Arc::clone(&kv));
    let master = MasterStore::new(kv).list_keys()?;

    println!("─────────────────────────────────");
    println!("  GRIP Tracker — Status");
    println!("─────────────────────────────────");
    match state {
        Some(s) => {
            let total = s.pending.len() + s.completed.len();
            println!("  Cycle     : {}", s.cycle_id);
            println!(
                "  Progress  : {} / {} ({} pending)",
                fmt_number(s.completed.len() as i64),
                fmt_number(total as i64),
                fmt_number(s.pending.len() as i64)
            );
            println!("  Saved     : {}", s.last_updated.to_rfc3339());
        }
        None => println!("  Cycle     : —"),
    }
    println!("  Ranked    : {}", fmt_number(ranking.count()? as i64));
    println!("  Raw data  : {}", fmt_number(master.len() as i64));
    println!(
        "  Refreshed : {}",
        ranking.last_updated()?.map(|t| t.to_rfc3339()).unwrap_or_else(|| "—".into())
    );
    for (namespace, count) in store.namespace_counts()? {
        println!("  kv/{:<7}: {}", namespace, fmt_number(count));
    }
    println!("─────────────────────────────────");
    Ok(())
}
