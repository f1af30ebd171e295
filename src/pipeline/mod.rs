//! Pipeline orchestrator: ties source → master store → metrics → ranking cache.
//!
//! ## Run modes
//!
//! `run_batch()`: one bounded unit of a cycle (cron use):
//!   1. Load the cycle cursor; resolve the universe only when starting fresh
//!   2. Take the next batch from pending, prefetch quotes in bulk
//!   3. Fetch, persist and enrich each symbol sequentially under a time budget
//!   4. Merge results into the ranking cache, then mark the batch completed
//!   Re-running after a crash replays the unmarked batch; upsert-by-ticker
//!   absorbs the duplicates.
//!
//! `analyze_symbol()`: one symbol synchronously, served from the ranking
//!   cache when fresh enough.
//!
//! `recalculate_all()`: replay enrichment over the master store with no
//!   network access at all.

pub mod progress;

use crate::config::{AppConfig, Thresholds};
use crate::metrics::enrich::calculate_metrics_from_raw;
use crate::models::{EnrichedStock, Exclusion, Quote, RawFinancialsPatch, Stage};
use crate::screener::is_otc_venue;
use crate::source::universe::{UniverseError, UniverseProvider};
use crate::source::{FinancialDataSource, Period, SourceError};
use crate::storage::exclusions::ExclusionStore;
use crate::storage::master::MasterStore;
use crate::storage::ranking::RankingStore;
use crate::storage::{KeyValueStore, StorageError};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use self::progress::ProgressTracker;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("universe resolution failed: {0}")]
    Universe(#[from] UniverseError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("data source failure: {0}")]
    Source(#[from] SourceError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("universe resolved to zero symbols")]
    EmptyUniverse,
}

/// Result of one symbol inside a batch. Only `Failed` is logged as a problem.
#[derive(Debug)]
pub enum SymbolOutcome {
    Enriched(Box<EnrichedStock>),
    Excluded(Exclusion),
    Failed(PipelineError),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub cycle_id: String,
    pub processed_in_batch: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pending_remaining: usize,
    pub elapsed_ms: u64,
}

impl BatchReport {
    pub fn is_cycle_complete(&self) -> bool {
        self.pending_remaining == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecalcReport {
    pub recalculated: usize,
    pub excluded: usize,
}

pub struct Orchestrator {
    config: AppConfig,
    source: Arc<dyn FinancialDataSource>,
    universe: Box<dyn UniverseProvider>,
    store: Arc<dyn KeyValueStore>,
    master: MasterStore,
    ranking: RankingStore,
    exclusions: ExclusionStore,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        source: Arc<dyn FinancialDataSource>,
        universe: Box<dyn UniverseProvider>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            master: MasterStore::new(Arc::clone(&store)),
            ranking: RankingStore::new(Arc::clone(&store)),
            exclusions: ExclusionStore::new(Arc::clone(&store)),
            config,
            source,
            universe,
            store,
        }
    }

    pub async fn run_batch(&self, cycle_id: &str) -> Result<BatchReport, PipelineError> {
        let started = Instant::now();
        let budget = Duration::from_secs(self.config.pipeline.time_budget_secs);

        // ── 1. Cycle cursor ───────────────────────────────────────────────────
        info!("=== Step 1: Loading cycle {} ===", cycle_id);
        let mut tracker = ProgressTracker::load(Arc::clone(&self.store), cycle_id)?;
        if !tracker.has_state() {
            let symbols = self.universe.resolve().await?;
            if symbols.is_empty() {
                return Err(PipelineError::EmptyUniverse);
            }
            tracker.initialize(symbols)?;
        }

        let batch = tracker.next_batch(self.config.pipeline.batch_size);
        let (done, total) = tracker.progress();
        if batch.is_empty() {
            info!("Cycle {} already complete ({}/{})", cycle_id, done, total);
            return Ok(self.report(cycle_id, &tracker, 0, 0, 0, started));
        }

        // ── 2. Fetch + enrich ─────────────────────────────────────────────────
        info!(
            "=== Step 2: Processing {} symbols ({}/{} done) ===",
            batch.len(),
            done,
            total
        );
        let mut quotes = self.prefetch_quotes(&batch).await;

        let mut attempted = Vec::with_capacity(batch.len());
        let mut enriched = Vec::new();
        let mut excluded = Vec::new();
        let mut failed = 0usize;

        for symbol in &batch {
            // at least one symbol per run, so a drain always advances
            if !attempted.is_empty() && started.elapsed() >= budget {
                warn!(
                    "Time budget of {:?} reached after {} of {} symbols",
                    budget,
                    attempted.len(),
                    batch.len()
                );
                break;
            }

            let outcome = self.process_symbol(symbol, quotes.remove(symbol)).await;
            attempted.push(symbol.clone());

            match outcome {
                SymbolOutcome::Enriched(stock) => enriched.push(*stock),
                SymbolOutcome::Excluded(e) => {
                    debug!("{}", e);
                    excluded.push(e);
                }
                SymbolOutcome::Failed(e) => {
                    warn!("{}: {:#}", symbol, e);
                    failed += 1;
                }
            }
        }

        // ── 3. Persist ────────────────────────────────────────────────────────
        info!("=== Step 3: Saving {} enriched records ===", enriched.len());
        self.ranking.merge(&enriched, Utc::now())?;
        self.exclusions.record(&excluded)?;
        self.exclusions.clear(enriched.iter().map(|s| s.ticker.as_str()))?;
        tracker.mark_completed(&attempted)?;

        let report = self.report(cycle_id, &tracker, enriched.len(), excluded.len(), failed, started);
        info!(
            "=== Done: {} processed | {} ok | {} skipped | {} failed | {} pending ===",
            attempted.len(),
            report.succeeded,
            report.skipped,
            report.failed,
            report.pending_remaining
        );
        Ok(report)
    }

    fn report(
        &self,
        cycle_id: &str,
        tracker: &ProgressTracker,
        succeeded: usize,
        skipped: usize,
        failed: usize,
        started: Instant,
    ) -> BatchReport {
        BatchReport {
            cycle_id: cycle_id.to_string(),
            processed_in_batch: succeeded + skipped + failed,
            succeeded,
            skipped,
            failed,
            pending_remaining: tracker.pending_count(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// One provider call for the whole batch. Symbols missing from the
    /// response fall back to a per-symbol quote call later.
    async fn prefetch_quotes(&self, batch: &[String]) -> HashMap<String, Quote> {
        if !self.config.pipeline.bulk_quotes {
            return HashMap::new();
        }
        match self.source.get_quotes(batch).await {
            Ok(quotes) => quotes
                .into_iter()
                .map(|q| (q.symbol.trim().to_uppercase(), q))
                .collect(),
            Err(e) => {
                warn!("Bulk quote failed, falling back to per-symbol quotes: {}", e);
                HashMap::new()
            }
        }
    }

    /// Quote first: symbols with no quote or an OTC venue skip the remaining
    /// calls. Everything fetched is saved to the master store before enrichment.
    pub async fn process_symbol(&self, symbol: &str, prefetched: Option<Quote>) -> SymbolOutcome {
        let quote = match prefetched {
            Some(q) => Some(q),
            None => match self.source.get_quote(symbol).await {
                Ok(q) => q,
                Err(e) => return SymbolOutcome::Failed(e.into()),
            },
        };

        let Some(quote) = quote else {
            return SymbolOutcome::Excluded(Exclusion::new(symbol, Stage::Enrichment, "no quote data"));
        };
        if let Some(exchange) = quote.exchange.as_deref() {
            if is_otc_venue(exchange) {
                return SymbolOutcome::Excluded(Exclusion::new(
                    symbol,
                    Stage::Eligibility,
                    format!("OTC/pink-sheet venue ({})", exchange),
                ));
            }
        }

        let mut patch = match self.fetch_fundamentals(symbol).await {
            Ok(patch) => patch,
            Err(e) => return SymbolOutcome::Failed(e.into()),
        };
        patch.quote = Some(quote);

        let now = Utc::now();
        let raw = match self.master.save(symbol, patch, now) {
            Ok(raw) => raw,
            Err(e) => return SymbolOutcome::Failed(e.into()),
        };

        match calculate_metrics_from_raw(&raw, &self.config.thresholds, now) {
            Ok(stock) => SymbolOutcome::Enriched(Box::new(stock)),
            Err(exclusion) => SymbolOutcome::Excluded(exclusion),
        }
    }

    /// Sequential per-symbol calls; the source's rate limiter spaces them.
    async fn fetch_fundamentals(&self, symbol: &str) -> Result<RawFinancialsPatch, SourceError> {
        let p = &self.config.provider;
        let src = &self.source;

        Ok(RawFinancialsPatch {
            quote: None,
            profile: src.get_profile(symbol).await?,
            income_quarterly: Some(src.get_income_statements(symbol, Period::Quarter, p.quarters_limit).await?),
            income_annual: Some(src.get_income_statements(symbol, Period::Annual, p.annual_limit).await?),
            balance_sheet: src.get_balance_sheet(symbol, Period::Quarter, 1).await?.into_iter().next(),
            cash_flow_quarterly: Some(src.get_cash_flow(symbol, Period::Quarter, 4).await?),
            estimates: Some(src.get_analyst_estimates(symbol, p.estimates_limit).await?),
        })
    }

    /// Synchronous single-symbol analysis. A cached record younger than
    /// `max_age` is returned without touching the provider. `Ok(None)` means
    /// the symbol has no usable data.
    pub async fn analyze_symbol(
        &self,
        symbol: &str,
        max_age: Option<Duration>,
    ) -> Result<Option<EnrichedStock>, PipelineError> {
        let symbol = symbol.trim().to_uppercase();

        if let Some(max_age) = max_age {
            if let Some(cached) = self.ranking.get(&symbol)? {
                let age = (Utc::now() - cached.last_updated).to_std().unwrap_or_default();
                if age < max_age {
                    debug!("{}: serving cached record ({:?} old)", symbol, age);
                    return Ok(Some(cached));
                }
            }
        }

        match self.process_symbol(&symbol, None).await {
            SymbolOutcome::Enriched(stock) => {
                self.ranking.merge(std::slice::from_ref(stock.as_ref()), Utc::now())?;
                self.exclusions.clear([stock.ticker.as_str()])?;
                Ok(Some(*stock))
            }
            SymbolOutcome::Excluded(e) => {
                info!("{}", e);
                self.exclusions.record(std::slice::from_ref(&e))?;
                Ok(None)
            }
            SymbolOutcome::Failed(e) => Err(e),
        }
    }
}

/// Recompute every enriched record from the master store. No network.
pub fn recalculate_all(
    master: &MasterStore,
    ranking: &RankingStore,
    exclusions: &ExclusionStore,
    thresholds: &Thresholds,
) -> Result<RecalcReport, StorageError> {
    let now = Utc::now();
    let mut report = RecalcReport::default();
    let mut stocks = Vec::new();
    let mut excluded = Vec::new();

    for symbol in master.list_keys()? {
        let Some(raw) = master.get(&symbol)? else {
            continue;
        };
        match calculate_metrics_from_raw(&raw, thresholds, now) {
            Ok(stock) => stocks.push(stock),
            Err(e) => {
                debug!("{}", e);
                excluded.push(e);
            }
        }
    }

    report.recalculated = ranking.merge(&stocks, now)?;
    report.excluded = exclusions.record(&excluded)?;
    exclusions.clear(stocks.iter().map(|s| s.ticker.as_str()))?;
    info!(
        "Recalculated {} records ({} excluded)",
        report.recalculated, report.excluded
    );
    Ok(report)
}
