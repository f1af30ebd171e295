//! Universe filtering and leaderboard construction.
//!
//! Quality track: eligibility → negative EPS → forward P/E band → benchmark
//! growth → fund exclusion → GRIP scoring. Turnaround track: eligibility →
//! fund exclusion → turnaround rule table → turnaround scoring. Every stage
//! records why each dropped ticker was dropped.

use crate::config::{AppConfig, BenchmarkConfig, BenchmarkMode, Thresholds};
use crate::models::{EnrichedStock, Exclusion, Stage};
use crate::scoring::{composite, score_population};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct FilterResult {
    pub passed: Vec<EnrichedStock>,
    pub excluded: Vec<Exclusion>,
}

impl FilterResult {
    fn start(stocks: Vec<EnrichedStock>) -> Self {
        Self { passed: stocks, excluded: Vec::new() }
    }

    /// Run one stage over the current passing set. `check` returns a reason
    /// to drop the stock, or `None` to keep it.
    fn stage(mut self, stage: Stage, check: impl Fn(&EnrichedStock) -> Option<String>) -> Self {
        let before = self.passed.len();
        let mut kept = Vec::with_capacity(before);
        for stock in self.passed {
            match check(&stock) {
                Some(reason) => self.excluded.push(Exclusion::new(&stock.ticker, stage, reason)),
                None => kept.push(stock),
            }
        }
        debug!("Stage {}: {} → {}", stage, before, kept.len());
        self.passed = kept;
        self
    }
}

// ── Stage checks ──────────────────────────────────────────────────────────────

pub fn is_otc_venue(exchange: &str) -> bool {
    let upper = exchange.to_uppercase();
    upper.contains("OTC") || upper.contains("PINK")
}

/// Venue, liquidity and data-integrity checks shared by both tracks.
pub fn eligibility(s: &EnrichedStock) -> Option<String> {
    if is_otc_venue(&s.exchange) {
        return Some(format!("OTC/pink-sheet venue ({})", s.exchange));
    }
    if s.volume <= 0.0 && s.avg_volume <= 0.0 {
        return Some("no trading volume".into());
    }
    if s.price <= 0.0 {
        return Some("price is zero".into());
    }
    if s.market_cap <= 0.0 || s.revenue <= 0.0 {
        return Some("missing market cap or revenue".into());
    }
    if s.ttm_eps > s.price {
        return Some(format!("TTM EPS {:.2} above price {:.2}", s.ttm_eps, s.price));
    }
    if s.ttm_eps > 0.5 && s.ntm_eps > s.ttm_eps * 5.0 {
        return Some(format!(
            "suspicious forward growth (NTM {:.2} vs TTM {:.2})",
            s.ntm_eps, s.ttm_eps
        ));
    }
    if s.ttm_eps > 0.0 && s.price / s.ttm_eps < 0.5 {
        return Some("P/E below 0.5".into());
    }
    if s.net_income > s.revenue * 10.0 {
        return Some("net income above 10x revenue".into());
    }
    if s.net_income > s.market_cap * 2.0 {
        return Some("net income above 2x market cap".into());
    }
    None
}

pub fn negative_eps(s: &EnrichedStock) -> Option<String> {
    if s.ttm_eps <= 0.0 {
        Some("TTM EPS ≤ 0".into())
    } else if s.ntm_eps <= 0.0 {
        Some("NTM EPS ≤ 0".into())
    } else {
        None
    }
}

/// Inclusive band: values exactly on `min` or `max` pass.
pub fn forward_pe_band(s: &EnrichedStock, t: &Thresholds) -> Option<String> {
    match s.forward_pe {
        None => Some("forward P/E unavailable".into()),
        Some(pe) if pe < t.min_forward_pe => Some(format!("forward P/E < {}", t.min_forward_pe)),
        Some(pe) if pe > t.max_forward_pe => Some(format!("forward P/E > {}", t.max_forward_pe)),
        Some(_) => None,
    }
}

pub fn fund_exclusion(s: &EnrichedStock) -> Option<String> {
    s.is_fund.then(|| "fund, ETF or not actively trading".to_string())
}

/// Reference growth rate: average EPS growth of the `top_n` largest names
/// among `candidates`, or the fixed configured rate.
pub fn benchmark_growth(candidates: &[EnrichedStock], cfg: &BenchmarkConfig) -> Option<f64> {
    match cfg.mode {
        BenchmarkMode::Fixed => Some(cfg.fixed_growth_rate),
        BenchmarkMode::Dynamic => {
            let mut by_cap: Vec<&EnrichedStock> = candidates.iter().collect();
            by_cap.sort_by(|a, b| b.market_cap.total_cmp(&a.market_cap));

            let growth: Vec<f64> = by_cap
                .iter()
                .take(cfg.top_n)
                .filter_map(|s| s.eps_growth_rate)
                .collect();

            (!growth.is_empty()).then(|| growth.iter().sum::<f64>() / growth.len() as f64)
        }
    }
}

pub fn below_benchmark(s: &EnrichedStock, benchmark: Option<f64>) -> Option<String> {
    let benchmark = benchmark?;
    match s.eps_growth_rate {
        None => Some("EPS growth unavailable".into()),
        Some(g) if g < benchmark => Some(format!("EPS growth {:.1}% below benchmark {:.1}%", g, benchmark)),
        Some(_) => None,
    }
}

// ── Turnaround rule table ────────────────────────────────────────────────────

pub struct TurnaroundRule {
    pub name: &'static str,
    pub applies: fn(&EnrichedStock) -> bool,
}

fn loss_to_profit(s: &EnrichedStock) -> bool {
    s.ttm_eps < 0.0 && s.ntm_eps > 0.0
}

fn loss_with_revenue_growth(s: &EnrichedStock) -> bool {
    s.ttm_eps < 0.0 && s.revenue_growth_yoy.is_some_and(|g| g > 0.2)
}

fn thin_but_improving(s: &EnrichedStock) -> bool {
    s.ttm_eps < 1.0 && s.ntm_eps > s.ttm_eps
}

fn flagged_turnaround(s: &EnrichedStock) -> bool {
    s.is_turnaround
}

fn fast_growth_low_margin(s: &EnrichedStock) -> bool {
    s.cagr_3y.is_some_and(|c| c > 30.0) && s.net_margin.is_some_and(|m| m < 0.05)
}

/// Disjunction: a candidate needs any one rule plus positive revenue.
pub const TURNAROUND_RULES: &[TurnaroundRule] = &[
    TurnaroundRule { name: "loss now, profit expected", applies: loss_to_profit },
    TurnaroundRule { name: "loss with revenue growth > 20%", applies: loss_with_revenue_growth },
    TurnaroundRule { name: "EPS < 1 and improving", applies: thin_but_improving },
    TurnaroundRule { name: "flagged turnaround", applies: flagged_turnaround },
    TurnaroundRule { name: "3Y CAGR > 30% with net margin < 5%", applies: fast_growth_low_margin },
];

/// Name of the first matching rule, if the stock is a turnaround candidate.
pub fn turnaround_match(s: &EnrichedStock) -> Option<&'static str> {
    if s.revenue <= 0.0 {
        return None;
    }
    TURNAROUND_RULES.iter().find(|r| (r.applies)(s)).map(|r| r.name)
}

// ── Sorting ──────────────────────────────────────────────────────────────────

/// Descending by score; stable, so ties keep their input order.
pub fn sort_desc_by(stocks: &mut [EnrichedStock], key: impl Fn(&EnrichedStock) -> Option<f64>) {
    stocks.sort_by(|a, b| {
        let a = key(a).unwrap_or(f64::NEG_INFINITY);
        let b = key(b).unwrap_or(f64::NEG_INFINITY);
        b.total_cmp(&a)
    });
}

// ── Leaderboards ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScreenConfig {
    pub thresholds: Thresholds,
    pub benchmark: BenchmarkConfig,
    pub ranking_count: usize,
}

impl From<&AppConfig> for ScreenConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            thresholds: config.thresholds.clone(),
            benchmark: config.benchmark.clone(),
            ranking_count: config.output.ranking_count,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Leaderboards {
    pub quality: Vec<EnrichedStock>,
    pub turnaround: Vec<EnrichedStock>,
    pub quality_excluded: Vec<Exclusion>,
    pub turnaround_excluded: Vec<Exclusion>,
    pub benchmark_growth: Option<f64>,
    /// Qualifying counts before truncation to `ranking_count`.
    pub quality_total: usize,
    pub turnaround_total: usize,
}

impl Leaderboards {
    /// Why `ticker` is absent from each track, `None` where it is ranked.
    pub fn explain(&self, ticker: &str) -> (Option<&Exclusion>, Option<&Exclusion>) {
        let ticker = ticker.trim().to_uppercase();
        (
            self.quality_excluded.iter().find(|e| e.ticker == ticker),
            self.turnaround_excluded.iter().find(|e| e.ticker == ticker),
        )
    }
}

pub fn build_leaderboards(stocks: &[EnrichedStock], cfg: &ScreenConfig) -> Leaderboards {
    let t = &cfg.thresholds;
    let eligible = FilterResult::start(stocks.to_vec()).stage(Stage::Eligibility, eligibility);

    // ── Quality ───────────────────────────────────────────────────────────────
    let quality = eligible
        .clone()
        .stage(Stage::NegativeEps, negative_eps)
        .stage(Stage::ForwardPe, |s| forward_pe_band(s, t));

    let benchmark = benchmark_growth(&quality.passed, &cfg.benchmark);
    let mut quality = quality
        .stage(Stage::Benchmark, |s| below_benchmark(s, benchmark))
        .stage(Stage::Fund, fund_exclusion);

    score_quality(&mut quality.passed, t);
    let mut quality = quality.stage(Stage::Score, |s| match s.grip_score {
        None => Some("GRIP score unavailable".into()),
        Some(score) if !s.is_quality => Some(format!("GRIP score {score} below threshold")),
        Some(_) => None,
    });
    sort_desc_by(&mut quality.passed, |s| s.grip_score);

    // ── Turnaround ────────────────────────────────────────────────────────────
    let mut turnaround = eligible
        .stage(Stage::Fund, fund_exclusion)
        .stage(Stage::TurnaroundRule, |s| {
            if s.revenue <= 0.0 {
                Some("no revenue".into())
            } else if turnaround_match(s).is_none() {
                Some("no turnaround rule matched".into())
            } else {
                None
            }
        });

    score_turnaround(&mut turnaround.passed, t);
    let mut turnaround = turnaround.stage(Stage::Score, |s| match s.t_grip_score {
        None => Some("turnaround score unavailable".into()),
        Some(score) if !s.is_turnaround => Some(format!("turnaround score {score} below threshold")),
        Some(_) => None,
    });
    sort_desc_by(&mut turnaround.passed, |s| s.t_grip_score);

    let quality_total = quality.passed.len();
    let turnaround_total = turnaround.passed.len();
    quality.passed.truncate(cfg.ranking_count);
    turnaround.passed.truncate(cfg.ranking_count);

    info!(
        "Leaderboards: {} quality, {} turnaround from {} records (benchmark growth {:?})",
        quality_total,
        turnaround_total,
        stocks.len(),
        benchmark
    );
    for (reason, count) in exclusion_histogram(&quality.excluded) {
        debug!("  quality excluded {:>5} × {}", count, reason);
    }
    for (reason, count) in exclusion_histogram(&turnaround.excluded) {
        debug!("  turnaround excluded {:>5} × {}", count, reason);
    }

    Leaderboards {
        quality: quality.passed,
        turnaround: turnaround.passed,
        quality_excluded: quality.excluded,
        turnaround_excluded: turnaround.excluded,
        benchmark_growth: benchmark,
        quality_total,
        turnaround_total,
    }
}

/// PEG (inverted) + Gap Ratio scores against the passing population.
fn score_quality(stocks: &mut [EnrichedStock], t: &Thresholds) {
    let pegs: Vec<Option<f64>> = stocks.iter().map(|s| s.peg).collect();
    let gaps: Vec<Option<f64>> = stocks.iter().map(|s| s.gap_ratio).collect();
    let peg_scores = score_population(&pegs, true);
    let gap_scores = score_population(&gaps, false);

    for ((stock, peg_score), gap_score) in stocks.iter_mut().zip(peg_scores).zip(gap_scores) {
        stock.peg_score = peg_score;
        stock.gap_score = gap_score;
        stock.grip_score = composite(&[peg_score, gap_score]);
        stock.is_quality = stock.grip_score.is_some_and(|s| s > t.quality_min_score);
    }
}

/// Improvement-delta score against the positive-delta population.
fn score_turnaround(stocks: &mut [EnrichedStock], t: &Thresholds) {
    let deltas: Vec<Option<f64>> = stocks.iter().map(|s| s.turnaround_delta).collect();
    let scores = score_population(&deltas, false);

    for (stock, score) in stocks.iter_mut().zip(scores) {
        stock.t_grip_score = composite(&[score]);
        stock.is_turnaround = stock.t_grip_score.is_some_and(|s| s > t.turnaround_min_score);
    }
}

/// Reason → count, for "why is X missing" diagnostics.
pub fn exclusion_histogram(excluded: &[Exclusion]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for e in excluded {
        *counts.entry(format!("{}: {}", e.stage, e.reason)).or_insert(0) += 1;
    }
    counts
}
