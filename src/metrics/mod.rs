//! Pure metric derivations: NTM EPS, P/E variants, PEG, Gap Ratio, GRIP.
//!
//! Every guarded division returns `None` instead of dividing by a value at or
//! below its configured floor. `None` propagates downstream as an exclusion
//! reason, never as an error.

pub mod enrich;

use crate::config::Thresholds;
use crate::models::GripStatus;
use chrono::{Datelike, NaiveDate};

/// Months until fiscal year-end, always in `1..=12`.
pub fn months_remaining(fiscal_year_end_month: u32, reference: NaiveDate) -> u32 {
    let current = reference.month();
    let end = fiscal_year_end_month.clamp(1, 12);

    let remaining = if current <= end {
        end - current
    } else {
        12 - current + end
    };

    remaining.clamp(1, 12)
}

/// Rolling twelve-month EPS: FY1 weighted by the share of its year still ahead.
pub fn ntm_eps(fy1_eps: f64, fy2_eps: f64, months_remaining: u32) -> f64 {
    let fy1_weight = f64::from(months_remaining) / 12.0;
    fy1_eps * fy1_weight + fy2_eps * (1.0 - fy1_weight)
}

pub fn ttm_pe(price: f64, ttm_eps: f64, min_ttm_eps: f64) -> Option<f64> {
    (ttm_eps > min_ttm_eps).then(|| price / ttm_eps)
}

pub fn forward_pe(price: f64, ntm_eps: f64, min_ntm_eps: f64) -> Option<f64> {
    (ntm_eps > min_ntm_eps).then(|| price / ntm_eps)
}

pub fn fy2_pe(price: f64, fy2_eps: f64) -> Option<f64> {
    (fy2_eps > 0.0).then(|| price / fy2_eps)
}

/// NTM EPS over TTM EPS; above 1 means earnings are expected to accelerate.
pub fn gap_ratio(ntm_eps: f64, ttm_eps: f64, t: &Thresholds) -> Option<f64> {
    (ttm_eps > t.min_ttm_eps && ntm_eps > t.min_ntm_eps).then(|| ntm_eps / ttm_eps)
}

pub fn delta_pe(ttm_pe: Option<f64>, forward_pe: Option<f64>) -> Option<f64> {
    Some(ttm_pe? - forward_pe?)
}

/// Percent growth from TTM to NTM EPS.
pub fn eps_growth_rate(ntm_eps: f64, ttm_eps: f64) -> Option<f64> {
    (ttm_eps > 0.0).then(|| (ntm_eps - ttm_eps) / ttm_eps * 100.0)
}

/// Percent growth from FY1 to FY2 EPS.
pub fn forward_eps_growth(fy1_eps: f64, fy2_eps: f64) -> Option<f64> {
    (fy1_eps > 0.0).then(|| (fy2_eps - fy1_eps) / fy1_eps * 100.0)
}

pub fn peg(pe: Option<f64>, growth_rate: Option<f64>, min_growth_rate: f64) -> Option<f64> {
    let pe = pe?;
    let growth = growth_rate.filter(|g| *g > min_growth_rate)?;
    Some(pe / growth)
}

/// Gap ratio scaled by PEG improvement (`current / forward`). Unclamped.
pub fn grip_score(
    gap_ratio: Option<f64>,
    current_peg: Option<f64>,
    forward_peg: Option<f64>,
) -> Option<f64> {
    let gap = gap_ratio?;
    match (current_peg, forward_peg) {
        (Some(current), Some(forward)) if forward > 0.0 => Some(gap * (current / forward)),
        _ => Some(gap),
    }
}

// ── GRIP status decision table ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GripSignals {
    pub high_growth_now: bool,
    pub high_growth_ahead: bool,
    pub strong_gap: bool,
    pub min_gap: bool,
}

impl GripSignals {
    pub fn new(gap_ratio: f64, current_peg: Option<f64>, forward_peg: Option<f64>, t: &Thresholds) -> Self {
        Self {
            high_growth_now: current_peg.is_some_and(|p| p < t.peg_high_growth),
            high_growth_ahead: forward_peg.is_some_and(|p| p < t.peg_high_growth),
            strong_gap: gap_ratio >= t.gap_ratio_strong,
            min_gap: gap_ratio >= t.gap_ratio_min,
        }
    }
}

fn already_rerated(s: &GripSignals) -> bool {
    s.high_growth_now && s.strong_gap
}

fn rerating_ahead(s: &GripSignals) -> bool {
    !s.high_growth_now && s.high_growth_ahead && s.min_gap
}

fn gap_only(s: &GripSignals) -> bool {
    s.min_gap
}

/// Evaluated top to bottom; first match wins.
pub const GRIP_STATUS_RULES: &[(fn(&GripSignals) -> bool, GripStatus)] = &[
    (already_rerated, GripStatus::High),
    (rerating_ahead, GripStatus::Potential),
    (gap_only, GripStatus::Watch),
];

pub fn grip_status(
    gap_ratio: Option<f64>,
    current_peg: Option<f64>,
    forward_peg: Option<f64>,
    t: &Thresholds,
) -> GripStatus {
    let Some(gap) = gap_ratio else {
        return GripStatus::None;
    };
    let signals = GripSignals::new(gap, current_peg, forward_peg, t);

    GRIP_STATUS_RULES
        .iter()
        .find(|(rule, _)| rule(&signals))
        .map(|(_, status)| *status)
        .unwrap_or(GripStatus::None)
}

// ── Turnaround ───────────────────────────────────────────────────────────────

/// Projected profit relative to the current loss. Only for loss-makers with a
/// positive FY2 estimate.
pub fn turnaround_ratio(ttm_eps: f64, fy2_eps: f64) -> Option<f64> {
    (ttm_eps < 0.0 && fy2_eps > 0.0).then(|| fy2_eps / ttm_eps.abs())
}

/// EPS improvement from TTM to NTM, only when it is an improvement.
pub fn turnaround_delta(ttm_eps: f64, ntm_eps: f64) -> Option<f64> {
    (ntm_eps > ttm_eps).then(|| ntm_eps - ttm_eps)
}

/// Revenue growth plus gross margin, both in percent.
pub fn rule_of_40(revenue_growth_yoy: Option<f64>, gross_margin: Option<f64>) -> Option<f64> {
    Some(revenue_growth_yoy? * 100.0 + gross_margin? * 100.0)
}

// ── EPS quality ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct EpsQuality {
    pub is_quality_growth: bool,
    pub warnings: Vec<String>,
}

/// Flags one-off earnings spikes: FY2 not above FY1, or EPS growth more than
/// twice revenue growth. `revenue_growth_yoy` is a fraction.
pub fn eps_quality(
    eps_growth_rate: Option<f64>,
    revenue_growth_yoy: Option<f64>,
    fy1_eps: f64,
    fy2_eps: f64,
) -> EpsQuality {
    let mut warnings = Vec::new();

    if fy2_eps <= fy1_eps {
        warnings.push("FY2 EPS not above FY1 (growth slowing)".to_string());
    }

    if let (Some(eps_growth), Some(rev_growth)) = (eps_growth_rate, revenue_growth_yoy) {
        if eps_growth > rev_growth * 100.0 * 2.0 {
            warnings.push("EPS growth above twice revenue growth (possible one-off)".to_string());
        }
    }

    EpsQuality {
        is_quality_growth: warnings.is_empty(),
        warnings,
    }
}

// ── Bundle ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CalculatedMetrics {
    pub ntm_eps: f64,
    pub ttm_pe: Option<f64>,
    pub forward_pe: Option<f64>,
    pub fy2_pe: Option<f64>,
    pub gap_ratio: Option<f64>,
    pub delta_pe: Option<f64>,
    pub eps_growth_rate: Option<f64>,
    pub forward_eps_growth: Option<f64>,
    pub peg: Option<f64>,
    pub forward_peg: Option<f64>,
    pub grip_raw: Option<f64>,
    pub grip_status: GripStatus,
    pub turnaround_ratio: Option<f64>,
    pub turnaround_delta: Option<f64>,
}

pub fn calculate_all(
    price: f64,
    ttm_eps: f64,
    fy1_eps: f64,
    fy2_eps: f64,
    months_remaining: u32,
    t: &Thresholds,
) -> CalculatedMetrics {
    let ntm = ntm_eps(fy1_eps, fy2_eps, months_remaining);
    let ttm_pe = ttm_pe(price, ttm_eps, t.min_ttm_eps);
    let forward_pe = forward_pe(price, ntm, t.min_ntm_eps);
    let gap_ratio = gap_ratio(ntm, ttm_eps, t);

    let eps_growth_rate = eps_growth_rate(ntm, ttm_eps);
    let forward_eps_growth = forward_eps_growth(fy1_eps, fy2_eps);
    let peg = peg(ttm_pe, eps_growth_rate, t.min_growth_rate);
    let forward_peg = self::peg(forward_pe, forward_eps_growth, t.min_growth_rate);

    CalculatedMetrics {
        ntm_eps: ntm,
        ttm_pe,
        forward_pe,
        fy2_pe: fy2_pe(price, fy2_eps),
        gap_ratio,
        delta_pe: delta_pe(ttm_pe, forward_pe),
        eps_growth_rate,
        forward_eps_growth,
        peg,
        forward_peg,
        grip_raw: grip_score(gap_ratio, peg, forward_peg),
        grip_status: grip_status(gap_ratio, peg, forward_peg, t),
        turnaround_ratio: turnaround_ratio(ttm_eps, fy2_eps),
        turnaround_delta: turnaround_delta(ttm_eps, ntm),
    }
}
