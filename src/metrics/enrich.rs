//! RawFinancials → EnrichedStock.

use super::{calculate_all, eps_quality, months_remaining, rule_of_40};
use crate::config::Thresholds;
use crate::models::{
    AnalystEstimate, EnrichedStock, Exclusion, HistoryPoint, IncomeStatement, RawFinancials, Stage,
};
use chrono::{DateTime, Datelike, Utc};

const TTM_QUARTERS: usize = 4;

/// Derive the enriched record for one symbol.
///
/// `as_of` drives both the fiscal calendar and the embedded timestamp, so the
/// result is a pure function of its inputs. Missing data is an [`Exclusion`]
/// at [`Stage::Enrichment`], not an error.
pub fn calculate_metrics_from_raw(
    raw: &RawFinancials,
    thresholds: &Thresholds,
    as_of: DateTime<Utc>,
) -> Result<EnrichedStock, Exclusion> {
    let ticker = raw.symbol.trim().to_uppercase();
    let exclude = |reason: &str| Exclusion::new(&ticker, Stage::Enrichment, reason);

    let quote = raw.quote.as_ref().ok_or_else(|| exclude("no quote data"))?;

    let quarters = newest_first(&raw.income_quarterly);
    if quarters.is_empty() {
        return Err(exclude("no quarterly income statements"));
    }
    let annuals = newest_first(&raw.income_annual);
    let recent = &quarters[..quarters.len().min(TTM_QUARTERS)];

    // ── Trailing aggregates ───────────────────────────────────────────────────
    let revenue: f64 = recent.iter().map(|q| q.revenue).sum();
    let gross_profit: f64 = recent.iter().map(|q| q.gross_profit).sum();
    let operating_income: f64 = recent.iter().map(|q| q.operating_income).sum();
    let net_income: f64 = recent.iter().map(|q| q.net_income).sum();
    let ttm_eps: f64 = recent.iter().map(IncomeStatement::eps_value).sum();

    let margin = |x: f64| (revenue > 0.0).then(|| x / revenue);
    let gross_margin = margin(gross_profit);
    let operating_margin = margin(operating_income);
    let net_margin = margin(net_income);

    let revenue_growth_yoy = match annuals.as_slice() {
        [current, previous, ..] if previous.revenue > 0.0 => {
            Some(current.revenue / previous.revenue - 1.0)
        }
        _ => None,
    };
    let cagr_3y = revenue_cagr(&annuals);

    // ── Forward estimates ────────────────────────────────────────────────────
    let fiscal_year_end_month = annuals.first().map(|s| s.date.month()).unwrap_or(12);
    let (fy1_eps, fy2_eps, estimates_synthesized) =
        match forward_estimates(&raw.estimates, as_of.year()) {
            Some((fy1, fy2)) => (fy1, fy2, false),
            None => {
                let g = annual_eps_cagr(&annuals).unwrap_or(0.0) / 100.0;
                let fy1 = ttm_eps * (1.0 + g);
                (fy1, fy1 * (1.0 + g), true)
            }
        };

    let months = months_remaining(fiscal_year_end_month, as_of.date_naive());
    let price = quote.price;
    let m = calculate_all(price, ttm_eps, fy1_eps, fy2_eps, months, thresholds);

    // ── Balance sheet & cash flow ────────────────────────────────────────────
    let profile = raw.profile.as_ref();
    let market_cap = if quote.market_cap > 0.0 {
        quote.market_cap
    } else {
        profile.map(|p| p.market_cap).unwrap_or(0.0)
    };

    let (cash, debt) = raw
        .balance_sheet
        .as_ref()
        .map(|b| (b.cash_and_cash_equivalents + b.short_term_investments, b.total_debt))
        .unwrap_or((0.0, 0.0));
    let enterprise_value = market_cap + debt - cash;

    let mut cash_flows = raw.cash_flow_quarterly.clone();
    cash_flows.sort_by(|a, b| b.date.cmp(&a.date));
    let free_cash_flow: f64 = cash_flows
        .iter()
        .take(TTM_QUARTERS)
        .map(|c| c.free_cash_flow)
        .sum();
    let burn_rate = (free_cash_flow < 0.0).then(|| free_cash_flow.abs() / 12.0);

    let latest_net_income = quarters[0].net_income;
    let cash_runway_quarters = (latest_net_income < 0.0).then(|| cash / latest_net_income.abs());

    let quality = eps_quality(m.eps_growth_rate, revenue_growth_yoy, fy1_eps, fy2_eps);

    // ── History, oldest → newest ─────────────────────────────────────────────
    let eps_history = history(quarters.iter().rev().map(|q| (q.date, q.eps_value())));
    let revenue_history = history(quarters.iter().rev().map(|q| (q.date, q.revenue)));
    let fcf_history = history(cash_flows.iter().rev().map(|c| (c.date, c.free_cash_flow)));

    let text = |value: Option<&String>| value.cloned().unwrap_or_else(|| "Unknown".to_string());

    Ok(EnrichedStock {
        name: quote
            .name
            .clone()
            .or_else(|| profile.and_then(|p| p.company_name.clone()))
            .unwrap_or_else(|| ticker.clone()),
        sector: text(profile.and_then(|p| p.sector.as_ref())),
        industry: text(profile.and_then(|p| p.industry.as_ref())),
        exchange: text(quote.exchange.as_ref().or(profile.and_then(|p| p.exchange.as_ref()))),
        ticker,

        price,
        market_cap,
        beta: quote.beta.or(profile.and_then(|p| p.beta)),
        volume: quote.volume,
        avg_volume: quote.avg_volume,
        is_fund: profile.is_some_and(|p| p.is_fund_like()),

        revenue,
        net_income,
        gross_margin,
        operating_margin,
        net_margin,
        ttm_eps,

        fy1_eps,
        fy2_eps,
        ntm_eps: m.ntm_eps,
        estimates_synthesized,

        ttm_pe: m.ttm_pe,
        forward_pe: m.forward_pe,
        fy2_pe: m.fy2_pe,
        delta_pe: m.delta_pe,
        psr: (revenue > 0.0).then(|| market_cap / revenue),
        ev_revenue: (revenue > 0.0).then(|| enterprise_value / revenue),
        ev_gross_profit: (gross_profit > 0.0).then(|| enterprise_value / gross_profit),

        revenue_growth_yoy,
        eps_growth_rate: m.eps_growth_rate,
        forward_eps_growth: m.forward_eps_growth,
        cagr_3y,
        rule_of_40: rule_of_40(revenue_growth_yoy, gross_margin),

        cash_and_short_term_investments: cash,
        burn_rate,
        cash_runway_quarters,
        free_cash_flow,

        gap_ratio: m.gap_ratio,
        peg: m.peg,
        forward_peg: m.forward_peg,
        grip_raw: m.grip_raw,
        grip_status: m.grip_status,
        turnaround_ratio: m.turnaround_ratio,
        turnaround_delta: m.turnaround_delta,

        peg_score: None,
        gap_score: None,
        grip_score: None,
        t_grip_score: None,

        // provisional; the screener replaces both with score-gated flags
        is_quality: ttm_eps > 0.0 && m.ntm_eps > 0.0,
        is_turnaround: ttm_eps <= 0.0 && m.ntm_eps > 0.0,
        is_quality_growth: quality.is_quality_growth,
        eps_warnings: quality.warnings,

        eps_history,
        revenue_history,
        fcf_history,

        fiscal_year_end_month,
        last_updated: as_of,
    })
}

fn newest_first(rows: &[IncomeStatement]) -> Vec<IncomeStatement> {
    let mut rows = rows.to_vec();
    rows.sort_by(|a, b| b.date.cmp(&a.date));
    rows
}

fn history(points: impl Iterator<Item = (chrono::NaiveDate, f64)>) -> Vec<HistoryPoint> {
    points.map(|(date, value)| HistoryPoint { date, value }).collect()
}

/// FY1 and FY2 consensus EPS: the first two estimates dated this year or later.
fn forward_estimates(estimates: &[AnalystEstimate], current_year: i32) -> Option<(f64, f64)> {
    let mut future: Vec<&AnalystEstimate> = estimates
        .iter()
        .filter(|e| e.date.year() >= current_year && e.eps_avg.is_some())
        .collect();
    future.sort_by_key(|e| e.date);

    match future.as_slice() {
        [fy1, fy2, ..] => Some((fy1.eps_avg?, fy2.eps_avg?)),
        _ => None,
    }
}

/// Revenue CAGR in percent over up to three years (needs two annual reports).
fn revenue_cagr(annuals: &[IncomeStatement]) -> Option<f64> {
    if annuals.len() < 2 {
        return None;
    }
    let years = (annuals.len() - 1).min(3);
    let current = annuals[0].revenue;
    let oldest = annuals[years].revenue;
    (current > 0.0 && oldest > 0.0)
        .then(|| ((current / oldest).powf(1.0 / years as f64) - 1.0) * 100.0)
}

/// Three-year EPS CAGR in percent, floored at zero. Needs four annual reports.
fn annual_eps_cagr(annuals: &[IncomeStatement]) -> Option<f64> {
    if annuals.len() < 4 {
        return None;
    }
    let current = annuals[0].eps_value();
    let oldest = annuals[3].eps_value();
    (current > 0.0 && oldest > 0.0)
        .then(|| (((current / oldest).powf(1.0 / 3.0) - 1.0) * 100.0).max(0.0))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{BalanceSheet, CashFlowStatement, CompanyProfile, GripStatus, Quote};
    use chrono::{NaiveDate, TimeZone};

    pub(crate) fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn quarter(date: NaiveDate, revenue: f64, net_income: f64, eps: f64) -> IncomeStatement {
        IncomeStatement {
            date,
            period: Some("Q".into()),
            revenue,
            gross_profit: revenue * 0.6,
            operating_income: revenue * 0.3,
            net_income,
            eps_diluted: Some(eps),
            ..Default::default()
        }
    }

    fn annual(year: i32, revenue: f64, eps: f64) -> IncomeStatement {
        IncomeStatement {
            date: d(year, 12, 31),
            period: Some("FY".into()),
            revenue,
            eps_diluted: Some(eps),
            ..Default::default()
        }
    }

    /// A profitable growth company: TTM EPS 4.0, FY1 5.0, FY2 6.0.
    pub(crate) fn fixture(symbol: &str) -> RawFinancials {
        RawFinancials {
            symbol: symbol.to_string(),
            quote: Some(Quote {
                symbol: symbol.to_string(),
                name: Some(format!("{symbol} Inc")),
                price: 100.0,
                market_cap: 10_000.0,
                exchange: Some("NASDAQ".into()),
                volume: 1_000.0,
                avg_volume: 1_200.0,
                beta: Some(1.1),
            }),
            profile: Some(CompanyProfile {
                symbol: symbol.to_string(),
                sector: Some("Technology".into()),
                industry: Some("Software".into()),
                ..Default::default()
            }),
            // deliberately unsorted
            income_quarterly: vec![
                quarter(d(2025, 9, 30), 250.0, 25.0, 1.0),
                quarter(d(2026, 3, 31), 300.0, 30.0, 1.0),
                quarter(d(2025, 6, 30), 240.0, 24.0, 1.0),
                quarter(d(2025, 12, 31), 260.0, 26.0, 1.0),
                quarter(d(2025, 3, 31), 200.0, 20.0, 0.5),
            ],
            income_annual: vec![
                annual(2025, 1_000.0, 3.5),
                annual(2024, 800.0, 3.0),
                annual(2023, 640.0, 2.5),
                annual(2022, 512.0, 2.0),
            ],
            balance_sheet: Some(BalanceSheet {
                date: d(2026, 3, 31),
                cash_and_cash_equivalents: 400.0,
                short_term_investments: 100.0,
                total_debt: 200.0,
            }),
            cash_flow_quarterly: vec![
                CashFlowStatement { date: d(2026, 3, 31), free_cash_flow: 40.0, ..Default::default() },
                CashFlowStatement { date: d(2025, 12, 31), free_cash_flow: 30.0, ..Default::default() },
            ],
            estimates: vec![
                AnalystEstimate { date: d(2027, 12, 31), eps_avg: Some(6.0), revenue_avg: None },
                AnalystEstimate { date: d(2026, 12, 31), eps_avg: Some(5.0), revenue_avg: None },
                AnalystEstimate { date: d(2024, 12, 31), eps_avg: Some(3.0), revenue_avg: None },
            ],
            last_updated: as_of(),
        }
    }

    #[test]
    fn test_enrich_profitable_growth() {
        let s = calculate_metrics_from_raw(&fixture("ACME"), &Thresholds::default(), as_of()).unwrap();

        assert_eq!(s.ticker, "ACME");
        assert_eq!(s.ttm_eps, 4.0);
        assert_eq!(s.revenue, 1_050.0);
        assert_eq!((s.fy1_eps, s.fy2_eps), (5.0, 6.0));
        assert!(!s.estimates_synthesized);
        // June, December year-end: 6 months left → 0.5 * 5 + 0.5 * 6
        assert_eq!(s.ntm_eps, 5.5);
        assert_eq!(s.fiscal_year_end_month, 12);
        assert_eq!(s.revenue_growth_yoy, Some(0.25));
        assert!((s.cagr_3y.unwrap() - 25.0).abs() < 1e-9);
        assert_eq!(s.cash_and_short_term_investments, 500.0);
        assert_eq!(s.free_cash_flow, 70.0);
        assert_eq!(s.burn_rate, None);
        assert_eq!(s.cash_runway_quarters, None);
        assert_eq!(s.ev_revenue, Some((10_000.0 + 200.0 - 500.0) / 1_050.0));
        assert!(s.is_quality);
        assert!(!s.is_turnaround);
        assert_ne!(s.grip_status, GripStatus::None);

        let dates: Vec<NaiveDate> = s.eps_history.iter().map(|p| p.date).collect();
        let mut sorted = dates.clone();
        sorted.sort();
        assert_eq!(dates, sorted);
        assert_eq!(s.eps_history.len(), 5);
    }

    #[test]
    fn test_enrich_is_deterministic() {
        let raw = fixture("ACME");
        let t = Thresholds::default();
        let a = calculate_metrics_from_raw(&raw, &t, as_of()).unwrap();
        let mut b = calculate_metrics_from_raw(&raw, &t, as_of()).unwrap();
        b.last_updated = a.last_updated;
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }

    #[test]
    fn test_enrich_requires_quarters_and_quote() {
        let mut raw = fixture("NOQ");
        raw.income_quarterly.clear();
        let err = calculate_metrics_from_raw(&raw, &Thresholds::default(), as_of()).unwrap_err();
        assert_eq!(err.stage, Stage::Enrichment);

        let mut raw = fixture("NOQUOTE");
        raw.quote = None;
        assert!(calculate_metrics_from_raw(&raw, &Thresholds::default(), as_of()).is_err());
    }

    #[test]
    fn test_missing_estimates_are_synthesized_from_eps_cagr() {
        let mut raw = fixture("SYN");
        raw.estimates.clear();
        let s = calculate_metrics_from_raw(&raw, &Thresholds::default(), as_of()).unwrap();

        // EPS 2.0 → 3.5 over three years
        let g = (3.5f64 / 2.0).powf(1.0 / 3.0) - 1.0;
        assert!(s.estimates_synthesized);
        assert!((s.fy1_eps - 4.0 * (1.0 + g)).abs() < 1e-9);
        assert!((s.fy2_eps - s.fy1_eps * (1.0 + g)).abs() < 1e-9);
    }

    #[test]
    fn test_loss_maker_liquidity() {
        let mut raw = fixture("BURN");
        for q in raw.income_quarterly.iter_mut() {
            q.net_income = -50.0;
            q.eps_diluted = Some(-0.5);
        }
        for c in raw.cash_flow_quarterly.iter_mut() {
            c.free_cash_flow = -60.0;
        }
        let s = calculate_metrics_from_raw(&raw, &Thresholds::default(), as_of()).unwrap();

        assert_eq!(s.ttm_eps, -2.0);
        assert_eq!(s.cash_runway_quarters, Some(10.0));
        assert_eq!(s.burn_rate, Some(10.0));
        assert_eq!(s.turnaround_ratio, Some(3.0));
        assert!(s.turnaround_delta.is_some());
        assert!(s.is_turnaround);
        assert!(!s.is_quality);
    }
}
