use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Provider payloads sometimes carry explicit `null` for numeric fields.
fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

// ── Quote ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub symbol: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub price: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub market_cap: f64,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub volume: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub avg_volume: f64,
    #[serde(default)]
    pub beta: Option<f64>,
}

// ── Company profile ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompanyProfile {
    pub symbol: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default, alias = "exchangeShortName")]
    pub exchange: Option<String>,
    #[serde(default, alias = "mktCap", deserialize_with = "nullable")]
    pub market_cap: f64,
    #[serde(default)]
    pub beta: Option<f64>,
    #[serde(default, deserialize_with = "nullable")]
    pub is_fund: bool,
    #[serde(default, deserialize_with = "nullable")]
    pub is_etf: bool,
    /// Absent means the provider did not say; treated as trading.
    #[serde(default)]
    pub is_actively_trading: Option<bool>,
}

impl CompanyProfile {
    /// Funds, ETFs and delisted shells never enter either leaderboard.
    pub fn is_fund_like(&self) -> bool {
        self.is_fund || self.is_etf || self.is_actively_trading == Some(false)
    }
}

// ── Financial statements ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncomeStatement {
    pub date: NaiveDate,
    /// "Q1".."Q4" or "FY"
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub revenue: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub gross_profit: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub operating_income: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub net_income: f64,
    #[serde(default)]
    pub eps: Option<f64>,
    #[serde(default, alias = "epsdiluted")]
    pub eps_diluted: Option<f64>,
    #[serde(default)]
    pub weighted_average_shs_out_dil: Option<f64>,
}

impl IncomeStatement {
    /// Diluted EPS, then basic EPS, then net income over diluted shares.
    pub fn eps_value(&self) -> f64 {
        self.eps_diluted
            .or(self.eps)
            .or_else(|| {
                self.weighted_average_shs_out_dil
                    .filter(|shares| *shares > 0.0)
                    .map(|shares| self.net_income / shares)
            })
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSheet {
    pub date: NaiveDate,
    #[serde(default, deserialize_with = "nullable")]
    pub cash_and_cash_equivalents: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub short_term_investments: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub total_debt: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CashFlowStatement {
    pub date: NaiveDate,
    #[serde(default, deserialize_with = "nullable")]
    pub operating_cash_flow: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub capital_expenditure: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub free_cash_flow: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalystEstimate {
    pub date: NaiveDate,
    #[serde(default, alias = "estimatedEpsAvg")]
    pub eps_avg: Option<f64>,
    #[serde(default, alias = "estimatedRevenueAvg")]
    pub revenue_avg: Option<f64>,
}

// ── Raw financials (master store record) ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawFinancials {
    pub symbol: String,
    #[serde(default)]
    pub quote: Option<Quote>,
    #[serde(default)]
    pub profile: Option<CompanyProfile>,
    #[serde(default)]
    pub income_quarterly: Vec<IncomeStatement>,
    #[serde(default)]
    pub income_annual: Vec<IncomeStatement>,
    #[serde(default)]
    pub balance_sheet: Option<BalanceSheet>,
    #[serde(default)]
    pub cash_flow_quarterly: Vec<CashFlowStatement>,
    #[serde(default)]
    pub estimates: Vec<AnalystEstimate>,
    pub last_updated: DateTime<Utc>,
}

impl RawFinancials {
    pub fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.trim().to_uppercase(),
            quote: None,
            profile: None,
            income_quarterly: Vec::new(),
            income_annual: Vec::new(),
            balance_sheet: None,
            cash_flow_quarterly: Vec::new(),
            estimates: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Shallow merge: every section present in `patch` replaces the stored one.
    pub fn apply(&mut self, patch: RawFinancialsPatch) {
        if let Some(quote) = patch.quote {
            self.quote = Some(quote);
        }
        if let Some(profile) = patch.profile {
            self.profile = Some(profile);
        }
        if let Some(rows) = patch.income_quarterly {
            self.income_quarterly = rows;
        }
        if let Some(rows) = patch.income_annual {
            self.income_annual = rows;
        }
        if let Some(sheet) = patch.balance_sheet {
            self.balance_sheet = Some(sheet);
        }
        if let Some(rows) = patch.cash_flow_quarterly {
            self.cash_flow_quarterly = rows;
        }
        if let Some(rows) = patch.estimates {
            self.estimates = rows;
        }
    }
}

/// Partial update for a [`RawFinancials`] record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFinancialsPatch {
    pub quote: Option<Quote>,
    pub profile: Option<CompanyProfile>,
    pub income_quarterly: Option<Vec<IncomeStatement>>,
    pub income_annual: Option<Vec<IncomeStatement>>,
    pub balance_sheet: Option<BalanceSheet>,
    pub cash_flow_quarterly: Option<Vec<CashFlowStatement>>,
    pub estimates: Option<Vec<AnalystEstimate>>,
}

// ── Enriched stock ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GripStatus {
    High,
    Potential,
    Watch,
    #[default]
    None,
}

impl fmt::Display for GripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GripStatus::High => "high",
            GripStatus::Potential => "potential",
            GripStatus::Watch => "watch",
            GripStatus::None => "-",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryPoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// Per-cycle snapshot derived from [`RawFinancials`].
///
/// Units: margins and `revenue_growth_yoy` are fractions (0.25 = 25%);
/// `eps_growth_rate`, `forward_eps_growth` and `cagr_3y` are percentages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedStock {
    // identity
    pub ticker: String,
    pub name: String,
    pub sector: String,
    pub industry: String,
    pub exchange: String,

    // market facts
    pub price: f64,
    pub market_cap: f64,
    pub beta: Option<f64>,
    pub volume: f64,
    pub avg_volume: f64,
    pub is_fund: bool,

    // trailing financials
    pub revenue: f64,
    pub net_income: f64,
    pub gross_margin: Option<f64>,
    pub operating_margin: Option<f64>,
    pub net_margin: Option<f64>,
    pub ttm_eps: f64,

    // forward estimates
    pub fy1_eps: f64,
    pub fy2_eps: f64,
    pub ntm_eps: f64,
    pub estimates_synthesized: bool,

    // valuation
    pub ttm_pe: Option<f64>,
    pub forward_pe: Option<f64>,
    pub fy2_pe: Option<f64>,
    pub delta_pe: Option<f64>,
    pub psr: Option<f64>,
    pub ev_revenue: Option<f64>,
    pub ev_gross_profit: Option<f64>,

    // growth
    #[serde(rename = "revenueGrowthYoY")]
    pub revenue_growth_yoy: Option<f64>,
    pub eps_growth_rate: Option<f64>,
    pub forward_eps_growth: Option<f64>,
    #[serde(rename = "cagr3Y")]
    pub cagr_3y: Option<f64>,
    #[serde(rename = "ruleOf40")]
    pub rule_of_40: Option<f64>,

    // liquidity
    pub cash_and_short_term_investments: f64,
    pub burn_rate: Option<f64>,
    pub cash_runway_quarters: Option<f64>,
    pub free_cash_flow: f64,

    // GRIP metrics
    pub gap_ratio: Option<f64>,
    pub peg: Option<f64>,
    pub forward_peg: Option<f64>,
    pub grip_raw: Option<f64>,
    pub grip_status: GripStatus,
    pub turnaround_ratio: Option<f64>,
    pub turnaround_delta: Option<f64>,

    // composite scores (filled by the screener)
    pub peg_score: Option<f64>,
    pub gap_score: Option<f64>,
    pub grip_score: Option<f64>,
    pub t_grip_score: Option<f64>,

    // classification
    pub is_quality: bool,
    pub is_turnaround: bool,
    pub is_quality_growth: bool,
    pub eps_warnings: Vec<String>,

    // history, oldest → newest
    pub eps_history: Vec<HistoryPoint>,
    pub revenue_history: Vec<HistoryPoint>,
    pub fcf_history: Vec<HistoryPoint>,

    pub fiscal_year_end_month: u32,
    pub last_updated: DateTime<Utc>,
}

// ── Exclusions ────────────────────────────────────────────────────────────────

/// Pipeline stage at which a ticker dropped out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Enrichment,
    Eligibility,
    NegativeEps,
    ForwardPe,
    Benchmark,
    Fund,
    TurnaroundRule,
    Score,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Enrichment => "enrichment",
            Stage::Eligibility => "eligibility",
            Stage::NegativeEps => "negative-eps",
            Stage::ForwardPe => "forward-pe",
            Stage::Benchmark => "benchmark",
            Stage::Fund => "fund",
            Stage::TurnaroundRule => "turnaround-rule",
            Stage::Score => "score",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exclusion {
    pub ticker: String,
    pub stage: Stage,
    pub reason: String,
}

impl Exclusion {
    pub fn new(ticker: &str, stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            ticker: ticker.to_string(),
            stage,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} excluded at {}: {}", self.ticker, self.stage, self.reason)
    }
}

// ── Persisted documents ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingState {
    pub cycle_id: String,
    pub pending: Vec<String>,
    pub completed: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RankingCache {
    pub last_updated: Option<DateTime<Utc>>,
    pub stocks: Vec<EnrichedStock>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eps_value_fallbacks() {
        let mut stmt = IncomeStatement {
            net_income: 500.0,
            weighted_average_shs_out_dil: Some(100.0),
            ..Default::default()
        };
        assert_eq!(stmt.eps_value(), 5.0);

        stmt.eps = Some(4.0);
        assert_eq!(stmt.eps_value(), 4.0);

        stmt.eps_diluted = Some(3.5);
        assert_eq!(stmt.eps_value(), 3.5);
    }

    #[test]
    fn test_provider_nulls_and_aliases() {
        let json = r#"{
            "date": "2024-09-28", "period": "Q4", "revenue": null,
            "netIncome": 10.0, "epsdiluted": 1.25
        }"#;
        let stmt: IncomeStatement = serde_json::from_str(json).unwrap();
        assert_eq!(stmt.revenue, 0.0);
        assert_eq!(stmt.eps_diluted, Some(1.25));

        let est: AnalystEstimate =
            serde_json::from_str(r#"{"date":"2026-12-31","estimatedEpsAvg":2.5}"#).unwrap();
        assert_eq!(est.eps_avg, Some(2.5));
    }

    #[test]
    fn test_patch_is_shallow() {
        let mut raw = RawFinancials::empty(" aapl ");
        assert_eq!(raw.symbol, "AAPL");
        raw.apply(RawFinancialsPatch {
            quote: Some(Quote { symbol: "AAPL".into(), price: 10.0, ..Default::default() }),
            estimates: Some(vec![AnalystEstimate::default()]),
            ..Default::default()
        });
        raw.apply(RawFinancialsPatch {
            estimates: Some(vec![]),
            ..Default::default()
        });
        assert_eq!(raw.quote.as_ref().map(|q| q.price), Some(10.0));
        assert!(raw.estimates.is_empty());
    }

    #[test]
    fn test_profile_fund_like() {
        let mut p = CompanyProfile::default();
        assert!(!p.is_fund_like());
        p.is_actively_trading = Some(false);
        assert!(p.is_fund_like());
        p.is_actively_trading = None;
        p.is_etf = true;
        assert!(p.is_fund_like());
    }
}
