pub mod fmp;
pub mod rate_limiter;
pub mod universe;

use crate::models::{
    AnalystEstimate, BalanceSheet, CashFlowStatement, CompanyProfile, IncomeStatement, Quote,
};
use async_trait::async_trait;
use thiserror::Error;

pub use self::fmp::FmpClient;
pub use self::rate_limiter::RateLimiter;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {path}")]
    Status { status: u16, path: String },

    #[error("provider rate limit reached: {0}")]
    RateLimited(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("unexpected payload from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl SourceError {
    /// Worth another attempt after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SourceError::Status { status, .. } => *status == 429 || *status >= 500,
            SourceError::RateLimited(_) => true,
            SourceError::Provider(_) | SourceError::Decode { .. } | SourceError::Url(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Quarter,
    Annual,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Quarter => "quarter",
            Period::Annual => "annual",
        }
    }
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// Per-symbol fundamentals. `Ok(None)` / empty lists mean "no data", which
/// callers treat as an exclusion rather than a failure.
#[async_trait]
pub trait FinancialDataSource: Send + Sync {
    async fn get_quote(&self, symbol: &str) -> Result<Option<Quote>, SourceError>;

    /// Provider-native batch quote. Symbols the provider does not know are
    /// simply absent from the result.
    async fn get_quotes(&self, symbols: &[String]) -> Result<Vec<Quote>, SourceError>;

    async fn get_profile(&self, symbol: &str) -> Result<Option<CompanyProfile>, SourceError>;

    async fn get_income_statements(
        &self,
        symbol: &str,
        period: Period,
        limit: u32,
    ) -> Result<Vec<IncomeStatement>, SourceError>;

    async fn get_balance_sheet(
        &self,
        symbol: &str,
        period: Period,
        limit: u32,
    ) -> Result<Vec<BalanceSheet>, SourceError>;

    async fn get_cash_flow(
        &self,
        symbol: &str,
        period: Period,
        limit: u32,
    ) -> Result<Vec<CashFlowStatement>, SourceError>;

    async fn get_analyst_estimates(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<AnalystEstimate>, SourceError>;

    /// Constituents of an index (`nasdaq`, `sp500`, `dowjones`) or listings
    /// of an exchange, depending on the provider.
    async fn get_universe_constituents(&self, index_or_exchange: &str)
        -> Result<Vec<String>, SourceError>;
}
