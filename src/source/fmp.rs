//! Financial Modeling Prep "stable" API client.

use super::{FinancialDataSource, Period, RateLimiter, SourceError};
use crate::config::ProviderConfig;
use crate::models::{
    AnalystEstimate, BalanceSheet, CashFlowStatement, CompanyProfile, IncomeStatement, Quote,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{debug, warn};
use url::Url;

/// Symbols per batch-quote request.
const QUOTE_CHUNK: usize = 100;
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const INDEXES: [&str; 3] = ["nasdaq", "sp500", "dowjones"];

pub struct FmpClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    limiter: Arc<RateLimiter>,
    max_retries: usize,
    retry_base_ms: u64,
}

#[derive(Deserialize)]
struct SymbolRow {
    symbol: String,
}

impl FmpClient {
    pub fn new(config: &ProviderConfig, api_key: &str) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .build()?;

        // `Url::join` drops the last segment unless the base ends in '/'
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }

        Ok(Self {
            http,
            base_url: Url::parse(&base)?,
            api_key: api_key.to_string(),
            limiter: Arc::new(RateLimiter::new(Duration::from_millis(config.min_interval_ms))),
            max_retries: config.max_retries,
            retry_base_ms: config.retry_base_ms,
        })
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, SourceError> {
        let mut url = self.base_url.join(path)?;
        url.query_pairs_mut()
            .extend_pairs(params)
            .append_pair("apikey", &self.api_key);
        Ok(url)
    }

    /// One throttled GET. Every attempt, retries included, passes the limiter.
    async fn fetch_once(&self, path: &str, url: Url) -> Result<String, SourceError> {
        debug!("GET {}", path);
        let resp = self.limiter.execute(|| self.http.get(url).send()).await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
        Ok(resp.text().await?)
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<T>, SourceError> {
        let url = self.endpoint(path, params)?;
        let strategy = ExponentialBackoff::from_millis(2)
            .factor((self.retry_base_ms / 2).max(1))
            .max_delay(MAX_BACKOFF)
            .map(jitter)
            .take(self.max_retries);

        let body = RetryIf::spawn(
            strategy,
            || self.fetch_once(path, url.clone()),
            |e: &SourceError| {
                let retry = e.is_transient();
                if retry {
                    warn!("{}: {} (retrying)", path, e);
                }
                retry
            },
        )
        .await?;

        decode_payload(path, &body)
    }
}

/// Scale a backoff delay to a random 50–100% of itself.
fn jitter(delay: Duration) -> Duration {
    delay.mul_f64(0.5 + rand::random::<f64>() * 0.5)
}

/// FMP answers with a JSON array on success. Errors (invalid key, plan
/// limits) arrive as a 200 with an `{"Error Message": ..}` object, and an
/// empty object means "nothing for this symbol".
fn decode_payload<T: DeserializeOwned>(path: &str, body: &str) -> Result<Vec<T>, SourceError> {
    let decode_err = |source| SourceError::Decode {
        path: path.to_string(),
        source,
    };
    let value: serde_json::Value = serde_json::from_str(body).map_err(decode_err)?;

    if let Some(message) = value.get("Error Message").and_then(|m| m.as_str()) {
        return Err(if message.contains("Limit Reach") {
            SourceError::RateLimited(message.to_string())
        } else {
            SourceError::Provider(message.to_string())
        });
    }

    match value {
        serde_json::Value::Array(_) => serde_json::from_value(value).map_err(decode_err),
        _ => Ok(Vec::new()),
    }
}

fn first<T>(rows: Vec<T>) -> Option<T> {
    rows.into_iter().next()
}

#[async_trait]
impl FinancialDataSource for FmpClient {
    async fn get_quote(&self, symbol: &str) -> Result<Option<Quote>, SourceError> {
        Ok(first(self.get_list("quote", &[("symbol", symbol)]).await?))
    }

    async fn get_quotes(&self, symbols: &[String]) -> Result<Vec<Quote>, SourceError> {
        let mut quotes = Vec::with_capacity(symbols.len());
        for chunk in symbols.chunks(QUOTE_CHUNK) {
            let joined = chunk.join(",");
            quotes.extend(self.get_list::<Quote>("batch-quote", &[("symbols", joined.as_str())]).await?);
        }
        Ok(quotes)
    }

    async fn get_profile(&self, symbol: &str) -> Result<Option<CompanyProfile>, SourceError> {
        Ok(first(self.get_list("profile", &[("symbol", symbol)]).await?))
    }

    async fn get_income_statements(
        &self,
        symbol: &str,
        period: Period,
        limit: u32,
    ) -> Result<Vec<IncomeStatement>, SourceError> {
        let limit = limit.to_string();
        self.get_list(
            "income-statement",
            &[("symbol", symbol), ("period", period.as_str()), ("limit", limit.as_str())],
        )
        .await
    }

    async fn get_balance_sheet(
        &self,
        symbol: &str,
        period: Period,
        limit: u32,
    ) -> Result<Vec<BalanceSheet>, SourceError> {
        let limit = limit.to_string();
        self.get_list(
            "balance-sheet-statement",
            &[("symbol", symbol), ("period", period.as_str()), ("limit", limit.as_str())],
        )
        .await
    }

    async fn get_cash_flow(
        &self,
        symbol: &str,
        period: Period,
        limit: u32,
    ) -> Result<Vec<CashFlowStatement>, SourceError> {
        let limit = limit.to_string();
        self.get_list(
            "cash-flow-statement",
            &[("symbol", symbol), ("period", period.as_str()), ("limit", limit.as_str())],
        )
        .await
    }

    async fn get_analyst_estimates(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<AnalystEstimate>, SourceError> {
        let limit = limit.to_string();
        self.get_list(
            "analyst-estimates",
            &[("symbol", symbol), ("period", "annual"), ("limit", limit.as_str())],
        )
        .await
    }

    async fn get_universe_constituents(
        &self,
        index_or_exchange: &str,
    ) -> Result<Vec<String>, SourceError> {
        let name = index_or_exchange.trim().to_lowercase();
        let rows: Vec<SymbolRow> = if INDEXES.contains(&name.as_str()) {
            self.get_list(&format!("{name}-constituent"), &[]).await?
        } else {
            let exchange = name.to_uppercase();
            self.get_list(
                "company-screener",
                &[
                    ("exchange", exchange.as_str()),
                    ("isEtf", "false"),
                    ("isFund", "false"),
                    ("isActivelyTrading", "true"),
                    ("limit", "10000"),
                ],
            )
            .await?
        };
        Ok(rows.into_iter().map(|r| r.symbol).collect())
    }
}
