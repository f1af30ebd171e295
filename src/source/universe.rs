//! Universe resolution: which symbols a cycle walks over.

use super::{FinancialDataSource, SourceError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("universe lookup failed: {0}")]
    Source(#[from] SourceError),

    #[error("could not read universe file {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("invalid universe `{0}` (expected index:<name>, exchange:<name> or csv:<path>)")]
    InvalidSpec(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniverseSpec {
    Index(String),
    Exchange(String),
    Csv(PathBuf),
}

impl FromStr for UniverseSpec {
    type Err = UniverseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UniverseError::InvalidSpec(s.to_string());
        let (kind, value) = s.split_once(':').ok_or_else(invalid)?;
        let value = value.trim();
        if value.is_empty() {
            return Err(invalid());
        }
        match kind.trim().to_lowercase().as_str() {
            "index" => Ok(UniverseSpec::Index(value.to_lowercase())),
            "exchange" => Ok(UniverseSpec::Exchange(value.to_uppercase())),
            "csv" => Ok(UniverseSpec::Csv(PathBuf::from(value))),
            _ => Err(invalid()),
        }
    }
}

#[async_trait]
pub trait UniverseProvider: Send + Sync {
    /// Normalized symbol list, in provider order.
    async fn resolve(&self) -> Result<Vec<String>, UniverseError>;
}

pub fn provider_for(spec: &UniverseSpec, source: Arc<dyn FinancialDataSource>) -> Box<dyn UniverseProvider> {
    match spec {
        UniverseSpec::Index(name) | UniverseSpec::Exchange(name) => {
            Box::new(ProviderUniverse::new(source, name.clone()))
        }
        UniverseSpec::Csv(path) => Box::new(CsvUniverse::new(path.clone())),
    }
}

// ── Normalization ─────────────────────────────────────────────────────────────

/// Plain common-stock tickers only: 1–5 ASCII letters. Share classes like
/// `BRK.B` and anything carrying digits are dropped.
pub fn is_common_ticker(symbol: &str) -> bool {
    (1..=5).contains(&symbol.len()) && symbol.chars().all(|c| c.is_ascii_uppercase())
}

/// Trim, uppercase, keep common tickers, de-duplicate preserving first order.
pub fn normalize_universe(symbols: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    symbols
        .into_iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| is_common_ticker(s))
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

// ── Provider-backed ───────────────────────────────────────────────────────────

pub struct ProviderUniverse {
    source: Arc<dyn FinancialDataSource>,
    name: String,
}

impl ProviderUniverse {
    pub fn new(source: Arc<dyn FinancialDataSource>, name: impl Into<String>) -> Self {
        Self { source, name: name.into() }
    }
}

#[async_trait]
impl UniverseProvider for ProviderUniverse {
    async fn resolve(&self) -> Result<Vec<String>, UniverseError> {
        let raw = self.source.get_universe_constituents(&self.name).await?;
        let total = raw.len();
        let symbols = normalize_universe(raw);
        info!("Universe {}: {} symbols ({} dropped)", self.name, symbols.len(), total - symbols.len());
        Ok(symbols)
    }
}

// ── CSV file ──────────────────────────────────────────────────────────────────

/// A CSV with a `symbol` or `ticker` column (else the first column).
pub struct CsvUniverse {
    path: PathBuf,
}

impl CsvUniverse {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

pub fn load_symbols_csv(path: &Path) -> Result<Vec<String>, UniverseError> {
    let wrap = |source| UniverseError::Csv { path: path.to_path_buf(), source };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(wrap)?;

    let column = reader
        .headers()
        .map_err(wrap)?
        .iter()
        .position(|h| h.eq_ignore_ascii_case("symbol") || h.eq_ignore_ascii_case("ticker"))
        .unwrap_or(0);
    debug!("Reading symbols from column {} of {:?}", column, path);

    let mut symbols = Vec::new();
    for (i, result) in reader.records().enumerate() {
        match result {
            Ok(record) => {
                if let Some(symbol) = record.get(column) {
                    symbols.push(symbol.to_string());
                }
            }
            Err(e) => warn!("Row {} in {:?}: {}", i + 1, path, e),
        }
    }
    Ok(normalize_universe(symbols))
}

#[async_trait]
impl UniverseProvider for CsvUniverse {
    async fn resolve(&self) -> Result<Vec<String>, UniverseError> {
        let symbols = load_symbols_csv(&self.path)?;
        info!("Universe {:?}: {} symbols", self.path, symbols.len());
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_spec() {
        assert_eq!("index:NASDAQ".parse::<UniverseSpec>().unwrap(), UniverseSpec::Index("nasdaq".into()));
        assert_eq!("exchange:nyse".parse::<UniverseSpec>().unwrap(), UniverseSpec::Exchange("NYSE".into()));
        assert_eq!(
            "csv:data/universe.csv".parse::<UniverseSpec>().unwrap(),
            UniverseSpec::Csv(PathBuf::from("data/universe.csv"))
        );
        assert!("nasdaq".parse::<UniverseSpec>().is_err());
        assert!("index:".parse::<UniverseSpec>().is_err());
        assert!("sector:tech".parse::<UniverseSpec>().is_err());
    }

    #[test]
    fn test_normalize_universe() {
        let raw = ["aapl", " MSFT ", "AAPL", "BRK.B", "ABCDEF", "", "GOOG1", "nvda"]
            .into_iter()
            .map(String::from);
        assert_eq!(normalize_universe(raw), ["AAPL", "MSFT", "NVDA"]);
    }

    #[test]
    fn test_csv_universe_uses_symbol_column() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name,Symbol,sector").unwrap();
        writeln!(file, "Apple,aapl,Tech").unwrap();
        writeln!(file, "Microsoft, MSFT ,Tech").unwrap();
        writeln!(file, "Dup,AAPL").unwrap();
        writeln!(file, "Warrant,ACAH.WS,Finance").unwrap();

        let universe = CsvUniverse::new(file.path().to_path_buf());
        let symbols = tokio_test::block_on(universe.resolve()).unwrap();
        assert_eq!(symbols, ["AAPL", "MSFT"]);
    }

    #[test]
    fn test_csv_universe_missing_file() {
        let universe = CsvUniverse::new(PathBuf::from("/nonexistent/universe.csv"));
        let err = tokio_test::block_on(universe.resolve()).unwrap_err();
        assert!(matches!(err, UniverseError::Csv { .. }));
    }
}
