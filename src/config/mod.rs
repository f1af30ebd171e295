use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub thresholds: Thresholds,
    pub benchmark: BenchmarkConfig,
    pub output: OutputConfig,
}

/// Financial data provider (FMP) configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Falls back to the `FMP_API_KEY` environment variable.
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Minimum spacing between two provider calls.
    pub min_interval_ms: u64,
    pub max_retries: usize,
    pub retry_base_ms: u64,
    pub user_agent: String,
    pub quarters_limit: u32,
    pub annual_limit: u32,
    pub estimates_limit: u32,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub run_migrations: bool,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub time_budget_secs: u64,
    /// `index:<name>`, `exchange:<name>` or `csv:<path>`
    pub universe: String,
    pub bulk_quotes: bool,
}

/// Named thresholds used by the metrics calculator and the screener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub min_ttm_eps: f64,
    pub min_ntm_eps: f64,
    /// Percent; PEG is undefined at or below this growth rate.
    pub min_growth_rate: f64,
    pub min_forward_pe: f64,
    pub max_forward_pe: f64,
    pub peg_high_growth: f64,
    pub gap_ratio_min: f64,
    pub gap_ratio_strong: f64,
    pub quality_min_score: f64,
    pub turnaround_min_score: f64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkMode {
    /// Average EPS growth of the top-N passing names by market cap.
    Dynamic,
    /// `fixed_growth_rate` from configuration.
    Fixed,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub mode: BenchmarkMode,
    pub top_n: usize,
    pub fixed_growth_rate: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    pub ranking_count: usize,
    pub decimals: usize,
    pub cache_ttl_hours: u64,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://financialmodelingprep.com/stable/".to_string(),
            api_key: None,
            timeout_secs: 30,
            min_interval_ms: 1100,
            max_retries: 3,
            retry_base_ms: 1000,
            user_agent: "grip-tracker/0.1".to_string(),
            quarters_limit: 8,
            annual_limit: 4,
            estimates_limit: 5,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/grip.duckdb"),
            run_migrations: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 30,
            time_budget_secs: 280,
            universe: "index:nasdaq".to_string(),
            bulk_quotes: true,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_ttm_eps: 0.01,
            min_ntm_eps: 0.01,
            min_growth_rate: 5.0,
            min_forward_pe: 1.0,
            max_forward_pe: 300.0,
            peg_high_growth: 1.5,
            gap_ratio_min: 1.2,
            gap_ratio_strong: 1.3,
            quality_min_score: 0.1,
            turnaround_min_score: 0.1,
        }
    }
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            mode: BenchmarkMode::Dynamic,
            top_n: 10,
            fixed_growth_rate: 22.7,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            ranking_count: 50,
            decimals: 2,
            cache_ttl_hours: 24,
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("GRIP").separator("__"))
            .build()
            .context("Failed to read configuration sources")?;

        let mut app_cfg: AppConfig = cfg
            .try_deserialize()
            .context("Invalid configuration")?;

        if app_cfg.provider.api_key.is_none() {
            app_cfg.provider.api_key = std::env::var("FMP_API_KEY").ok().filter(|k| !k.is_empty());
        }

        Ok(app_cfg)
    }
}

impl ProviderConfig {
    /// The API key, or `None` when neither config nor environment supplies one.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[pipeline]\nbatch_size = 12\n\n[benchmark]\nmode = \"fixed\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.pipeline.batch_size, 12);
        assert_eq!(cfg.pipeline.time_budget_secs, 280);
        assert_eq!(cfg.benchmark.mode, BenchmarkMode::Fixed);
        assert_eq!(cfg.thresholds, Thresholds::default());
    }

    #[test]
    fn test_blank_api_key_is_missing() {
        let mut provider = ProviderConfig::default();
        assert!(provider.api_key().is_none());
        provider.api_key = Some("  ".into());
        assert!(provider.api_key().is_none());
        provider.api_key = Some("abc".into());
        assert_eq!(provider.api_key(), Some("abc"));
    }
}
