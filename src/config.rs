use serde::Deserialize;
use std::path::Path;

/// Pipeline tuning knobs loaded from `newsloom.toml`. Deployment settings
/// (API key, model, database path, schedule) come from the environment in
/// `main`; this file only carries thresholds and budgets.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NewsloomConfig {
    #[serde(default)]
    pub grouping: GroupingConfig,
    #[serde(default)]
    pub merging: MergingConfig,
    #[serde(default)]
    pub trending: TrendingConfig,
    #[serde(default)]
    pub enricher: EnricherConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupingConfig {
    /// Base similarity threshold before category and size adjustments.
    #[serde(default = "default_base_threshold")]
    pub base_threshold: f64,
    /// Consult the LLM for scores inside the ambiguity zone.
    #[serde(default = "default_true")]
    pub llm_arbitration: bool,
    /// Pause between articles to pace LLM traffic.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Run a consistency evaluation after each attach. One extra LLM call
    /// per attach, so off unless tuning group quality.
    #[serde(default)]
    pub consistency_checks: bool,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            base_threshold: default_base_threshold(),
            llm_arbitration: true,
            batch_delay_ms: default_batch_delay_ms(),
            consistency_checks: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergingConfig {
    #[serde(default = "default_merge_threshold")]
    pub threshold: f64,
}

impl Default for MergingConfig {
    fn default() -> Self {
        Self {
            threshold: default_merge_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrendingConfig {
    /// Sliding window for trend detection and expiry, in hours.
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
    /// Floor enforced after synthesis by promoting popular groups.
    #[serde(default = "default_min_trends")]
    pub min_trends: usize,
}

impl Default for TrendingConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            min_trends: default_min_trends(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnricherConfig {
    /// Approximate word-token budget per LLM extraction batch.
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// Re-fetch CVE metadata older than this many days.
    #[serde(default = "default_cve_refresh_days")]
    pub cve_refresh_days: i64,
    /// Pause between MITRE requests.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            cve_refresh_days: default_cve_refresh_days(),
            request_delay_ms: default_request_delay_ms(),
        }
    }
}

fn default_base_threshold() -> f64 {
    0.40
}

fn default_batch_delay_ms() -> u64 {
    200
}

fn default_merge_threshold() -> f64 {
    0.60
}

fn default_window_hours() -> i64 {
    48
}

fn default_min_trends() -> usize {
    6
}

fn default_token_budget() -> usize {
    150_000
}

fn default_cve_refresh_days() -> i64 {
    7
}

fn default_request_delay_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

impl NewsloomConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: NewsloomConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}
