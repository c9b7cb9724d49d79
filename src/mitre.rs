use serde::Deserialize;
use std::time::Duration;

const BASE_URL: &str = "https://cveawg.mitre.org/api/cve";
const REQUEST_TIMEOUT_SECS: u64 = 15;
const MAX_ATTEMPTS: u32 = 3;

/// The slice of a CVE record this pipeline cares about:
/// `.containers.cna.{affected, metrics, references, solutions}`.
#[derive(Debug, Deserialize)]
pub struct CveRecord {
    #[serde(default)]
    pub containers: Containers,
}

#[derive(Debug, Default, Deserialize)]
pub struct Containers {
    #[serde(default)]
    pub cna: CnaContainer,
}

#[derive(Debug, Default, Deserialize)]
pub struct CnaContainer {
    #[serde(default)]
    pub affected: Vec<Affected>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default)]
    pub solutions: Vec<Solution>,
}

#[derive(Debug, Deserialize)]
pub struct Affected {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Metric {
    #[serde(rename = "cvssV3_1", default)]
    pub cvss_v3_1: Option<Cvss>,
    #[serde(rename = "cvssV3_0", default)]
    pub cvss_v3_0: Option<Cvss>,
    #[serde(rename = "cvssV2", default)]
    pub cvss_v2: Option<Cvss>,
}

#[derive(Debug, Deserialize)]
pub struct Cvss {
    #[serde(rename = "baseScore", default)]
    pub base_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct Reference {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Solution {
    #[serde(default)]
    pub value: Option<String>,
}

impl CnaContainer {
    /// Sorted unique vendor names, comma-joined.
    pub fn vendor_string(&self) -> String {
        join_sorted_unique(self.affected.iter().filter_map(|a| a.vendor.as_deref()))
    }

    /// Sorted unique product names, comma-joined.
    pub fn products_string(&self) -> String {
        join_sorted_unique(self.affected.iter().filter_map(|a| a.product.as_deref()))
    }

    /// Base score preference: CVSS v3.1 > v3.0 > v2.
    pub fn base_score(&self) -> Option<f64> {
        for m in &self.metrics {
            if let Some(score) = m.cvss_v3_1.as_ref().and_then(|c| c.base_score) {
                return Some(score);
            }
            if let Some(score) = m.cvss_v3_0.as_ref().and_then(|c| c.base_score) {
                return Some(score);
            }
        }
        self.metrics
            .iter()
            .find_map(|m| m.cvss_v2.as_ref().and_then(|c| c.base_score))
    }

    /// First reference tagged `vendor-advisory`.
    pub fn vendor_link(&self) -> String {
        self.references
            .iter()
            .find(|r| r.tags.iter().any(|t| t == "vendor-advisory"))
            .and_then(|r| r.url.clone())
            .unwrap_or_default()
    }

    pub fn solution_string(&self) -> String {
        self.solutions
            .iter()
            .filter_map(|s| s.value.as_deref())
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
            .trim()
            .to_string()
    }
}

fn join_sorted_unique<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let mut values: Vec<&str> = items.filter(|v| !v.is_empty()).collect();
    values.sort_unstable();
    values.dedup();
    values.join(", ")
}

pub struct MitreClient {
    http: reqwest::Client,
    base_url: String,
}

impl Default for MitreClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MitreClient {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, base_url }
    }

    pub fn record_url(&self, cve_id: &str) -> String {
        format!("{}/{cve_id}", self.base_url)
    }

    /// Fetch one CVE record. Returns Ok(None) for not-found / error bodies
    /// so the caller can skip without treating it as a failure; transport
    /// errors and 5xx are retried with backoff, then surface as Err.
    pub async fn fetch(&self, cve_id: &str) -> anyhow::Result<Option<(CveRecord, String)>> {
        let url = self.record_url(cve_id);
        let mut resp = None;
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                let backoff = Duration::from_millis(300 * 2u64.pow(attempt - 2));
                tokio::time::sleep(backoff).await;
            }
            match self.http.get(&url).send().await {
                Ok(r) if r.status().is_server_error() => {
                    tracing::warn!("mitre attempt {attempt} for {cve_id}: {}", r.status());
                    last_err = Some(anyhow::anyhow!("mitre returned {} for {cve_id}", r.status()));
                }
                Ok(r) => {
                    resp = Some(r);
                    break;
                }
                Err(e) => {
                    tracing::warn!("mitre attempt {attempt} for {cve_id} failed: {e}");
                    last_err = Some(e.into());
                }
            }
        }
        let Some(resp) = resp else {
            return Err(last_err.unwrap_or_else(|| anyhow::anyhow!("mitre request failed")));
        };
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("mitre returned {status} for {cve_id}");
        }
        let raw = resp.text().await?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        if value.get("error").is_some() || value.get("message").map(|m| m == "CVE not found") == Some(true)
        {
            tracing::info!("cve not found in mitre: {cve_id}");
            return Ok(None);
        }
        let record: CveRecord = serde_json::from_value(value)?;
        Ok(Some((record, raw)))
    }
}
