use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CveInfo {
    pub cve_id: String,
    pub base_score: Option<f64>,
    pub vendor: Option<String>,
    pub affected_products: Option<String>,
    pub cve_url: Option<String>,
    pub vendor_link: Option<String>,
    pub solution: Option<String>,
    pub times_mentioned: i64,
    pub updated_at: Option<String>,
}

/// One article mention of a CVE, joined with the article row. Input to the
/// `/api/cve_table` aggregation.
#[derive(Debug, Clone)]
pub struct CveMention {
    pub cve_id: String,
    pub article_id: i64,
    pub article_url: String,
    pub source: String,
    pub published_date: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CveArticleLink {
    pub url: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CveTableRow {
    pub cve_id: String,
    pub times_seen: usize,
    pub first_mention: Option<String>,
    pub last_mention: Option<String>,
    pub article_links: Vec<CveArticleLink>,
    pub base_score: Option<f64>,
    pub vendor: Option<String>,
    pub affected_products: Option<String>,
    pub cve_page_link: String,
    pub vendor_link: Option<String>,
    pub solution: Option<String>,
    pub sources: String,
}
