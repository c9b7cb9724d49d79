use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::AppState;
use crate::models::cve::{CveArticleLink, CveInfo, CveMention, CveTableRow};
use crate::timefmt;

#[derive(Debug, Deserialize)]
pub struct CveTableQuery {
    pub hours: Option<i64>,
}

/// `/api/cve_table?hours=N`: per-CVE aggregation of mentions plus MITRE
/// metadata, ordered by times seen.
pub async fn cve_table(
    State(state): State<AppState>,
    Query(query): Query<CveTableQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let hours = query.hours.filter(|h| *h > 0);
    let mentions = state.store.cve_mentions(hours).map_err(super::internal_error)?;
    let info = state.store.cve_info_all().map_err(super::internal_error)?;
    Ok(Json(json!({ "cves": build_cve_table(mentions, &info) })))
}

/// Fold mention rows into one table row per CVE. `sources` is the sorted
/// unique set of article-link hostnames.
pub fn build_cve_table(mentions: Vec<CveMention>, info: &HashMap<String, CveInfo>) -> Vec<CveTableRow> {
    let mut grouped: BTreeMap<String, Vec<CveMention>> = BTreeMap::new();
    for mention in mentions {
        grouped.entry(mention.cve_id.clone()).or_default().push(mention);
    }

    let mut rows: Vec<CveTableRow> = grouped
        .into_iter()
        .map(|(cve_id, mentions)| {
            let mut article_ids = BTreeSet::new();
            let mut hostnames = BTreeSet::new();
            let mut first: Option<String> = None;
            let mut last: Option<String> = None;
            let mut article_links = Vec::with_capacity(mentions.len());

            for mention in &mentions {
                article_ids.insert(mention.article_id);
                if let Ok(parsed) = url::Url::parse(&mention.article_url) {
                    if let Some(host) = parsed.host_str() {
                        hostnames.insert(host.to_string());
                    }
                }
                if timefmt::parse_utc(&mention.published_date).is_some() {
                    let date = &mention.published_date;
                    if first.as_deref().map(|f| date.as_str() < f).unwrap_or(true) {
                        first = Some(date.clone());
                    }
                    if last.as_deref().map(|l| date.as_str() > l).unwrap_or(true) {
                        last = Some(date.clone());
                    }
                }
                article_links.push(CveArticleLink {
                    url: mention.article_url.clone(),
                    source: if mention.source.is_empty() {
                        "unknown".to_string()
                    } else {
                        mention.source.clone()
                    },
                });
            }

            let metadata = info.get(&cve_id);
            CveTableRow {
                cve_page_link: format!("https://cve.mitre.org/cgi-bin/cvename.cgi?name={cve_id}"),
                times_seen: article_ids.len(),
                first_mention: first,
                last_mention: last,
                article_links,
                base_score: metadata.and_then(|m| m.base_score),
                vendor: metadata.and_then(|m| m.vendor.clone()),
                affected_products: metadata.and_then(|m| m.affected_products.clone()),
                vendor_link: metadata.and_then(|m| m.vendor_link.clone()),
                solution: metadata.and_then(|m| m.solution.clone()),
                sources: hostnames.into_iter().collect::<Vec<_>>().join(", "),
                cve_id,
            }
        })
        .collect();

    rows.sort_by(|a, b| b.times_seen.cmp(&a.times_seen).then(a.cve_id.cmp(&b.cve_id)));
    rows
}
