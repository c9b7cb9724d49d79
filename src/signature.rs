use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::group::GroupWithMembers;
use crate::store::{Store, StoreResult};
use crate::timefmt;

/// Relevance floor for an entity to count as "primary" in a signature.
pub const PRIMARY_ENTITY_MIN_RELEVANCE: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureEntity {
    pub entity_id: i64,
    pub entity_name: String,
    pub entity_type: String,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureReference {
    pub url: String,
    pub domain: String,
    pub reference_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureEvent {
    pub event_id: i64,
    pub event_name: String,
    pub event_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureQuote {
    pub quote_id: i64,
    pub text: String,
    pub speaker: Option<String>,
}

/// Immutable per-article feature bundle: everything the similarity scorer
/// looks at, snapshotted from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleSignature {
    pub article_id: i64,
    pub published_date: String,
    pub source: String,
    pub primary_entities: Vec<SignatureEntity>,
    pub companies: Vec<String>,
    pub cves: Vec<String>,
    pub technologies: Vec<SignatureEntity>,
    pub products: Vec<SignatureEntity>,
    pub references: Vec<SignatureReference>,
    pub events: Vec<SignatureEvent>,
    pub quotes: Vec<SignatureQuote>,
    pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupEntityStat {
    pub entity_id: i64,
    pub entity_name: String,
    pub entity_type: String,
    pub frequency: f64,
    pub avg_relevance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedFrequency {
    pub name: String,
    pub frequency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdName {
    pub entity_id: i64,
    pub entity_name: String,
}

/// Aggregated feature bundle for a group, summarizing all member-article
/// signatures with frequency and relevance statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSignature {
    pub group_id: i64,
    pub group_label: String,
    pub description: String,
    pub main_topic: String,
    pub primary_entities: Vec<GroupEntityStat>,
    pub companies: Vec<NamedFrequency>,
    pub cves: Vec<NamedFrequency>,
    pub technologies: Vec<IdName>,
    pub products: Vec<IdName>,
    pub events: Vec<NamedFrequency>,
    pub latest_published_date: Option<String>,
    pub member_sources: Vec<String>,
}

impl GroupSignature {
    /// The group's defining entity: highest frequency × avg_relevance.
    /// Ties resolve to the first entry in canonical order.
    pub fn top_entity(&self) -> Option<&GroupEntityStat> {
        let mut best: Option<&GroupEntityStat> = None;
        for entity in &self.primary_entities {
            let weight = entity.frequency * entity.avg_relevance;
            let beats = best
                .map(|b| weight > b.frequency * b.avg_relevance)
                .unwrap_or(true);
            if beats {
                best = Some(entity);
            }
        }
        best
    }

    /// Key entity names for prompt context, already in canonical order.
    pub fn key_entity_names(&self, limit: usize) -> Vec<&str> {
        self.primary_entities
            .iter()
            .take(limit)
            .map(|e| e.entity_name.as_str())
            .collect()
    }
}

/// Build the signature for one article. Returns None when the article does
/// not exist.
pub fn build_article_signature(
    store: &Store,
    article_id: i64,
) -> StoreResult<Option<ArticleSignature>> {
    let Some((published_date, source)) = store.article_meta(article_id)? else {
        return Ok(None);
    };

    let primary_entities = store
        .primary_entities_for_article(article_id, PRIMARY_ENTITY_MIN_RELEVANCE)?
        .into_iter()
        .map(|e| SignatureEntity {
            entity_id: e.entity_id,
            entity_name: e.entity_name,
            entity_type: e.entity_type,
            relevance_score: e.relevance_score,
        })
        .collect();
    let technologies = store
        .entities_by_type_for_article(article_id, "technology")?
        .into_iter()
        .map(|e| SignatureEntity {
            entity_id: e.entity_id,
            entity_name: e.entity_name,
            entity_type: e.entity_type,
            relevance_score: e.relevance_score,
        })
        .collect();
    let products = store
        .entities_by_type_for_article(article_id, "product")?
        .into_iter()
        .map(|e| SignatureEntity {
            entity_id: e.entity_id,
            entity_name: e.entity_name,
            entity_type: e.entity_type,
            relevance_score: e.relevance_score,
        })
        .collect();
    let references = store
        .external_references_for_article(article_id)?
        .into_iter()
        .map(|(url, domain, reference_type)| SignatureReference {
            url,
            domain,
            reference_type,
        })
        .collect();
    let events = store
        .named_events_for_article(article_id)?
        .into_iter()
        .map(|(event_id, event_name, event_type)| SignatureEvent {
            event_id,
            event_name,
            event_type,
        })
        .collect();
    let quotes = store
        .quotes_for_article(article_id)?
        .into_iter()
        .map(|(quote_id, text, speaker)| SignatureQuote {
            quote_id,
            text,
            speaker,
        })
        .collect();

    Ok(Some(ArticleSignature {
        article_id,
        published_date,
        source,
        primary_entities,
        companies: store.companies_for_article(article_id)?,
        cves: store.cves_for_article(article_id)?,
        technologies,
        products,
        references,
        events,
        quotes,
        author: store.author_for_article(article_id)?,
    }))
}

/// Summarize a group's member-article signatures into one aggregate bundle.
/// Output ordering is canonical so identical inputs serialize identically.
pub fn build_group_signature(store: &Store, group: &GroupWithMembers) -> StoreResult<GroupSignature> {
    let mut signature = GroupSignature {
        group_id: group.group.group_id,
        group_label: group.group.group_label.clone(),
        description: group.group.description.clone(),
        main_topic: group.group.main_topic.clone(),
        primary_entities: Vec::new(),
        companies: Vec::new(),
        cves: Vec::new(),
        technologies: Vec::new(),
        products: Vec::new(),
        events: Vec::new(),
        latest_published_date: None,
        member_sources: Vec::new(),
    };
    if group.article_ids.is_empty() {
        return Ok(signature);
    }

    let mut member_signatures = Vec::with_capacity(group.article_ids.len());
    for &article_id in &group.article_ids {
        match build_article_signature(store, article_id)? {
            Some(sig) => member_signatures.push(sig),
            None => tracing::warn!(
                "article {article_id} missing while building signature for group {}",
                group.group.group_id
            ),
        }
    }
    if member_signatures.is_empty() {
        return Ok(signature);
    }
    let member_count = member_signatures.len() as f64;

    // BTreeMaps keep aggregation order deterministic.
    let mut entity_counts: BTreeMap<i64, (i64, Vec<f64>)> = BTreeMap::new();
    let mut company_counts: BTreeMap<String, i64> = BTreeMap::new();
    let mut cve_counts: BTreeMap<String, i64> = BTreeMap::new();
    let mut event_counts: BTreeMap<String, i64> = BTreeMap::new();
    let mut tech_ids: BTreeMap<i64, String> = BTreeMap::new();
    let mut product_ids: BTreeMap<i64, String> = BTreeMap::new();
    let mut latest: Option<(chrono::DateTime<chrono::Utc>, String)> = None;
    let mut sources: Vec<String> = Vec::new();

    for sig in &member_signatures {
        for entity in &sig.primary_entities {
            let slot = entity_counts.entry(entity.entity_id).or_insert((0, Vec::new()));
            slot.0 += 1;
            slot.1.push(entity.relevance_score);
        }
        for company in &sig.companies {
            *company_counts.entry(company.clone()).or_insert(0) += 1;
        }
        for cve in &sig.cves {
            *cve_counts.entry(cve.clone()).or_insert(0) += 1;
        }
        for event in &sig.events {
            *event_counts.entry(event.event_name.clone()).or_insert(0) += 1;
        }
        for tech in &sig.technologies {
            tech_ids.insert(tech.entity_id, tech.entity_name.clone());
        }
        for product in &sig.products {
            product_ids.insert(product.entity_id, product.entity_name.clone());
        }
        if let Some(ts) = timefmt::parse_utc(&sig.published_date) {
            if latest.as_ref().map(|(best, _)| ts > *best).unwrap_or(true) {
                latest = Some((ts, sig.published_date.clone()));
            }
        }
        if !sources.contains(&sig.source) {
            sources.push(sig.source.clone());
        }
    }

    let entity_ids: Vec<i64> = entity_counts.keys().copied().collect();
    let details = store.entity_details(&entity_ids)?;
    let mut entities: Vec<GroupEntityStat> = details
        .into_iter()
        .map(|entity| {
            let (count, relevances) = &entity_counts[&entity.entity_id];
            let avg_relevance = relevances.iter().sum::<f64>() / relevances.len() as f64;
            GroupEntityStat {
                entity_id: entity.entity_id,
                entity_name: entity.entity_name,
                entity_type: entity.entity_type,
                frequency: *count as f64 / member_count,
                avg_relevance,
            }
        })
        .collect();
    entities.sort_by(|a, b| {
        b.frequency
            .total_cmp(&a.frequency)
            .then(b.avg_relevance.total_cmp(&a.avg_relevance))
            .then(a.entity_id.cmp(&b.entity_id))
    });

    signature.primary_entities = entities;
    signature.companies = to_named_frequencies(company_counts, member_count);
    signature.cves = to_named_frequencies(cve_counts, member_count);
    signature.events = to_named_frequencies(event_counts, member_count);
    signature.technologies = tech_ids
        .into_iter()
        .map(|(entity_id, entity_name)| IdName {
            entity_id,
            entity_name,
        })
        .collect();
    signature.products = product_ids
        .into_iter()
        .map(|(entity_id, entity_name)| IdName {
            entity_id,
            entity_name,
        })
        .collect();
    signature.latest_published_date = latest.map(|(_, raw)| raw);
    sources.sort_unstable();
    signature.member_sources = sources;
    Ok(signature)
}

fn to_named_frequencies(counts: BTreeMap<String, i64>, member_count: f64) -> Vec<NamedFrequency> {
    let mut out: Vec<NamedFrequency> = counts
        .into_iter()
        .map(|(name, count)| NamedFrequency {
            name,
            frequency: count as f64 / member_count,
        })
        .collect();
    out.sort_by(|a, b| b.frequency.total_cmp(&a.frequency).then(a.name.cmp(&b.name)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::article::ScrapedArticle;
    use crate::models::group::{Group, GroupWithMembers};
    use crate::store::Store;

    fn insert_article(store: &Store, link: &str, source: &str, published: &str) -> i64 {
        store
            .insert_article(&ScrapedArticle {
                link: link.to_string(),
                title: format!("title {link}"),
                content: "content".to_string(),
                published_date: published.to_string(),
                source: source.to_string(),
                author: None,
            })
            .unwrap()
            .unwrap()
    }

    fn link_entity(store: &Store, article: i64, name: &str, entity_type: &str, relevance: f64) -> i64 {
        store
            .with_tx(|tx| {
                let entity = Store::insert_or_bump_entity_tx(tx, name, entity_type, None)?;
                Store::link_entity_to_article_tx(tx, article, entity, relevance, None)?;
                Ok(entity)
            })
            .unwrap()
    }

    fn group_with(store: &Store, label: &str, article_ids: Vec<i64>) -> GroupWithMembers {
        let group_id = store
            .with_tx(|tx| {
                let id = Store::create_group_tx(tx, "Cybersecurity & Data Privacy", "", label, "", 0.7)?;
                for &a in &article_ids {
                    Store::move_article_to_group_tx(tx, a, id)?;
                }
                Ok(id)
            })
            .unwrap();
        GroupWithMembers {
            group: Group {
                group_id,
                main_topic: "Cybersecurity & Data Privacy".to_string(),
                sub_topic: String::new(),
                group_label: label.to_string(),
                description: String::new(),
                consistency_score: 0.7,
                created_at: "2024-06-01 00:00:00".to_string(),
                updated_at: "2024-06-01 00:00:00".to_string(),
            },
            article_ids,
        }
    }

    #[test]
    fn test_article_signature_filters_primary_entities() {
        let store = Store::open_in_memory().unwrap();
        let article = insert_article(&store, "https://a/1", "bleepingcomputer", "2024-06-01 12:00:00");
        link_entity(&store, article, "Acme Corp", "organization", 0.9);
        link_entity(&store, article, "minor detail", "concept", 0.3);

        let sig = build_article_signature(&store, article).unwrap().unwrap();
        assert_eq!(sig.primary_entities.len(), 1);
        assert_eq!(sig.primary_entities[0].entity_name, "Acme Corp");
        assert_eq!(sig.source, "bleepingcomputer");
    }

    #[test]
    fn test_article_signature_missing_article() {
        let store = Store::open_in_memory().unwrap();
        assert!(build_article_signature(&store, 42).unwrap().is_none());
    }

    #[test]
    fn test_group_signature_frequencies_and_sources() {
        let store = Store::open_in_memory().unwrap();
        let a1 = insert_article(&store, "https://a/1", "bleepingcomputer", "2024-06-01 12:00:00");
        let a2 = insert_article(&store, "https://a/2", "theregister", "2024-06-02 09:00:00");
        link_entity(&store, a1, "Acme Corp", "organization", 0.9);
        link_entity(&store, a2, "Acme Corp", "organization", 0.7);
        link_entity(&store, a2, "WidgetOS", "technology", 0.8);
        store.insert_article_cve(a1, "CVE-2024-1234", None).unwrap();
        store.insert_article_cve(a2, "CVE-2024-1234", None).unwrap();

        let group = group_with(&store, "acme exploit", vec![a1, a2]);
        let sig = build_group_signature(&store, &group).unwrap();

        let acme = sig
            .primary_entities
            .iter()
            .find(|e| e.entity_name == "Acme Corp")
            .unwrap();
        assert!((acme.frequency - 1.0).abs() < 1e-9);
        assert!((acme.avg_relevance - 0.8).abs() < 1e-9);

        assert_eq!(sig.cves.len(), 1);
        assert!((sig.cves[0].frequency - 1.0).abs() < 1e-9);
        assert_eq!(sig.latest_published_date.as_deref(), Some("2024-06-02 09:00:00"));
        assert_eq!(sig.member_sources, vec!["bleepingcomputer", "theregister"]);
        assert_eq!(sig.technologies.len(), 1);
    }

    #[test]
    fn test_group_signature_is_deterministic() {
        let store = Store::open_in_memory().unwrap();
        let a1 = insert_article(&store, "https://a/1", "srcA", "2024-06-01 12:00:00");
        let a2 = insert_article(&store, "https://a/2", "srcB", "2024-06-01 13:00:00");
        link_entity(&store, a1, "Entity One", "product", 0.8);
        link_entity(&store, a1, "Entity Two", "organization", 0.8);
        link_entity(&store, a2, "Entity Two", "organization", 0.8);
        link_entity(&store, a2, "Entity Three", "technology", 0.9);

        let group = group_with(&store, "dup check", vec![a1, a2]);
        let first = serde_json::to_string(&build_group_signature(&store, &group).unwrap()).unwrap();
        let second = serde_json::to_string(&build_group_signature(&store, &group).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_group_top_entity_by_weight() {
        let sig = GroupSignature {
            group_id: 1,
            group_label: String::new(),
            description: String::new(),
            main_topic: String::new(),
            primary_entities: vec![
                GroupEntityStat {
                    entity_id: 1,
                    entity_name: "frequent but weak".to_string(),
                    entity_type: "concept".to_string(),
                    frequency: 1.0,
                    avg_relevance: 0.3,
                },
                GroupEntityStat {
                    entity_id: 2,
                    entity_name: "rare but strong".to_string(),
                    entity_type: "product".to_string(),
                    frequency: 0.5,
                    avg_relevance: 0.9,
                },
            ],
            companies: Vec::new(),
            cves: Vec::new(),
            technologies: Vec::new(),
            products: Vec::new(),
            events: Vec::new(),
            latest_published_date: None,
            member_sources: Vec::new(),
        };
        assert_eq!(sig.top_entity().unwrap().entity_id, 2);
    }
}
