use serde::Serialize;
use std::collections::BTreeSet;

use crate::signature::{ArticleSignature, GroupEntityStat, GroupSignature};
use crate::timefmt;

const ENTITY_WEIGHT: f64 = 0.40;
const COMPANY_WEIGHT: f64 = 0.25;
const CVE_WEIGHT: f64 = 0.15;
const EVENT_WEIGHT: f64 = 0.10;
// weights sum to 0.90; the remaining 0.10 is headroom for future dimensions

const CORE_ENTITY_BONUS: f64 = 0.20;
const SOURCE_BONUS: f64 = 0.03;
const CORE_ENTITY_TYPES: [&str; 3] = ["product", "organization", "technology"];

/// Relevance assumed for an article entity that carries no score of its own.
const DEFAULT_RELEVANCE: f64 = 0.7;

/// Per-dimension scores plus adjustments, all retained for observability.
/// Every field is in [0,1] except the adjustments, which are small signed
/// deltas folded into `composite`.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarityScores {
    pub entity: f64,
    pub company: f64,
    pub cve: f64,
    pub event: f64,
    pub base: f64,
    pub temporal: f64,
    pub source_bonus: f64,
    pub core_entity_bonus: f64,
    pub composite: f64,
}

impl SimilarityScores {
    fn zero() -> Self {
        Self {
            entity: 0.0,
            company: 0.0,
            cve: 0.0,
            event: 0.0,
            base: 0.0,
            temporal: 0.0,
            source_bonus: 0.0,
            core_entity_bonus: 0.0,
            composite: 0.0,
        }
    }
}

/// One side of a comparison viewed as an article: entity (id, relevance,
/// type) triples plus identity sets. A group signature can take this shape
/// too, with avg_relevance standing in for per-mention relevance.
struct ArticleSide {
    entities: Vec<(i64, Option<f64>, String)>,
    companies: Vec<String>,
    cves: Vec<String>,
    events: Vec<String>,
    published: Option<String>,
    source: Option<String>,
}

impl ArticleSide {
    fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.companies.is_empty()
            && self.cves.is_empty()
            && self.events.is_empty()
    }

    /// Highest-relevance entity; ties resolve to the first seen.
    fn top_entity(&self) -> Option<&(i64, Option<f64>, String)> {
        let mut best: Option<&(i64, Option<f64>, String)> = None;
        for entry in &self.entities {
            let relevance = entry.1.unwrap_or(DEFAULT_RELEVANCE);
            let best_relevance = best.map(|b| b.1.unwrap_or(DEFAULT_RELEVANCE));
            if best_relevance.map(|b| relevance > b).unwrap_or(true) {
                best = Some(entry);
            }
        }
        best
    }
}

fn article_as_side(sig: &ArticleSignature) -> ArticleSide {
    ArticleSide {
        entities: sig
            .primary_entities
            .iter()
            .map(|e| (e.entity_id, Some(e.relevance_score), e.entity_type.clone()))
            .collect(),
        companies: sig.companies.clone(),
        cves: sig.cves.clone(),
        events: sig.events.iter().map(|e| e.event_name.clone()).collect(),
        published: Some(sig.published_date.clone()),
        source: Some(sig.source.clone()),
    }
}

fn group_as_side(sig: &GroupSignature) -> ArticleSide {
    ArticleSide {
        entities: sig
            .primary_entities
            .iter()
            .map(|e| (e.entity_id, Some(e.avg_relevance), e.entity_type.clone()))
            .collect(),
        companies: sig.companies.iter().map(|c| c.name.clone()).collect(),
        cves: sig.cves.iter().map(|c| c.name.clone()).collect(),
        events: sig.events.iter().map(|e| e.name.clone()).collect(),
        published: sig.latest_published_date.clone(),
        // a group has no single source, so the source bonus never fires
        // in group-to-group comparisons
        source: None,
    }
}

/// Entity dimension: weighted overlap of the article's entities against the
/// group's frequency/relevance statistics, normalized by the group's total
/// possible contribution.
pub fn entity_similarity(
    article_entities: &[(i64, Option<f64>)],
    group_entities: &[GroupEntityStat],
) -> f64 {
    if article_entities.is_empty() || group_entities.is_empty() {
        return 0.0;
    }
    let mut score = 0.0;
    let mut max_possible = 0.0;
    for group_entity in group_entities {
        max_possible += group_entity.frequency * group_entity.avg_relevance;
        if let Some((_, relevance)) = article_entities
            .iter()
            .find(|(id, _)| *id == group_entity.entity_id)
        {
            let article_relevance = relevance.unwrap_or(DEFAULT_RELEVANCE);
            score += article_relevance * group_entity.avg_relevance * group_entity.frequency;
        }
    }
    if max_possible > 0.0 { score / max_possible } else { 0.0 }
}

pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let set_a: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let set_b: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union > 0 {
        intersection as f64 / union as f64
    } else {
        0.0
    }
}

/// Event dimension: group-frequency mass of the events the article shares,
/// over the group's total event mass.
fn event_similarity(article_events: &[String], group: &GroupSignature) -> f64 {
    if article_events.is_empty() || group.events.is_empty() {
        return 0.0;
    }
    let article_set: BTreeSet<&str> = article_events.iter().map(String::as_str).collect();
    let mut matched = 0.0;
    let mut total = 0.0;
    for event in &group.events {
        total += event.frequency;
        if article_set.contains(event.name.as_str()) {
            matched += event.frequency;
        }
    }
    if total > 0.0 { matched / total } else { 0.0 }
}

/// Temporal adjustment: fresh articles get a small boost toward active
/// groups, stale comparisons a small penalty. Bounded to ±0.05 / −0.03.
pub fn temporal_adjustment(article_published: Option<&str>, group_latest: Option<&str>) -> f64 {
    let (Some(article_raw), Some(group_raw)) = (article_published, group_latest) else {
        return 0.0;
    };
    let Some(hours) = timefmt::hours_between(article_raw, group_raw) else {
        tracing::warn!("unparseable dates in temporal adjustment: {article_raw} vs {group_raw}");
        return 0.0;
    };
    if hours <= 48.0 {
        0.05 * (1.0 - hours / 48.0)
    } else if hours > 168.0 {
        -0.03 * (hours / 168.0 - 1.0).min(1.0)
    } else {
        0.0
    }
}

fn score_side(side: &ArticleSide, group: &GroupSignature) -> SimilarityScores {
    // no features on the article side means nothing to compare: report zero
    // rather than letting the adjustments invent a score
    if side.is_empty() {
        return SimilarityScores::zero();
    }

    let entity_pairs: Vec<(i64, Option<f64>)> =
        side.entities.iter().map(|(id, rel, _)| (*id, *rel)).collect();
    let entity = entity_similarity(&entity_pairs, &group.primary_entities);
    let group_companies: Vec<String> = group.companies.iter().map(|c| c.name.clone()).collect();
    let company = jaccard(&side.companies, &group_companies);
    let group_cves: Vec<String> = group.cves.iter().map(|c| c.name.clone()).collect();
    let cve = jaccard(&side.cves, &group_cves);
    let event = event_similarity(&side.events, group);

    let base = ENTITY_WEIGHT * entity + COMPANY_WEIGHT * company + CVE_WEIGHT * cve + EVENT_WEIGHT * event;

    let temporal = temporal_adjustment(side.published.as_deref(), group.latest_published_date.as_deref());

    let source_bonus = match &side.source {
        Some(source) if group.member_sources.iter().any(|s| s == source) => SOURCE_BONUS,
        _ => 0.0,
    };

    let core_entity_bonus = match (side.top_entity(), group.top_entity()) {
        (Some((article_top_id, _, article_top_type)), Some(group_top))
            if *article_top_id == group_top.entity_id
                && CORE_ENTITY_TYPES.contains(&article_top_type.as_str()) =>
        {
            CORE_ENTITY_BONUS
        }
        _ => 0.0,
    };

    let composite = (base + temporal + source_bonus + core_entity_bonus).clamp(0.0, 1.0);
    SimilarityScores {
        entity,
        company,
        cve,
        event,
        base,
        temporal,
        source_bonus,
        core_entity_bonus,
        composite,
    }
}

pub fn score_article_to_group(article: &ArticleSignature, group: &GroupSignature) -> SimilarityScores {
    score_side(&article_as_side(article), group)
}

/// Symmetric group similarity: score each group against the other as if it
/// were an article, then average the two composites.
pub fn score_group_to_group(a: &GroupSignature, b: &GroupSignature) -> f64 {
    let a_to_b = score_side(&group_as_side(a), b).composite;
    let b_to_a = score_side(&group_as_side(b), a).composite;
    (a_to_b + b_to_a) / 2.0
}

/// Blend the averaged signature similarity with an LLM-rated label and
/// description similarity.
pub fn blend_with_label_similarity(signature_avg: f64, label_similarity: f64) -> f64 {
    signature_avg * 0.7 + label_similarity * 0.3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{NamedFrequency, SignatureEntity, SignatureEvent};

    fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
        assert!(
            (actual - expected).abs() < epsilon,
            "expected {expected}, got {actual} (diff: {})",
            (actual - expected).abs()
        );
    }

    fn entity_stat(id: i64, name: &str, entity_type: &str, frequency: f64, avg: f64) -> GroupEntityStat {
        GroupEntityStat {
            entity_id: id,
            entity_name: name.to_string(),
            entity_type: entity_type.to_string(),
            frequency,
            avg_relevance: avg,
        }
    }

    fn empty_group(id: i64) -> GroupSignature {
        GroupSignature {
            group_id: id,
            group_label: String::new(),
            description: String::new(),
            main_topic: String::new(),
            primary_entities: Vec::new(),
            companies: Vec::new(),
            cves: Vec::new(),
            technologies: Vec::new(),
            products: Vec::new(),
            events: Vec::new(),
            latest_published_date: None,
            member_sources: Vec::new(),
        }
    }

    fn article_sig(id: i64, published: &str, source: &str) -> ArticleSignature {
        ArticleSignature {
            article_id: id,
            published_date: published.to_string(),
            source: source.to_string(),
            primary_entities: Vec::new(),
            companies: Vec::new(),
            cves: Vec::new(),
            technologies: Vec::new(),
            products: Vec::new(),
            references: Vec::new(),
            events: Vec::new(),
            quotes: Vec::new(),
            author: None,
        }
    }

    fn named(name: &str, frequency: f64) -> NamedFrequency {
        NamedFrequency {
            name: name.to_string(),
            frequency,
        }
    }

    #[test]
    fn test_entity_similarity_weighted_overlap() {
        let group = vec![
            entity_stat(1, "Acme", "organization", 1.0, 0.9),
            entity_stat(2, "Widget", "product", 0.5, 0.8),
        ];
        // article shares only entity 1 at relevance 0.9
        let score = entity_similarity(&[(1, Some(0.9))], &group);
        // (0.9*0.9*1.0) / (1.0*0.9 + 0.5*0.8) = 0.81 / 1.3
        assert_approx(score, 0.81 / 1.3, 1e-9);
    }

    #[test]
    fn test_entity_similarity_default_relevance() {
        let group = vec![entity_stat(1, "Acme", "organization", 1.0, 1.0)];
        let score = entity_similarity(&[(1, None)], &group);
        assert_approx(score, 0.7, 1e-9);
    }

    #[test]
    fn test_entity_similarity_empty_sides() {
        let group = vec![entity_stat(1, "Acme", "organization", 1.0, 0.9)];
        assert_approx(entity_similarity(&[], &group), 0.0, 1e-9);
        assert_approx(entity_similarity(&[(1, Some(0.9))], &[]), 0.0, 1e-9);
    }

    #[test]
    fn test_jaccard() {
        let a = vec!["x".to_string(), "y".to_string()];
        let b = vec!["y".to_string(), "z".to_string()];
        assert_approx(jaccard(&a, &b), 1.0 / 3.0, 1e-9);
        assert_approx(jaccard(&a, &[]), 0.0, 1e-9);
        assert_approx(jaccard(&a, &a), 1.0, 1e-9);
    }

    #[test]
    fn test_temporal_adjustment_recent() {
        let adj = temporal_adjustment(Some("2024-06-01 18:00:00"), Some("2024-06-01 12:00:00"));
        assert_approx(adj, 0.05 * (1.0 - 6.0 / 48.0), 1e-9);
    }

    #[test]
    fn test_temporal_adjustment_gap_zone() {
        // between 48h and 168h: no adjustment
        let adj = temporal_adjustment(Some("2024-06-05 12:00:00"), Some("2024-06-01 12:00:00"));
        assert_approx(adj, 0.0, 1e-9);
    }

    #[test]
    fn test_temporal_adjustment_stale_capped() {
        // 336h = 2x the week boundary: full -0.03 penalty
        let adj = temporal_adjustment(Some("2024-06-15 12:00:00"), Some("2024-06-01 12:00:00"));
        assert_approx(adj, -0.03, 1e-9);
        // far beyond the cap stays at -0.03
        let adj = temporal_adjustment(Some("2025-06-01 12:00:00"), Some("2024-06-01 12:00:00"));
        assert_approx(adj, -0.03, 1e-9);
    }

    #[test]
    fn test_temporal_adjustment_bounds() {
        for (a, b) in [
            ("2024-06-01 12:00:00", "2024-06-01 12:00:00"),
            ("2024-06-01 13:30:00", "2024-06-01 12:00:00"),
            ("2024-06-03 12:00:00", "2024-06-01 12:00:00"),
            ("2024-07-01 12:00:00", "2024-06-01 12:00:00"),
            ("2026-06-01 12:00:00", "2024-06-01 12:00:00"),
        ] {
            let adj = temporal_adjustment(Some(a), Some(b));
            assert!(adj.abs() <= 0.05 + 1e-12, "adjustment {adj} out of bounds");
        }
    }

    #[test]
    fn test_temporal_adjustment_missing_dates() {
        assert_approx(temporal_adjustment(None, Some("2024-06-01 12:00:00")), 0.0, 1e-9);
        assert_approx(temporal_adjustment(Some("garbage"), Some("2024-06-01 12:00:00")), 0.0, 1e-9);
    }

    #[test]
    fn test_empty_article_scores_zero_everywhere() {
        let mut group = empty_group(1);
        group.primary_entities = vec![entity_stat(1, "Acme", "organization", 1.0, 0.9)];
        group.latest_published_date = Some("2024-06-01 12:00:00".to_string());
        group.member_sources = vec!["bleepingcomputer".to_string()];

        // same source and a close date, but no features at all
        let article = article_sig(7, "2024-06-01 13:00:00", "bleepingcomputer");
        let scores = score_article_to_group(&article, &group);
        assert_approx(scores.composite, 0.0, 1e-12);
        assert_approx(scores.temporal, 0.0, 1e-12);
        assert_approx(scores.source_bonus, 0.0, 1e-12);
    }

    #[test]
    fn test_cve_identity_attach_scenario() {
        // group about CVE-2024-1234, one member from bleepingcomputer
        let mut group = empty_group(1);
        group.primary_entities = vec![entity_stat(10, "Acme Corp", "organization", 1.0, 0.9)];
        group.cves = vec![named("CVE-2024-1234", 1.0)];
        group.latest_published_date = Some("2024-06-01 12:00:00".to_string());
        group.member_sources = vec!["bleepingcomputer".to_string()];

        let mut article = article_sig(7, "2024-06-01 18:00:00", "bleepingcomputer");
        article.primary_entities = vec![SignatureEntity {
            entity_id: 10,
            entity_name: "Acme Corp".to_string(),
            entity_type: "organization".to_string(),
            relevance_score: 0.9,
        }];
        article.cves = vec!["CVE-2024-1234".to_string()];

        let scores = score_article_to_group(&article, &group);
        assert_approx(scores.cve, 1.0, 1e-9);
        assert_approx(scores.entity, 0.9, 1e-9); // 0.9*0.9*1.0 / (1.0*0.9)
        assert_approx(scores.temporal, 0.05 * (1.0 - 6.0 / 48.0), 1e-9);
        assert_approx(scores.source_bonus, 0.03, 1e-9);
        assert_approx(scores.core_entity_bonus, 0.20, 1e-9);
        let expected = 0.40 * 0.9 + 0.15 * 1.0 + 0.05 * (1.0 - 6.0 / 48.0) + 0.03 + 0.20;
        assert_approx(scores.composite, expected, 1e-9);
    }

    #[test]
    fn test_core_bonus_requires_core_type() {
        let mut group = empty_group(1);
        group.primary_entities = vec![entity_stat(10, "John Doe", "person", 1.0, 0.9)];
        let mut article = article_sig(7, "2024-06-01 18:00:00", "x");
        article.primary_entities = vec![SignatureEntity {
            entity_id: 10,
            entity_name: "John Doe".to_string(),
            entity_type: "person".to_string(),
            relevance_score: 0.9,
        }];
        let scores = score_article_to_group(&article, &group);
        assert_approx(scores.core_entity_bonus, 0.0, 1e-9);
    }

    #[test]
    fn test_composite_is_clamped() {
        let mut group = empty_group(1);
        group.primary_entities = vec![entity_stat(10, "Acme", "product", 1.0, 1.0)];
        group.companies = vec![named("Acme", 1.0)];
        group.cves = vec![named("CVE-2024-1", 1.0)];
        group.events = vec![named("launch", 1.0)];
        group.latest_published_date = Some("2024-06-01 12:00:00".to_string());
        group.member_sources = vec!["s".to_string()];

        let mut article = article_sig(7, "2024-06-01 12:00:00", "s");
        article.primary_entities = vec![SignatureEntity {
            entity_id: 10,
            entity_name: "Acme".to_string(),
            entity_type: "product".to_string(),
            relevance_score: 1.0,
        }];
        article.companies = vec!["Acme".to_string()];
        article.cves = vec!["CVE-2024-1".to_string()];
        article.events = vec![SignatureEvent {
            event_id: 1,
            event_name: "launch".to_string(),
            event_type: "event".to_string(),
        }];

        let scores = score_article_to_group(&article, &group);
        // base 0.90 + 0.05 + 0.03 + 0.20 would exceed 1.0
        assert_approx(scores.composite, 1.0, 1e-9);
        for dim in [scores.entity, scores.company, scores.cve, scores.event] {
            assert!((0.0..=1.0).contains(&dim));
        }
    }

    #[test]
    fn test_group_to_group_symmetric_average() {
        let mut a = empty_group(1);
        a.primary_entities = vec![entity_stat(10, "Acme", "product", 1.0, 0.9)];
        a.cves = vec![named("CVE-2024-1", 1.0)];
        let mut b = empty_group(2);
        b.primary_entities = vec![entity_stat(10, "Acme", "product", 1.0, 0.8)];
        b.cves = vec![named("CVE-2024-1", 1.0)];

        let ab = score_group_to_group(&a, &b);
        let ba = score_group_to_group(&b, &a);
        assert_approx(ab, ba, 1e-12);
        assert!(ab > 0.5, "identical groups should score high, got {ab}");
    }

    #[test]
    fn test_blend_weighting() {
        assert_approx(blend_with_label_similarity(0.6, 1.0), 0.72, 1e-9);
        assert_approx(blend_with_label_similarity(0.6, 0.0), 0.42, 1e-9);
    }
}
