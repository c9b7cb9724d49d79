use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::category;
use crate::config::GroupingConfig;
use crate::consistency;
use crate::llm::{self, ChatApi, ChatMessage};
use crate::models::article::UngroupedArticle;
use crate::models::group::{Group, GroupWithMembers};
use crate::signature::{self, ArticleSignature, GroupSignature};
use crate::similarity;
use crate::store::Store;
use crate::timefmt;

// Ambiguity zone around the dynamic threshold. Exactly at the threshold
// counts as in-zone.
const ZONE_BELOW_THRESHOLD: f64 = 0.10;
const ZONE_ABOVE_THRESHOLD: f64 = 0.05;
const MAX_SCORE_GAP: f64 = 0.08;

const THRESHOLD_FLOOR: f64 = 0.10;
const THRESHOLD_CEIL: f64 = 0.90;

const NEW_GROUP_EXCERPT_CHARS: usize = 3000;
const PROMPT_ENTITY_LIMIT: usize = 10;
const CANDIDATE_LIMIT: usize = 3;
const NEAR_MISS_LIMIT: usize = 2;
const INITIAL_CONSISTENCY: f64 = 0.7;

/// Per-group similarity threshold: base plus a category offset plus a
/// size-bucket offset, clamped to a sane range.
pub fn dynamic_threshold(base: f64, main_topic: &str, member_count: usize) -> f64 {
    let category_offset = match main_topic {
        "Cybersecurity & Data Privacy" => 0.05,
        "Artificial Intelligence & Machine Learning" => 0.03,
        "Other" => -0.03,
        _ => 0.0,
    };
    let size_offset = if member_count <= 1 {
        0.05
    } else if member_count <= 5 {
        0.0
    } else if member_count <= 10 {
        -0.03
    } else {
        -0.05
    };
    (base + category_offset + size_offset).clamp(THRESHOLD_FLOOR, THRESHOLD_CEIL)
}

/// Whether a best-match score sits close enough to its threshold (or to the
/// runner-up) that the decision should go to arbitration.
pub fn in_ambiguity_zone(score: f64, threshold: f64, second_best: f64) -> bool {
    (threshold - ZONE_BELOW_THRESHOLD <= score && score < threshold + ZONE_ABOVE_THRESHOLD)
        || (score >= threshold && score - second_best < MAX_SCORE_GAP)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Attach,
    Arbitrate,
    CreateNew,
}

/// The threshold decision ladder. With arbitration disabled this collapses
/// to a plain threshold comparison.
pub fn decide(score: f64, threshold: f64, second_best: f64, arbitration_enabled: bool) -> Decision {
    let ambiguous = arbitration_enabled && in_ambiguity_zone(score, threshold, second_best);
    if score >= threshold && !ambiguous {
        Decision::Attach
    } else if ambiguous {
        Decision::Arbitrate
    } else {
        Decision::CreateNew
    }
}

#[derive(Debug, PartialEq)]
pub enum ArbitrationOutcome {
    Group(i64),
    NewGroup,
    Unparseable,
}

/// Parse an arbitration reply: a candidate group id, the literal `None`, or
/// noise (which sends the caller back to the threshold comparison).
pub fn parse_arbitration_reply(reply: &str, candidate_ids: &[i64]) -> ArbitrationOutcome {
    let trimmed = reply.trim();
    if let Ok(id) = trimmed.parse::<i64>() {
        if candidate_ids.contains(&id) {
            return ArbitrationOutcome::Group(id);
        }
        tracing::warn!("arbitration returned non-candidate group id {id}");
        return ArbitrationOutcome::Unparseable;
    }
    if trimmed.to_ascii_lowercase().contains("none") {
        return ArbitrationOutcome::NewGroup;
    }
    ArbitrationOutcome::Unparseable
}

#[derive(Debug, Deserialize)]
struct NewGroupReply {
    #[serde(default)]
    main_topic: Option<String>,
    #[serde(default)]
    group_label: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Default)]
pub struct GroupingSummary {
    pub attached: usize,
    pub created: usize,
    pub errors: usize,
}

struct CachedGroup {
    group: Group,
    article_ids: Vec<i64>,
    signature: GroupSignature,
}

struct ScoredCandidate {
    cache_index: usize,
    group_id: i64,
    score: f64,
    threshold: f64,
}

/// Stateful matcher: for each ungrouped article decide attach / create /
/// arbitrate against an in-run signature cache that grows as groups gain
/// members. The cache is rebuilt every run and never shared.
pub struct GroupingCoordinator {
    store: Arc<Store>,
    chat: Arc<dyn ChatApi>,
    config: GroupingConfig,
    model: String,
}

impl GroupingCoordinator {
    pub fn new(store: Arc<Store>, chat: Arc<dyn ChatApi>, config: GroupingConfig, model: String) -> Self {
        Self {
            store,
            chat,
            config,
            model,
        }
    }

    pub async fn run(&self) -> anyhow::Result<GroupingSummary> {
        let removed = self.store.delete_empty_groups()?;
        if removed > 0 {
            tracing::info!("removed {removed} empty groups");
        }

        let groups = self.store.groups_with_members()?;
        tracing::info!("building signatures for {} groups", groups.len());
        let mut cache: Vec<CachedGroup> = Vec::with_capacity(groups.len());
        for group in groups {
            match signature::build_group_signature(&self.store, &group) {
                Ok(sig) => cache.push(CachedGroup {
                    group: group.group,
                    article_ids: group.article_ids,
                    signature: sig,
                }),
                Err(e) => {
                    tracing::error!("signature failed for group {}: {e}", group.group.group_id)
                }
            }
        }

        let articles = self.store.ungrouped_articles()?;
        if articles.is_empty() {
            tracing::info!("no ungrouped articles to process");
            return Ok(GroupingSummary::default());
        }
        tracing::info!("processing {} ungrouped articles", articles.len());

        let mut summary = GroupingSummary::default();
        let total = articles.len();
        for (idx, article) in articles.into_iter().enumerate() {
            tracing::info!("article {}/{total} (id {})", idx + 1, article.id);
            if article.content.is_empty() {
                tracing::warn!("article {} has no content, skipping", article.id);
                summary.errors += 1;
                continue;
            }
            match self.process_article(&article, &mut cache).await {
                Ok(Decision::Attach) => summary.attached += 1,
                Ok(Decision::CreateNew) => summary.created += 1,
                Ok(Decision::Arbitrate) => unreachable!("arbitration resolves before returning"),
                Err(e) => {
                    tracing::error!("failed to process article {}: {e}", article.id);
                    summary.errors += 1;
                }
            }
            if self.config.batch_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }
        }

        tracing::info!(
            "grouping run finished: {} attached, {} created, {} errors",
            summary.attached,
            summary.created,
            summary.errors
        );
        Ok(summary)
    }

    /// Returns the resolved decision (never `Arbitrate`).
    async fn process_article(
        &self,
        article: &UngroupedArticle,
        cache: &mut Vec<CachedGroup>,
    ) -> anyhow::Result<Decision> {
        let article_sig = signature::build_article_signature(&self.store, article.id)?
            .ok_or_else(|| anyhow::anyhow!("article {} vanished mid-run", article.id))?;

        let mut scored: Vec<ScoredCandidate> = cache
            .iter()
            .enumerate()
            .filter(|(_, cached)| !cached.article_ids.is_empty())
            .map(|(cache_index, cached)| {
                let scores = similarity::score_article_to_group(&article_sig, &cached.signature);
                ScoredCandidate {
                    cache_index,
                    group_id: cached.group.group_id,
                    score: scores.composite,
                    threshold: dynamic_threshold(
                        self.config.base_threshold,
                        &cached.group.main_topic,
                        cached.article_ids.len(),
                    ),
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));

        let Some(best) = scored.first() else {
            self.create_new_group(article, &article_sig, &[], cache).await?;
            return Ok(Decision::CreateNew);
        };
        let second_best = scored.get(1).map(|c| c.score).unwrap_or(-1.0);
        tracing::debug!(
            "article {}: best group {} score {:.3} (threshold {:.3}, runner-up {:.3})",
            article.id,
            best.group_id,
            best.score,
            best.threshold,
            second_best
        );

        match decide(best.score, best.threshold, second_best, self.config.llm_arbitration) {
            Decision::Attach => {
                self.attach(article, best.cache_index, cache).await?;
                Ok(Decision::Attach)
            }
            Decision::CreateNew => {
                self.create_new_group(article, &article_sig, &scored, cache).await?;
                Ok(Decision::CreateNew)
            }
            Decision::Arbitrate => {
                let above_threshold = best.score >= best.threshold;
                let best_index = best.cache_index;
                match self.arbitrate(article, &article_sig, &scored, cache).await {
                    ArbitrationOutcome::Group(group_id) => {
                        let cache_index = cache
                            .iter()
                            .position(|c| c.group.group_id == group_id)
                            .ok_or_else(|| anyhow::anyhow!("arbitrated group {group_id} not cached"))?;
                        self.attach(article, cache_index, cache).await?;
                        Ok(Decision::Attach)
                    }
                    ArbitrationOutcome::NewGroup => {
                        self.create_new_group(article, &article_sig, &scored, cache).await?;
                        Ok(Decision::CreateNew)
                    }
                    // fall back to the plain threshold comparison
                    ArbitrationOutcome::Unparseable if above_threshold => {
                        self.attach(article, best_index, cache).await?;
                        Ok(Decision::Attach)
                    }
                    ArbitrationOutcome::Unparseable => {
                        self.create_new_group(article, &article_sig, &scored, cache).await?;
                        Ok(Decision::CreateNew)
                    }
                }
            }
        }
    }

    /// LLM arbitration over the top candidates. A failed call counts as
    /// unparseable, which sends the caller back to the threshold comparison.
    async fn arbitrate(
        &self,
        article: &UngroupedArticle,
        article_sig: &ArticleSignature,
        scored: &[ScoredCandidate],
        cache: &[CachedGroup],
    ) -> ArbitrationOutcome {
        let candidates: Vec<&ScoredCandidate> = scored.iter().take(CANDIDATE_LIMIT).collect();
        let candidate_ids: Vec<i64> = candidates.iter().map(|c| c.group_id).collect();

        let entity_names: Vec<&str> = article_sig
            .primary_entities
            .iter()
            .take(PROMPT_ENTITY_LIMIT)
            .map(|e| e.entity_name.as_str())
            .collect();

        let mut prompt = format!(
            "Article {} (Title: '{}', Entities: {:?}) needs grouping.\n\
             It has the following similarity scores to existing groups (higher is better):\n",
            article.id, article.title, entity_names
        );
        for candidate in &candidates {
            let cached = &cache[candidate.cache_index];
            prompt.push_str(&format!(
                "- Group {} '{}': score = {:.3} (threshold for this group was {:.3})\n",
                candidate.group_id, cached.group.group_label, candidate.score, candidate.threshold
            ));
        }
        prompt.push_str(
            "\nBased on the meaning and topic described below, which group is the best fit? \
             Or should it be in a 'None' (new) group?\n\n",
        );
        for candidate in &candidates {
            let cached = &cache[candidate.cache_index];
            prompt.push_str(&format!(
                "Group {}:\n  Label: {}\n  Description: {}\n  Key entities: {:?}\n\n",
                candidate.group_id,
                cached.group.group_label,
                llm::truncate_chars(&cached.group.description, 500),
                cached.signature.key_entity_names(5)
            ));
        }
        prompt.push_str(
            "Respond with ONLY the best matching group ID number (e.g. '123') \
             or the word 'None' if no group is a good semantic fit.",
        );

        let messages = [ChatMessage::user(prompt)];
        let reply = match self.chat.chat(&messages, &self.model).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("arbitration call failed for article {}: {e}", article.id);
                return ArbitrationOutcome::Unparseable;
            }
        };
        let outcome = parse_arbitration_reply(&reply, &candidate_ids);
        match &outcome {
            ArbitrationOutcome::Group(id) => {
                tracing::info!("arbitration: attach article {} to group {id}", article.id)
            }
            ArbitrationOutcome::NewGroup => {
                tracing::info!("arbitration: article {} gets a new group", article.id)
            }
            ArbitrationOutcome::Unparseable => {
                tracing::warn!("arbitration unparseable for article {}, using threshold", article.id)
            }
        }
        outcome
    }

    async fn attach(
        &self,
        article: &UngroupedArticle,
        cache_index: usize,
        cache: &mut [CachedGroup],
    ) -> anyhow::Result<()> {
        let group_id = cache[cache_index].group.group_id;
        self.store.move_article_to_group(article.id, group_id)?;
        // grow the cached member list; the signature itself stays stale
        // until the next run, trading a little match quality for not
        // rebuilding signatures article by article
        cache[cache_index].article_ids.push(article.id);
        tracing::info!("attached article {} to group {group_id}", article.id);

        if self.config.consistency_checks && cache[cache_index].article_ids.len() > 1 {
            let group = GroupWithMembers {
                group: cache[cache_index].group.clone(),
                article_ids: cache[cache_index].article_ids.clone(),
            };
            match consistency::evaluate_group_consistency(&self.store, &self.chat, &self.model, &group)
                .await
            {
                Ok(evaluation) => tracing::info!(
                    "consistency for group {group_id} after attach: {:.2}",
                    evaluation.score
                ),
                Err(e) => tracing::warn!("consistency check failed for group {group_id}: {e}"),
            }
        }
        Ok(())
    }

    async fn create_new_group(
        &self,
        article: &UngroupedArticle,
        article_sig: &ArticleSignature,
        scored: &[ScoredCandidate],
        cache: &mut Vec<CachedGroup>,
    ) -> anyhow::Result<()> {
        let near_misses: Vec<(String, String, f64)> = scored
            .iter()
            .take(NEAR_MISS_LIMIT)
            .map(|c| {
                let cached = &cache[c.cache_index];
                (
                    cached.group.group_label.clone(),
                    cached.group.description.clone(),
                    c.score,
                )
            })
            .collect();

        let (main_topic, group_label, description) =
            match self.request_new_group_definition(article, &near_misses).await {
                Some((topic, label, description)) => (topic, label, description),
                None => {
                    // deterministic fallback: an article is never left ungrouped
                    (
                        category::FALLBACK_CATEGORY.to_string(),
                        format!("Group for article {}", article.id),
                        article.title.clone(),
                    )
                }
            };

        let group_id = self.store.with_tx(|tx| {
            let group_id = Store::create_group_tx(
                tx,
                &main_topic,
                "",
                &group_label,
                &description,
                INITIAL_CONSISTENCY,
            )?;
            Store::move_article_to_group_tx(tx, article.id, group_id)?;
            for entity in &article_sig.primary_entities {
                Store::link_entity_to_group_tx(tx, group_id, entity.entity_id, entity.relevance_score)?;
            }
            Ok(group_id)
        })?;
        tracing::info!("created group {group_id} ('{group_label}') for article {}", article.id);

        let now = timefmt::now_string();
        let group = GroupWithMembers {
            group: Group {
                group_id,
                main_topic,
                sub_topic: String::new(),
                group_label,
                description,
                consistency_score: INITIAL_CONSISTENCY,
                created_at: now.clone(),
                updated_at: now,
            },
            article_ids: vec![article.id],
        };
        let sig = signature::build_group_signature(&self.store, &group)?;
        cache.push(CachedGroup {
            group: group.group,
            article_ids: group.article_ids,
            signature: sig,
        });
        Ok(())
    }

    async fn request_new_group_definition(
        &self,
        article: &UngroupedArticle,
        near_misses: &[(String, String, f64)],
    ) -> Option<(String, String, String)> {
        let mut prompt = String::from(
            "Analyze this article and determine the most appropriate category, a concise group \
             label, and a brief description (1-2 sentences).\n\nChoose one category from this list:\n",
        );
        for cat in category::CATEGORIES {
            prompt.push_str(&format!("- {cat}\n"));
        }
        prompt.push_str(&format!(
            "\nIf none fit well, use 'Other'.\n\nArticle Title: {}\nArticle Content (excerpt):\n{}...\n\n",
            article.title,
            llm::truncate_chars(&article.content, NEW_GROUP_EXCERPT_CHARS)
        ));
        if !near_misses.is_empty() {
            prompt.push_str(
                "Context: this article did not strongly match existing groups. \
                 The closest groups found were:\n",
            );
            for (i, (label, description, score)) in near_misses.iter().enumerate() {
                prompt.push_str(&format!(
                    "- Closest group {} (score {score:.2}): '{label}' ({})\n",
                    i + 1,
                    llm::truncate_chars(description, 100)
                ));
            }
            prompt.push_str(
                "\nConsidering this context, define the NEW group; if the article is close to one \
                 of these, pick a label reflecting the specific nuance this article adds.\n\n",
            );
        }
        prompt.push_str(
            "Return ONLY JSON in this exact format:\n\
             {\n  \"main_topic\": \"Chosen Category\",\n  \"group_label\": \"Concise Group Label\",\n  \"description\": \"Brief description.\"\n}",
        );

        let messages = [
            ChatMessage::system(
                "You are an expert news analyst. Define a new group based on the provided \
                 article, considering the context of near-miss groups if provided. Respond only in JSON.",
            ),
            ChatMessage::user(prompt),
        ];
        let reply = match self.chat.chat(&messages, &self.model).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("new-group call failed for article {}: {e}", article.id);
                return None;
            }
        };
        let parsed = llm::parse_json_reply::<NewGroupReply>(&reply)?;
        let main_topic = category::normalize(parsed.main_topic.as_deref().unwrap_or_default());
        let group_label = parsed
            .group_label
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| format!("Group for article {}", article.id));
        let description = parsed
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| article.title.clone());
        Some((main_topic.to_string(), group_label, description))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedChat;
    use crate::models::article::ScrapedArticle;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    // ── dynamic threshold ──

    #[test]
    fn test_threshold_category_offsets() {
        assert_approx(dynamic_threshold(0.40, "Cybersecurity & Data Privacy", 3), 0.45);
        assert_approx(
            dynamic_threshold(0.40, "Artificial Intelligence & Machine Learning", 3),
            0.43,
        );
        assert_approx(dynamic_threshold(0.40, "Other", 3), 0.37);
        assert_approx(dynamic_threshold(0.40, "Science & Environment", 3), 0.40);
    }

    #[test]
    fn test_threshold_size_buckets() {
        assert_approx(dynamic_threshold(0.40, "Science & Environment", 1), 0.45);
        assert_approx(dynamic_threshold(0.40, "Science & Environment", 2), 0.40);
        assert_approx(dynamic_threshold(0.40, "Science & Environment", 5), 0.40);
        assert_approx(dynamic_threshold(0.40, "Science & Environment", 6), 0.37);
        assert_approx(dynamic_threshold(0.40, "Science & Environment", 10), 0.37);
        assert_approx(dynamic_threshold(0.40, "Science & Environment", 11), 0.35);
    }

    #[test]
    fn test_threshold_clamped() {
        assert_approx(dynamic_threshold(0.05, "Other", 20), 0.10);
        assert_approx(dynamic_threshold(0.95, "Cybersecurity & Data Privacy", 1), 0.90);
    }

    // ── ambiguity zone ──

    #[test]
    fn test_zone_below_threshold() {
        assert!(in_ambiguity_zone(0.31, 0.40, -1.0));
        assert!(!in_ambiguity_zone(0.29, 0.40, -1.0));
    }

    #[test]
    fn test_zone_exactly_at_threshold() {
        assert!(in_ambiguity_zone(0.40, 0.40, -1.0));
    }

    #[test]
    fn test_zone_above_threshold_band() {
        assert!(in_ambiguity_zone(0.44, 0.40, 0.10));
        assert!(!in_ambiguity_zone(0.45, 0.40, 0.10));
    }

    #[test]
    fn test_zone_close_runner_up() {
        // clear of the threshold band but the runner-up is within 0.08
        assert!(in_ambiguity_zone(0.60, 0.40, 0.55));
        assert!(!in_ambiguity_zone(0.60, 0.40, 0.50));
    }

    // ── decision ladder ──

    #[test]
    fn test_decide_clear_attach() {
        assert_eq!(decide(0.60, 0.40, 0.10, true), Decision::Attach);
    }

    #[test]
    fn test_decide_clear_create() {
        assert_eq!(decide(0.20, 0.40, -1.0, true), Decision::CreateNew);
    }

    #[test]
    fn test_decide_ambiguous_goes_to_arbitration() {
        assert_eq!(decide(0.38, 0.40, -1.0, true), Decision::Arbitrate);
        assert_eq!(decide(0.42, 0.40, 0.41, true), Decision::Arbitrate);
    }

    #[test]
    fn test_decide_without_arbitration_is_pure_threshold() {
        assert_eq!(decide(0.42, 0.40, 0.41, false), Decision::Attach);
        assert_eq!(decide(0.38, 0.40, -1.0, false), Decision::CreateNew);
    }

    #[test]
    fn test_threshold_monotonicity() {
        // raising the base threshold can never turn a create into an attach
        let scores = [0.05, 0.25, 0.35, 0.40, 0.45, 0.55, 0.80];
        let seconds = [-1.0, 0.30, 0.39];
        let mut bases: Vec<f64> = Vec::new();
        let mut b = 0.10;
        while b <= 0.90 {
            bases.push(b);
            b += 0.05;
        }
        for &score in &scores {
            for &second in &seconds {
                for (i, &low) in bases.iter().enumerate() {
                    for &high in &bases[i + 1..] {
                        for arbitration in [true, false] {
                            let low_decision = decide(score, low, second, arbitration);
                            let high_decision = decide(score, high, second, arbitration);
                            if low_decision == Decision::CreateNew {
                                assert_ne!(
                                    high_decision,
                                    Decision::Attach,
                                    "score {score} second {second}: create at {low} became attach at {high}"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    // ── arbitration reply parsing ──

    #[test]
    fn test_parse_candidate_id() {
        assert_eq!(parse_arbitration_reply(" 12 ", &[12, 13]), ArbitrationOutcome::Group(12));
    }

    #[test]
    fn test_parse_non_candidate_id() {
        assert_eq!(parse_arbitration_reply("99", &[12, 13]), ArbitrationOutcome::Unparseable);
    }

    #[test]
    fn test_parse_none_verdict() {
        assert_eq!(parse_arbitration_reply("None", &[12]), ArbitrationOutcome::NewGroup);
        assert_eq!(
            parse_arbitration_reply("none of these fit", &[12]),
            ArbitrationOutcome::NewGroup
        );
    }

    #[test]
    fn test_parse_noise() {
        assert_eq!(
            parse_arbitration_reply("group twelve looks right", &[12]),
            ArbitrationOutcome::Unparseable
        );
    }

    // ── end-to-end decision scenarios against an in-memory store ──

    fn insert_article(store: &Store, link: &str, source: &str, published: &str, content: &str) -> i64 {
        store
            .insert_article(&ScrapedArticle {
                link: link.to_string(),
                title: format!("title {link}"),
                content: content.to_string(),
                published_date: published.to_string(),
                source: source.to_string(),
                author: None,
            })
            .unwrap()
            .unwrap()
    }

    fn coordinator(store: Arc<Store>, chat: Arc<dyn ChatApi>) -> GroupingCoordinator {
        let config = GroupingConfig {
            batch_delay_ms: 0,
            ..GroupingConfig::default()
        };
        GroupingCoordinator::new(store, chat, config, "test-model".to_string())
    }

    fn link_entity(store: &Store, article: i64, name: &str, entity_type: &str, relevance: f64) {
        store
            .with_tx(|tx| {
                let id = Store::insert_or_bump_entity_tx(tx, name, entity_type, None)?;
                Store::link_entity_to_article_tx(tx, article, id, relevance, None)
            })
            .unwrap();
    }

    fn make_group(store: &Store, topic: &str, label: &str, members: &[i64]) -> i64 {
        store
            .with_tx(|tx| {
                let id = Store::create_group_tx(tx, topic, "", label, "existing group", 0.7)?;
                for &m in members {
                    Store::move_article_to_group_tx(tx, m, id)?;
                }
                Ok(id)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_attach_by_cve_identity() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // existing group: one bleepingcomputer article about CVE-2024-1234
        let member = insert_article(
            &store,
            "https://bc/1",
            "bleepingcomputer",
            "2024-06-01 12:00:00",
            "CVE-2024-1234 exploited",
        );
        link_entity(&store, member, "Acme Corp", "organization", 0.9);
        store.insert_article_cve(member, "CVE-2024-1234", None).unwrap();
        let group = make_group(
            &store,
            "Cybersecurity & Data Privacy",
            "CVE-2024-1234 exploit activity",
            &[member],
        );

        // new article, same source, same CVE, same core entity, six hours on
        let article = insert_article(
            &store,
            "https://bc/2",
            "bleepingcomputer",
            "2024-06-01 18:00:00",
            "more on CVE-2024-1234",
        );
        link_entity(&store, article, "Acme Corp", "organization", 0.9);
        store.insert_article_cve(article, "CVE-2024-1234", None).unwrap();

        // no LLM call expected: the match is clear
        let coordinator = coordinator(store.clone(), Arc::new(ScriptedChat::failing()));
        let summary = coordinator.run().await.unwrap();
        assert_eq!(summary.attached, 1);
        assert_eq!(summary.created, 0);
        assert_eq!(summary.errors, 0);
        let groups = store.groups_with_members().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group.group_id, group);
        assert_eq!(groups[0].article_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_unrelated_article_creates_new_group() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        insert_article(
            &store,
            "https://space/1",
            "techcrunch",
            "2024-06-01 12:00:00",
            "the Mars helicopter was retired after 72 flights",
        );
        let chat = Arc::new(ScriptedChat::new(vec![
            r#"{"main_topic": "Science & Environment", "group_label": "Mars helicopter retired", "description": "End of the Ingenuity mission."}"#,
        ]));
        let coordinator = coordinator(store.clone(), chat);
        let summary = coordinator.run().await.unwrap();
        assert_eq!(summary.created, 1);

        let groups = store.groups_with_members().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group.main_topic, "Science & Environment");
        assert_eq!(groups[0].group.group_label, "Mars helicopter retired");
        assert_eq!(groups[0].article_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_category_normalizes_to_other() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        insert_article(&store, "https://x/1", "src", "2024-06-01 12:00:00", "body");
        let chat = Arc::new(ScriptedChat::new(vec![
            r#"{"main_topic": "Sports", "group_label": "some label", "description": "d"}"#,
        ]));
        coordinator(store.clone(), chat).run().await.unwrap();
        let groups = store.groups_with_members().unwrap();
        assert_eq!(groups[0].group.main_topic, "Other");
    }

    #[tokio::test]
    async fn test_llm_failure_still_creates_group() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let article = insert_article(&store, "https://x/1", "src", "2024-06-01 12:00:00", "body");
        let coordinator = coordinator(store.clone(), Arc::new(ScriptedChat::failing()));
        let summary = coordinator.run().await.unwrap();
        assert_eq!(summary.created, 1);
        let groups = store.groups_with_members().unwrap();
        assert_eq!(groups[0].group.main_topic, "Other");
        assert_eq!(groups[0].group.group_label, format!("Group for article {article}"));
    }

    /// Two candidate groups in the ambiguity zone; arbitration picks one.
    fn ambiguous_scenario(store: &Arc<Store>) -> (i64, i64, i64) {
        // group A's member shares a CVE and both companies with the new
        // article; score = 0.25 (companies) + 0.15 (cve) = 0.40
        let member_a = insert_article(
            store,
            "https://a/1",
            "sourceA",
            "2024-05-20 00:00:00",
            "about acme",
        );
        store
            .with_tx(|tx| {
                Store::insert_article_company_tx(tx, member_a, "Acme")?;
                Store::insert_article_company_tx(tx, member_a, "Globex")?;
                Ok(())
            })
            .unwrap();
        store.insert_article_cve(member_a, "CVE-2024-0001", None).unwrap();
        let group_a = make_group(store, "Science & Environment", "group a", &[member_a]);

        // group B's member shares one of two companies; score = 0.125
        let member_b = insert_article(
            store,
            "https://b/1",
            "sourceB",
            "2024-05-20 00:00:00",
            "about acme too",
        );
        store
            .with_tx(|tx| Store::insert_article_company_tx(tx, member_b, "Acme").map(|_| ()))
            .unwrap();
        let group_b = make_group(store, "Science & Environment", "group b", &[member_b]);

        // the new article: published 100h after the members so the temporal
        // adjustment is zero, from a third source
        let article = insert_article(
            store,
            "https://c/1",
            "sourceC",
            "2024-05-24 04:00:00",
            "acme and globex",
        );
        store
            .with_tx(|tx| {
                Store::insert_article_company_tx(tx, article, "Acme")?;
                Store::insert_article_company_tx(tx, article, "Globex")?;
                Ok(())
            })
            .unwrap();
        store.insert_article_cve(article, "CVE-2024-0001", None).unwrap();
        (group_a, group_b, article)
    }

    #[tokio::test]
    async fn test_ambiguous_match_resolved_by_arbitration() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (group_a, _, article) = ambiguous_scenario(&store);
        // score 0.40 vs threshold 0.45 (singleton): in the zone
        let verdict = group_a.to_string();
        let chat = Arc::new(ScriptedChat::new(vec![verdict.as_str()]));
        let summary = coordinator(store.clone(), chat).run().await.unwrap();
        assert_eq!(summary.attached, 1);
        let groups = store.groups_with_members().unwrap();
        let a = groups.iter().find(|g| g.group.group_id == group_a).unwrap();
        assert!(a.article_ids.contains(&article));
    }

    #[tokio::test]
    async fn test_arbitration_none_creates_new_group() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        ambiguous_scenario(&store);
        let chat = Arc::new(ScriptedChat::new(vec![
            "None",
            r#"{"main_topic": "Other", "group_label": "standalone", "description": "d"}"#,
        ]));
        let summary = coordinator(store.clone(), chat).run().await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(store.groups_with_members().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_arbitration_noise_falls_back_to_threshold() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        ambiguous_scenario(&store);
        // 0.40 < 0.45 threshold, so the fallback creates a new group; the
        // second reply feeds the new-group definition call
        let chat = Arc::new(ScriptedChat::new(vec![
            "hard to say really",
            r#"{"main_topic": "Other", "group_label": "fallback group", "description": "d"}"#,
        ]));
        let summary = coordinator(store.clone(), chat).run().await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.attached, 0);
    }

    #[tokio::test]
    async fn test_new_group_links_article_entities() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let article = insert_article(&store, "https://x/1", "src", "2024-06-01 12:00:00", "body");
        link_entity(&store, article, "Acme Corp", "organization", 0.9);
        let chat = Arc::new(ScriptedChat::new(vec![
            r#"{"main_topic": "Other", "group_label": "acme", "description": "d"}"#,
        ]));
        coordinator(store.clone(), chat).run().await.unwrap();

        // the primary entity was carried onto the new group
        let groups = store.groups_with_members().unwrap();
        let linked = store.entities_for_group(groups[0].group.group_id).unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].entity_name, "Acme Corp");
        assert!((linked[0].relevance_score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_newest_first_lets_older_articles_join_new_groups() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // the newer article is processed first and seeds a group; the older
        // twin then attaches to it
        let newer = insert_article(
            &store,
            "https://x/2",
            "src",
            "2024-06-02 12:00:00",
            "acme breach details",
        );
        let older = insert_article(
            &store,
            "https://x/1",
            "src",
            "2024-06-01 12:00:00",
            "acme breach first report",
        );
        for id in [newer, older] {
            link_entity(&store, id, "Acme Corp", "organization", 0.95);
            store.insert_article_cve(id, "CVE-2024-7777", None).unwrap();
        }
        let chat = Arc::new(ScriptedChat::new(vec![
            r#"{"main_topic": "Cybersecurity & Data Privacy", "group_label": "acme breach", "description": "d"}"#,
        ]));
        let summary = coordinator(store.clone(), chat).run().await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.attached, 1);
        let groups = store.groups_with_members().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].article_ids.len(), 2);
    }
}
