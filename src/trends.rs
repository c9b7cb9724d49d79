use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::category;
use crate::config::TrendingConfig;
use crate::enricher::pack_batches;
use crate::llm::{self, ChatApi, ChatMessage};
use crate::models::entity::EntityType;
use crate::store::Store;

const TRENDING_ENTITY_LIMIT: i64 = 15;
const CO_OCCURRENCE_LIMIT: i64 = 15;
const EXEMPLAR_LIMIT: i64 = 3;
const RECENT_GROUP_DAYS: i64 = 7;
const RECENT_GROUP_LIMIT: i64 = 5;
const ARTICLE_EXCERPT_CHARS: usize = 3000;
const PROMPT_ENTITY_LIMIT: usize = 5;

const DEFAULT_IMPORTANCE: f64 = 5.0;
const DEFAULT_CONFIDENCE: f64 = 0.7;
const KEY_ENTITY_RELEVANCE: f64 = 0.8;

const FLOOR_ARTICLE_LIMIT: i64 = 10;
const FLOOR_ENTITY_LIMIT: i64 = 5;
const FLOOR_IMPORTANCE: f64 = 5.0;
const FLOOR_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Deserialize)]
struct TrendsReply {
    #[serde(default)]
    trends: Vec<ParsedTrend>,
}

#[derive(Debug, Deserialize)]
struct ParsedTrend {
    #[serde(default)]
    trend_label: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    importance_score: Option<f64>,
    #[serde(default)]
    confidence_score: Option<f64>,
    #[serde(default)]
    key_entities: Vec<KeyEntity>,
    #[serde(default)]
    articles: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct KeyEntity {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    entity_type: Option<String>,
}

fn parse_article_id(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct TrendSummary {
    pub saved: usize,
    pub promoted: usize,
    pub errors: usize,
}

/// Sliding-window trend detector: per category, clusters recent articles
/// into short-lived trends via the LLM, then tops the set up to a
/// configured minimum from popular groups.
pub struct TrendSynthesizer {
    store: Arc<Store>,
    chat: Arc<dyn ChatApi>,
    config: TrendingConfig,
    token_budget: usize,
    model: String,
}

impl TrendSynthesizer {
    pub fn new(
        store: Arc<Store>,
        chat: Arc<dyn ChatApi>,
        config: TrendingConfig,
        token_budget: usize,
        model: String,
    ) -> Self {
        Self {
            store,
            chat,
            config,
            token_budget,
            model,
        }
    }

    pub async fn run(&self) -> anyhow::Result<TrendSummary> {
        let mut summary = TrendSummary::default();
        let expired = self.store.delete_trends_older_than(self.config.window_hours)?;
        if expired > 0 {
            tracing::info!("expired {expired} trends older than {}h", self.config.window_hours);
        }

        for cat in category::CATEGORIES {
            match self.synthesize_category(cat).await {
                Ok(saved) => summary.saved += saved,
                Err(e) => {
                    tracing::warn!("trend synthesis failed for category '{cat}': {e}");
                    summary.errors += 1;
                }
            }
        }

        summary.promoted = self.ensure_minimum_trends()?;
        tracing::info!(
            "trend run finished: {} saved, {} promoted, {} category errors",
            summary.saved,
            summary.promoted,
            summary.errors
        );
        Ok(summary)
    }

    async fn synthesize_category(&self, cat: &str) -> anyhow::Result<usize> {
        let articles = self
            .store
            .articles_for_category_since(cat, self.config.window_hours)?;
        if articles.is_empty() {
            tracing::debug!("no recent articles for category '{cat}'");
            return Ok(0);
        }
        tracing::info!("identifying trends for '{cat}' ({} articles)", articles.len());

        let entity_context = self.entity_context(cat)?;
        let group_context = self.group_context(cat)?;

        let mut dates = std::collections::HashMap::new();
        for article in &articles {
            dates.insert(article.id, article.published_date.clone());
        }
        let items: Vec<(i64, String)> = articles
            .into_iter()
            .map(|a| (a.id, format!("{} - {}", a.title, a.content)))
            .collect();
        let batches = pack_batches(items, self.token_budget);

        let mut saved = 0usize;
        let total = batches.len();
        for (idx, batch) in batches.into_iter().enumerate() {
            tracing::info!("trend batch {}/{total} for '{cat}'", idx + 1);
            let prompt = self.build_prompt(cat, &entity_context, &group_context, &batch, &dates)?;
            let messages = [
                ChatMessage::system(format!(
                    "Analyze recent articles to identify trends in '{cat}'. \
                     Focus on meaningful patterns in the last {} hours.",
                    self.config.window_hours
                )),
                ChatMessage::user(prompt),
            ];
            let reply = match self.chat.chat(&messages, &self.model).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!("trend call failed for '{cat}' batch {}: {e}", idx + 1);
                    continue;
                }
            };
            let Some(parsed) = llm::parse_json_reply::<TrendsReply>(&reply) else {
                tracing::warn!("unparseable trend reply for '{cat}' batch {}", idx + 1);
                continue;
            };
            saved += self.save_trends(cat, parsed.trends);
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(saved)
    }

    fn entity_context(&self, cat: &str) -> anyhow::Result<String> {
        let mut context = String::from("RECENT TRENDING ENTITIES:\n");
        let trending = self
            .store
            .trending_entities(self.config.window_hours, TRENDING_ENTITY_LIMIT)?;
        if trending.is_empty() {
            context.push_str("(No trending entities found)\n");
        }
        for entity in &trending {
            context.push_str(&format!(
                "- {} ({}): mentioned in {} recent articles\n",
                entity.entity_name, entity.entity_type, entity.recent_mentions
            ));
        }

        context.push_str("\nENTITY CO-OCCURRENCES:\n");
        let pairs = self
            .store
            .entity_co_occurrences(cat, self.config.window_hours, CO_OCCURRENCE_LIMIT)?;
        if pairs.is_empty() {
            context.push_str("(No co-occurrences found)\n");
        }
        for pair in &pairs {
            context.push_str(&format!(
                "- {} & {}: appear together in {} articles\n",
                pair.entity1_name, pair.entity2_name, pair.co_occurrence_count
            ));
        }
        Ok(context)
    }

    /// Exemplar patterns and recent well-formed groups of the category,
    /// included so trend labels stay consistent with past grouping.
    fn group_context(&self, cat: &str) -> anyhow::Result<String> {
        let mut context = String::new();
        let exemplars = self.store.exemplars_for_category(cat, EXEMPLAR_LIMIT)?;
        if !exemplars.is_empty() {
            context.push_str("EXEMPLAR PATTERNS FOR THIS CATEGORY:\n");
            for (name, description, titles) in &exemplars {
                context.push_str(&format!(
                    "- {name}: {}\n",
                    description.as_deref().unwrap_or("(no description)")
                ));
                for title in titles {
                    context.push_str(&format!("    e.g. {title}\n"));
                }
            }
        }
        let recent = self
            .store
            .recent_consistent_groups(cat, RECENT_GROUP_DAYS, RECENT_GROUP_LIMIT)?;
        if !recent.is_empty() {
            context.push_str("\nRECENT GROUPS IN THIS CATEGORY:\n");
            for (group, article_count) in &recent {
                context.push_str(&format!(
                    "- '{}' ({article_count} articles): {}\n",
                    group.group_label, group.description
                ));
            }
        }
        Ok(context)
    }

    fn build_prompt(
        &self,
        cat: &str,
        entity_context: &str,
        group_context: &str,
        batch: &[(i64, String)],
        dates: &std::collections::HashMap<i64, String>,
    ) -> anyhow::Result<String> {
        let mut article_text = String::new();
        for (id, text) in batch {
            let entities = self.store.entities_for_article(*id)?;
            let entity_summary = entities
                .iter()
                .take(PROMPT_ENTITY_LIMIT)
                .map(|e| format!("{} ({})", e.entity_name, e.entity_type))
                .collect::<Vec<_>>()
                .join(", ");
            article_text.push_str(&format!("Article ID={id}:"));
            if let Some(date) = dates.get(id) {
                article_text.push_str(&format!("\nPublished: {date}"));
            }
            if !entity_summary.is_empty() {
                article_text.push_str(&format!("\nKey entities: {entity_summary}"));
            }
            article_text.push_str(&format!(
                "\n{}\n\n",
                llm::truncate_chars(text, ARTICLE_EXCERPT_CHARS)
            ));
        }

        Ok(format!(
            "Analyze these articles from the '{cat}' category published in the last {} hours. \
             Identify significant trends or emerging stories. Group articles covering the same subject.\n\n\
             {group_context}\n{entity_context}\n\
             For each trend, provide:\n\
             1. trend_label: A short, descriptive name\n\
             2. summary: A 2-3 sentence summary\n\
             3. importance_score: 1-10\n\
             4. confidence_score: 0.1-1.0\n\
             5. key_entities: Array of important entities [{{\"name\": \"...\", \"type\": \"...\"}}]\n\
             6. articles: Array of article IDs\n\n\
             Return valid JSON only:\n\
             {{ \"trends\": [ {{\"trend_label\": \"...\", \"summary\": \"...\", \"importance_score\": 5, \
             \"confidence_score\": 0.8, \"key_entities\": [{{\"name\": \"...\", \"type\": \"...\"}}], \"articles\": [1] }} ] }}\n\n\
             Articles to analyze:\n\n{article_text}",
            self.config.window_hours
        ))
    }

    /// Persist one batch of parsed trends. Each trend gets its own
    /// transaction; a failed trend is logged and does not abort siblings.
    fn save_trends(&self, cat: &str, trends: Vec<ParsedTrend>) -> usize {
        let mut saved = 0usize;
        for trend in trends {
            let label = trend
                .trend_label
                .as_deref()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .unwrap_or("Untitled Trend")
                .to_string();
            let summary = trend.summary.unwrap_or_default();
            let importance = trend
                .importance_score
                .unwrap_or(DEFAULT_IMPORTANCE)
                .clamp(1.0, 10.0);
            let confidence = trend
                .confidence_score
                .unwrap_or(DEFAULT_CONFIDENCE)
                .clamp(0.0, 1.0);

            let result = self.store.with_tx(|tx| {
                let trend_id = Store::insert_trend_tx(tx, cat, &label, &summary, importance, confidence)?;
                for raw_id in &trend.articles {
                    match parse_article_id(raw_id) {
                        Some(article_id) => {
                            if !Store::link_trend_article_tx(tx, trend_id, article_id)? {
                                tracing::warn!(
                                    "skipping unknown article id {article_id} for trend '{label}'"
                                );
                            }
                        }
                        None => tracing::warn!("skipping invalid article id {raw_id:?} for trend '{label}'"),
                    }
                }
                for entity in &trend.key_entities {
                    let name = entity.name.trim();
                    if name.is_empty() {
                        continue;
                    }
                    let entity_type = EntityType::parse(entity.entity_type.as_deref().unwrap_or_default());
                    let entity_id = Store::insert_or_bump_entity_tx(tx, name, entity_type.as_str(), None)?;
                    Store::link_entity_to_trend_tx(tx, trend_id, entity_id, KEY_ENTITY_RELEVANCE)?;
                }
                Ok(trend_id)
            });
            match result {
                Ok(trend_id) => {
                    tracing::info!("saved trend {trend_id} '{label}' in '{cat}'");
                    saved += 1;
                }
                Err(e) => tracing::warn!("failed to save trend '{label}' in '{cat}': {e}"),
            }
        }
        saved
    }

    /// Promote popular recent groups into synthetic trends until the
    /// configured minimum is met.
    fn ensure_minimum_trends(&self) -> anyhow::Result<usize> {
        let current = self.store.trend_count()? as usize;
        if current >= self.config.min_trends {
            tracing::info!(
                "have {current} trends (minimum {}), no floor action needed",
                self.config.min_trends
            );
            return Ok(0);
        }
        let needed = self.config.min_trends - current;
        tracing::info!("need {needed} more trends to reach the minimum of {}", self.config.min_trends);

        let candidates = self
            .store
            .popular_groups_not_trending(self.config.window_hours, (needed * 2) as i64)?;
        if candidates.is_empty() {
            tracing::info!("no suitable recent groups to promote");
            return Ok(0);
        }

        let mut promoted = 0usize;
        let mut used_labels: Vec<String> = Vec::new();
        for (group_id, main_topic, label, _article_count) in candidates {
            if promoted >= needed {
                break;
            }
            if used_labels.contains(&label) {
                continue;
            }
            let article_ids = self
                .store
                .recent_article_ids_for_group(group_id, FLOOR_ARTICLE_LIMIT)?;
            if article_ids.is_empty() {
                continue;
            }
            let entities = self
                .store
                .top_entities_for_articles(&article_ids, FLOOR_ENTITY_LIMIT)?;
            let summary = format!("Recent developments related to {label}");

            let result = self.store.with_tx(|tx| {
                let trend_id = Store::insert_trend_tx(
                    tx,
                    &main_topic,
                    &label,
                    &summary,
                    FLOOR_IMPORTANCE,
                    FLOOR_CONFIDENCE,
                )?;
                for &article_id in &article_ids {
                    Store::link_trend_article_tx(tx, trend_id, article_id)?;
                }
                for (entity_id, _, _) in &entities {
                    Store::link_entity_to_trend_tx(tx, trend_id, *entity_id, KEY_ENTITY_RELEVANCE)?;
                }
                Ok(trend_id)
            });
            match result {
                Ok(trend_id) => {
                    tracing::info!("promoted group {group_id} ('{label}') to trend {trend_id}");
                    used_labels.push(label);
                    promoted += 1;
                }
                Err(e) => tracing::warn!("failed to promote group {group_id}: {e}"),
            }
        }
        Ok(promoted)
    }
}
