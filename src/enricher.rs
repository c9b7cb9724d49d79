use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EnricherConfig;
use crate::llm::{self, ChatApi, ChatMessage};
use crate::mitre::MitreClient;
use crate::models::entity::EntityType;
use crate::store::Store;
use crate::timefmt;

pub const CVE_PATTERN: &str = r"\bCVE-\d{4}-\d{4,7}\b";
const URL_PATTERN: &str = r#"https?://[^\s"'<>\)\]]+"#;
const QUOTE_PATTERN: &str = r#""([^"]{40,300})""#;

const ARTICLE_EXCERPT_CHARS: usize = 3000;
const CONTEXT_SNIPPET_CHARS: usize = 300;

/// Rough token estimate: word count times 1.3.
pub fn approximate_tokens(text: &str) -> usize {
    (text.split_whitespace().count() as f64 * 1.3).round() as usize
}

/// Pack (id, text) items into batches bounded by an approximate token
/// budget, shortest first. An item larger than the budget is emitted alone;
/// items are never split.
pub fn pack_batches(mut items: Vec<(i64, String)>, budget: usize) -> Vec<Vec<(i64, String)>> {
    items.sort_by_key(|(_, text)| text.len());
    let mut batches = Vec::new();
    let mut current: Vec<(i64, String)> = Vec::new();
    let mut current_tokens = 0usize;

    for (id, text) in items {
        let tokens = approximate_tokens(&text);
        if tokens > budget {
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            batches.push(vec![(id, text)]);
            continue;
        }
        if current_tokens + tokens > budget && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push((id, text));
        current_tokens += tokens;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

// ── LLM response shapes ──

#[derive(Debug, Deserialize)]
struct EntityExtractionReply {
    #[serde(default)]
    articles: Vec<ArticleEntities>,
}

#[derive(Debug, Deserialize)]
struct ArticleEntities {
    article_id: serde_json::Value,
    #[serde(default)]
    entities: Vec<ExtractedEntity>,
}

#[derive(Debug, Deserialize)]
struct ExtractedEntity {
    #[serde(default)]
    name: String,
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(rename = "type", default)]
    type_alias: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    relevance: Option<f64>,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompanyExtractionReply {
    #[serde(default)]
    extractions: Vec<ArticleCompanies>,
}

#[derive(Debug, Deserialize)]
struct ArticleCompanies {
    article_id: serde_json::Value,
    #[serde(default)]
    companies: Vec<String>,
}

/// LLM replies hand article ids back as either numbers or strings.
fn parse_id(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Enriches raw articles with structured facts: typed entities, company
/// names, CVE mentions plus remote metadata, external references, and
/// quotes. Every pass is idempotent over already-enriched articles.
pub struct Enricher {
    store: Arc<Store>,
    chat: Arc<dyn ChatApi>,
    mitre: MitreClient,
    config: EnricherConfig,
    model: String,
    cve_re: Regex,
    url_re: Regex,
    quote_re: Regex,
}

impl Enricher {
    pub fn new(
        store: Arc<Store>,
        chat: Arc<dyn ChatApi>,
        mitre: MitreClient,
        config: EnricherConfig,
        model: String,
    ) -> Self {
        Self {
            store,
            chat,
            mitre,
            config,
            model,
            cve_re: Regex::new(CVE_PATTERN).expect("cve regex"),
            url_re: Regex::new(URL_PATTERN).expect("url regex"),
            quote_re: Regex::new(QUOTE_PATTERN).expect("quote regex"),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.extract_entities().await?;
        self.extract_companies().await?;
        self.scan_cve_mentions()?;
        self.refresh_cve_metadata().await?;
        Ok(())
    }

    // ── Entity pass ──

    async fn extract_entities(&self) -> anyhow::Result<()> {
        let pending = self.store.articles_missing_entities()?;
        if pending.is_empty() {
            tracing::info!("all articles already have entity extractions");
            return Ok(());
        }

        // references and quotes are regex work over the same article set;
        // do them before the LLM round-trip so a failed call costs nothing
        for (article_id, text) in &pending {
            if let Err(e) = self.extract_references_and_quotes(*article_id, text) {
                tracing::warn!("reference extraction failed for article {article_id}: {e}");
            }
        }

        let batches = pack_batches(pending, self.config.token_budget);
        let total = batches.len();
        tracing::info!("entity extraction: {total} batches");

        for (idx, batch) in batches.into_iter().enumerate() {
            tracing::info!("entity extraction batch {}/{total} ({} articles)", idx + 1, batch.len());
            if let Err(e) = self.extract_entity_batch(&batch).await {
                tracing::warn!("entity extraction batch {} failed: {e}", idx + 1);
            }
            tokio::time::sleep(Duration::from_millis(self.config.request_delay_ms)).await;
        }
        Ok(())
    }

    async fn extract_entity_batch(&self, batch: &[(i64, String)]) -> anyhow::Result<()> {
        let mut prompt = String::from(
            "Extract important named entities from these articles. \
             Include people, organizations, technologies, products, places, and key concepts. \
             For each entity, determine its type and provide a brief description.\n\n\
             Return only JSON with the format:\n\
             { \"articles\": [ { \"article_id\": \"...\", \"entities\": [\
             { \"name\": \"Entity Name\", \"type\": \"person|organization|technology|product|place|concept|event\", \
             \"description\": \"Brief description\", \"relevance\": 0.1, \
             \"context\": \"snippet where entity appears\" } ] } ] }\n\n",
        );
        for (id, text) in batch {
            prompt.push_str(&format!(
                "Article ID={id}:\n{}...\n\n",
                llm::truncate_chars(text, ARTICLE_EXCERPT_CHARS)
            ));
        }
        let messages = [
            ChatMessage::system("Extract named entities from multiple articles in batch mode."),
            ChatMessage::user(prompt),
        ];
        let reply = self.chat.chat(&messages, &self.model).await?;
        let Some(parsed) = llm::parse_json_reply::<EntityExtractionReply>(&reply) else {
            anyhow::bail!("unparseable entity extraction reply");
        };

        let mut stored = 0usize;
        for article in parsed.articles {
            let Some(article_id) = parse_id(&article.article_id) else {
                tracing::warn!("entity reply with bad article id: {:?}", article.article_id);
                continue;
            };
            for entity in article.entities {
                let name = entity.name.trim().to_string();
                if name.is_empty() {
                    continue;
                }
                let raw_type = entity
                    .entity_type
                    .or(entity.type_alias)
                    .unwrap_or_default();
                let entity_type = EntityType::parse(&raw_type);
                let relevance = entity.relevance.unwrap_or(1.0).clamp(0.0, 1.0);
                let context = entity
                    .context
                    .as_deref()
                    .map(|c| llm::truncate_chars(c, CONTEXT_SNIPPET_CHARS).to_string());
                if let Err(e) =
                    self.persist_entity(article_id, &name, entity_type, entity.description.as_deref(), relevance, context.as_deref())
                {
                    tracing::warn!("failed to store entity '{name}' for article {article_id}: {e}");
                } else {
                    stored += 1;
                }
            }
        }
        tracing::info!("stored {stored} entity links");
        Ok(())
    }

    fn persist_entity(
        &self,
        article_id: i64,
        name: &str,
        entity_type: EntityType,
        description: Option<&str>,
        relevance: f64,
        context: Option<&str>,
    ) -> anyhow::Result<()> {
        // a repeated entity for the same article must not bump the mention
        // counter again
        if self.store.article_has_entity(article_id, name, entity_type.as_str())? {
            return Ok(());
        }
        self.store.with_tx(|tx| {
            let entity_id =
                Store::insert_or_bump_entity_tx(tx, name, entity_type.as_str(), description)?;
            Store::link_entity_to_article_tx(tx, article_id, entity_id, relevance, context)?;
            if entity_type == EntityType::Event {
                let event_id = Store::upsert_named_event_tx(tx, name, "event", None)?;
                Store::link_article_event_tx(tx, article_id, event_id, context)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn extract_references_and_quotes(&self, article_id: i64, text: &str) -> anyhow::Result<()> {
        self.store.with_tx(|tx| {
            for m in self.url_re.find_iter(text) {
                let raw = m.as_str().trim_end_matches(['.', ',', ';']);
                let Ok(parsed) = url::Url::parse(raw) else {
                    continue;
                };
                let Some(host) = parsed.host_str() else {
                    continue;
                };
                let normalized = format!("{}://{}{}", parsed.scheme(), host, parsed.path());
                Store::insert_external_reference_tx(tx, article_id, raw, &normalized, host, "external")?;
            }
            for cap in self.quote_re.captures_iter(text) {
                let quote = cap[1].trim();
                let hash = format!("{:x}", Sha256::digest(quote.as_bytes()));
                let quote_id = Store::insert_quote_tx(tx, quote, &hash, None)?;
                Store::link_article_quote_tx(tx, article_id, quote_id)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    // ── Company pass ──

    async fn extract_companies(&self) -> anyhow::Result<()> {
        let pending = self.store.articles_missing_companies()?;
        if pending.is_empty() {
            tracing::info!("all articles already have company extractions");
            return Ok(());
        }
        let batches = pack_batches(pending, self.config.token_budget);
        let total = batches.len();
        for (idx, batch) in batches.into_iter().enumerate() {
            tracing::info!("company extraction batch {}/{total} ({} articles)", idx + 1, batch.len());
            if let Err(e) = self.extract_company_batch(&batch).await {
                tracing::warn!("company extraction batch {} failed: {e}", idx + 1);
            }
            tokio::time::sleep(Duration::from_millis(self.config.request_delay_ms)).await;
        }
        Ok(())
    }

    async fn extract_company_batch(&self, batch: &[(i64, String)]) -> anyhow::Result<()> {
        let mut prompt = String::from(
            "You are a named-entity recognition AI. For each article, extract all company names mentioned. \
             Return only JSON with the format:\n\
             { \"extractions\": [ {\"article_id\": \"...\", \"companies\": [\"CompanyA\", \"CompanyB\"]} ] }\n\n",
        );
        for (id, text) in batch {
            prompt.push_str(&format!(
                "Article ID={id}:\n{}\n\n",
                llm::truncate_chars(text, ARTICLE_EXCERPT_CHARS)
            ));
        }
        let messages = [
            ChatMessage::system("Extract company names from the provided article texts."),
            ChatMessage::user(prompt),
        ];
        let reply = self.chat.chat(&messages, &self.model).await?;
        let Some(parsed) = llm::parse_json_reply::<CompanyExtractionReply>(&reply) else {
            anyhow::bail!("unparseable company extraction reply");
        };

        let mut stored = 0usize;
        self.store.with_tx(|tx| {
            for extraction in &parsed.extractions {
                let Some(article_id) = parse_id(&extraction.article_id) else {
                    continue;
                };
                for company in &extraction.companies {
                    let name = company.trim();
                    if !name.is_empty() && Store::insert_article_company_tx(tx, article_id, name)? {
                        stored += 1;
                    }
                }
            }
            Ok(())
        })?;
        tracing::info!("stored {stored} company mentions");
        Ok(())
    }

    // ── CVE passes ──

    pub fn extract_cves(&self, text: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .cve_re
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn scan_cve_mentions(&self) -> anyhow::Result<()> {
        let articles = self.store.articles_for_cve_scan()?;
        let mut inserted = 0usize;
        for (article_id, published_date, content) in articles {
            for cve in self.extract_cves(&content) {
                if self.store.insert_article_cve(article_id, &cve, Some(&published_date))? {
                    inserted += 1;
                }
            }
        }
        tracing::info!("cve scan: {inserted} new mentions");
        Ok(())
    }

    async fn refresh_cve_metadata(&self) -> anyhow::Result<()> {
        let counts = self.store.cve_mention_counts()?;
        let total = counts.len();
        let mut updated = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;

        for (cve_id, times_mentioned) in counts {
            if !self.cve_re.is_match(&cve_id) {
                tracing::warn!("skipping invalid cve id: {cve_id}");
                failed += 1;
                continue;
            }
            if let Some(updated_at) = self.store.cve_info_updated_at(&cve_id)? {
                if let Some(ts) = timefmt::parse_utc(&updated_at) {
                    let age = chrono::Utc::now() - ts;
                    if age.num_days() < self.config.cve_refresh_days {
                        skipped += 1;
                        continue;
                    }
                }
            }

            match self.mitre.fetch(&cve_id).await {
                Ok(Some((record, raw))) => {
                    let cna = &record.containers.cna;
                    self.store.upsert_cve_info(
                        &cve_id,
                        cna.base_score(),
                        &cna.vendor_string(),
                        &cna.products_string(),
                        &self.mitre.record_url(&cve_id),
                        &cna.vendor_link(),
                        &cna.solution_string(),
                        times_mentioned,
                        &raw,
                    )?;
                    updated += 1;
                }
                Ok(None) => {
                    failed += 1;
                }
                Err(e) => {
                    tracing::warn!("cve metadata fetch failed for {cve_id}: {e}");
                    failed += 1;
                }
            }
            tokio::time::sleep(Duration::from_millis(self.config.request_delay_ms)).await;
        }
        tracing::info!(
            "cve metadata refresh: {total} candidates, {updated} updated, {skipped} recent, {failed} failed"
        );
        Ok(())
    }
}
