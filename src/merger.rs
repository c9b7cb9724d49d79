use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::llm::{self, ChatApi, ChatMessage};
use crate::models::group::GroupWithMembers;
use crate::signature::{self, GroupSignature};
use crate::similarity;
use crate::store::Store;
use crate::timefmt;

#[derive(Debug, Deserialize)]
struct MergeLabelReply {
    #[serde(default)]
    merged_label: Option<String>,
    #[serde(default)]
    merged_description: Option<String>,
}

#[derive(Debug, Default)]
pub struct MergeSummary {
    pub merged_pairs: usize,
    pub errors: usize,
}

/// Which of two groups survives a merge: larger membership wins, then the
/// older group, then the smaller id.
pub fn pick_survivor(a: &GroupWithMembers, b: &GroupWithMembers) -> bool {
    // true = a survives
    match a.article_ids.len().cmp(&b.article_ids.len()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => {
            let a_created = timefmt::parse_utc(&a.group.created_at);
            let b_created = timefmt::parse_utc(&b.group.created_at);
            match (a_created, b_created) {
                (Some(x), Some(y)) if x != y => x < y,
                _ => a.group.group_id < b.group.group_id,
            }
        }
    }
}

/// Fallback naming when the LLM cannot supply a unified label.
fn fallback_label(survivor: &GroupWithMembers, loser: &GroupWithMembers) -> (String, String) {
    (
        format!("{} / {}", survivor.group.group_label, loser.group.group_label),
        format!("{}\n---\n{}", survivor.group.description, loser.group.description),
    )
}

/// Periodic pass that collapses duplicate groups. Each group takes part in
/// at most one merge per pass; repeated passes converge.
pub struct Merger {
    store: Arc<Store>,
    chat: Arc<dyn ChatApi>,
    threshold: f64,
    model: String,
}

impl Merger {
    pub fn new(store: Arc<Store>, chat: Arc<dyn ChatApi>, threshold: f64, model: String) -> Self {
        Self {
            store,
            chat,
            threshold,
            model,
        }
    }

    pub async fn run(&self) -> anyhow::Result<MergeSummary> {
        let mut summary = MergeSummary::default();
        let groups = self.store.groups_with_members()?;
        if groups.len() < 2 {
            tracing::info!("fewer than two groups, nothing to merge");
            return Ok(summary);
        }

        tracing::info!("building signatures for {} groups before merging", groups.len());
        let mut with_signatures: Vec<(GroupWithMembers, GroupSignature)> = Vec::new();
        for group in groups {
            match signature::build_group_signature(&self.store, &group) {
                Ok(sig) => with_signatures.push((group, sig)),
                Err(e) => {
                    tracing::warn!("signature failed for group {}: {e}", group.group.group_id)
                }
            }
        }

        let mut processed: HashSet<i64> = HashSet::new();
        for i in 0..with_signatures.len() {
            for j in (i + 1)..with_signatures.len() {
                let (group_a, sig_a) = &with_signatures[i];
                let (group_b, sig_b) = &with_signatures[j];
                if processed.contains(&group_a.group.group_id)
                    || processed.contains(&group_b.group.group_id)
                {
                    continue;
                }

                let similarity = self.group_similarity(sig_a, sig_b).await;
                tracing::debug!(
                    "group {} vs {}: similarity {:.4} (threshold {})",
                    group_a.group.group_id,
                    group_b.group.group_id,
                    similarity,
                    self.threshold
                );
                if similarity < self.threshold {
                    continue;
                }

                tracing::info!(
                    "merging groups {} ('{}') and {} ('{}'), similarity {:.3}",
                    group_a.group.group_id,
                    group_a.group.group_label,
                    group_b.group.group_id,
                    group_b.group.group_label,
                    similarity
                );
                let (survivor, loser) = if pick_survivor(group_a, group_b) {
                    (group_a, group_b)
                } else {
                    (group_b, group_a)
                };

                let (label, description) = self.unified_label(survivor, loser).await;
                match self.merge_pair(survivor, loser, &label, &description) {
                    Ok(()) => {
                        summary.merged_pairs += 1;
                        processed.insert(group_a.group.group_id);
                        processed.insert(group_b.group.group_id);
                    }
                    Err(e) => {
                        tracing::error!(
                            "merge of {} into {} failed: {e}",
                            loser.group.group_id,
                            survivor.group.group_id
                        );
                        summary.errors += 1;
                    }
                }
                // group_a took part in a merge; move on to the next i
                break;
            }
        }

        tracing::info!(
            "merge pass finished: {} pairs merged, {} errors",
            summary.merged_pairs,
            summary.errors
        );
        Ok(summary)
    }

    /// Signature similarity averaged over both directions, blended with an
    /// LLM rating of how alike the labels and descriptions are. The blend
    /// always applies; a missing description (like a failed or unparseable
    /// rating) contributes 0.0 to the label term.
    async fn group_similarity(&self, a: &GroupSignature, b: &GroupSignature) -> f64 {
        let signature_avg = similarity::score_group_to_group(a, b);
        let label_similarity = if a.description.is_empty() || b.description.is_empty() {
            0.0
        } else {
            let prompt = format!(
                "Rate the semantic similarity of these two group concepts on a scale of 0.0 to 1.0. \
                 Focus only on whether they describe the exact same core event or topic.\n\n\
                 Group A:\nLabel: {}\nDescription: {}\n\n\
                 Group B:\nLabel: {}\nDescription: {}\n\n\
                 Similarity score (0.0-1.0):",
                a.group_label,
                llm::truncate_chars(&a.description, 500),
                b.group_label,
                llm::truncate_chars(&b.description, 500),
            );
            match self.chat.chat(&[ChatMessage::user(prompt)], &self.model).await {
                Ok(reply) => reply.trim().parse::<f64>().unwrap_or(0.0).clamp(0.0, 1.0),
                Err(e) => {
                    tracing::warn!("label similarity call failed: {e}");
                    0.0
                }
            }
        };
        similarity::blend_with_label_similarity(signature_avg, label_similarity)
    }

    async fn unified_label(
        &self,
        survivor: &GroupWithMembers,
        loser: &GroupWithMembers,
    ) -> (String, String) {
        let prompt = format!(
            "These two article groups seem to cover the same topic. Suggest a concise, unified \
             label and a brief description (1-2 sentences) for the merged group.\n\n\
             Group A (ID {}):\nLabel: {}\nDescription: {}\n\n\
             Group B (ID {}):\nLabel: {}\nDescription: {}\n\n\
             Respond ONLY in JSON format: {{\"merged_label\": \"New Label\", \"merged_description\": \"New Description\"}}",
            survivor.group.group_id,
            survivor.group.group_label,
            survivor.group.description,
            loser.group.group_id,
            loser.group.group_label,
            loser.group.description,
        );
        let fallback = fallback_label(survivor, loser);
        match self.chat.chat(&[ChatMessage::user(prompt)], &self.model).await {
            Ok(reply) => match llm::parse_json_reply::<MergeLabelReply>(&reply) {
                Some(parsed) => (
                    parsed
                        .merged_label
                        .filter(|l| !l.trim().is_empty())
                        .unwrap_or(fallback.0),
                    parsed
                        .merged_description
                        .filter(|d| !d.trim().is_empty())
                        .unwrap_or(fallback.1),
                ),
                None => fallback,
            },
            Err(e) => {
                tracing::warn!("unified label call failed: {e}");
                fallback
            }
        }
    }

    /// The merge itself: relabel the survivor, move memberships, drop the
    /// loser. One transaction; cascade delete cleans the loser's children.
    fn merge_pair(
        &self,
        survivor: &GroupWithMembers,
        loser: &GroupWithMembers,
        label: &str,
        description: &str,
    ) -> anyhow::Result<()> {
        let survivor_id = survivor.group.group_id;
        let loser_id = loser.group.group_id;
        self.store.with_tx(|tx| {
            Store::update_group_label_tx(tx, survivor_id, label, description)?;
            Store::merge_memberships_tx(tx, loser_id, survivor_id)?;
            tx.execute(
                "DELETE FROM article_groups WHERE group_id = ?1",
                rusqlite::params![loser_id],
            )?;
            Ok(())
        })?;
        tracing::info!("merged group {loser_id} into {survivor_id} as '{label}'");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedChat;
    use crate::models::article::ScrapedArticle;
    use crate::models::group::Group;

    fn group_with_members(id: i64, created_at: &str, member_count: usize) -> GroupWithMembers {
        GroupWithMembers {
            group: Group {
                group_id: id,
                main_topic: "Other".to_string(),
                sub_topic: String::new(),
                group_label: format!("group {id}"),
                description: format!("description {id}"),
                consistency_score: 0.7,
                created_at: created_at.to_string(),
                updated_at: created_at.to_string(),
            },
            article_ids: (0..member_count as i64).collect(),
        }
    }

    #[test]
    fn test_survivor_larger_membership_wins() {
        let a = group_with_members(1, "2024-06-01 00:00:00", 5);
        let b = group_with_members(2, "2024-05-01 00:00:00", 3);
        assert!(pick_survivor(&a, &b));
        assert!(!pick_survivor(&b, &a));
    }

    #[test]
    fn test_survivor_tie_older_wins() {
        let a = group_with_members(1, "2024-06-01 00:00:00", 3);
        let b = group_with_members(2, "2024-05-01 00:00:00", 3);
        assert!(!pick_survivor(&a, &b));
        assert!(pick_survivor(&b, &a));
    }

    #[test]
    fn test_survivor_full_tie_smaller_id_wins() {
        let a = group_with_members(1, "2024-06-01 00:00:00", 3);
        let b = group_with_members(2, "2024-06-01 00:00:00", 3);
        assert!(pick_survivor(&a, &b));
        assert!(!pick_survivor(&b, &a));
    }

    #[test]
    fn test_fallback_label_concatenates() {
        let a = group_with_members(1, "2024-06-01 00:00:00", 3);
        let b = group_with_members(2, "2024-06-01 00:00:00", 3);
        let (label, description) = fallback_label(&a, &b);
        assert_eq!(label, "group 1 / group 2");
        assert_eq!(description, "description 1\n---\ndescription 2");
    }

    // ── end-to-end merge against an in-memory store ──

    fn insert_article(store: &Store, link: &str, published: &str) -> i64 {
        store
            .insert_article(&ScrapedArticle {
                link: link.to_string(),
                title: format!("title {link}"),
                content: "body".to_string(),
                published_date: published.to_string(),
                source: "src".to_string(),
                author: None,
            })
            .unwrap()
            .unwrap()
    }

    /// Two groups about the same product launch: five and three members,
    /// all sharing the same core entity and CVE so signature similarity is
    /// well above the merge threshold.
    fn duplicate_groups(store: &Arc<Store>) -> (i64, i64) {
        let mut first_members = Vec::new();
        for i in 0..5 {
            let id = insert_article(store, &format!("https://a/{i}"), "2024-06-01 10:00:00");
            first_members.push(id);
        }
        let mut second_members = Vec::new();
        for i in 0..3 {
            let id = insert_article(store, &format!("https://b/{i}"), "2024-06-01 11:00:00");
            second_members.push(id);
        }
        for &id in first_members.iter().chain(&second_members) {
            store
                .with_tx(|tx| {
                    let entity = Store::insert_or_bump_entity_tx(tx, "GPT-5", "product", None)?;
                    Store::link_entity_to_article_tx(tx, id, entity, 0.9, None)?;
                    Store::insert_article_company_tx(tx, id, "OpenAI")?;
                    Ok(())
                })
                .unwrap();
            store.insert_article_cve(id, "CVE-2024-9999", None).unwrap();
        }
        let g1 = store
            .with_tx(|tx| {
                let id = Store::create_group_tx(
                    tx,
                    "Artificial Intelligence & Machine Learning",
                    "",
                    "OpenAI GPT-5 release",
                    "Coverage of the GPT-5 launch.",
                    0.7,
                )?;
                for &m in &first_members {
                    Store::move_article_to_group_tx(tx, m, id)?;
                }
                Ok(id)
            })
            .unwrap();
        let g2 = store
            .with_tx(|tx| {
                let id = Store::create_group_tx(
                    tx,
                    "Artificial Intelligence & Machine Learning",
                    "",
                    "GPT-5 launch reactions",
                    "Reactions to the GPT-5 launch.",
                    0.7,
                )?;
                for &m in &second_members {
                    Store::move_article_to_group_tx(tx, m, id)?;
                }
                Ok(id)
            })
            .unwrap();
        (g1, g2)
    }

    #[tokio::test]
    async fn test_merge_collapses_duplicates() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (g1, g2) = duplicate_groups(&store);
        let chat = Arc::new(ScriptedChat::new(vec![
            "0.9", // label similarity rating
            r#"{"merged_label": "OpenAI GPT-5 release", "merged_description": "Launch and reactions."}"#,
        ]));
        let merger = Merger::new(store.clone(), chat, 0.60, "test-model".to_string());
        let summary = merger.run().await.unwrap();
        assert_eq!(summary.merged_pairs, 1);
        assert_eq!(summary.errors, 0);

        // larger group survived with all eight articles, loser is gone
        let groups = store.groups_with_members().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group.group_id, g1);
        assert_eq!(groups[0].article_ids.len(), 8);
        assert!(store.get_group(g2).unwrap().is_none());
        assert_eq!(groups[0].group.group_label, "OpenAI GPT-5 release");

        // no article ended up with two memberships
        let mut seen = HashSet::new();
        for id in &groups[0].article_ids {
            assert!(seen.insert(*id), "article {id} appears twice");
        }
    }

    #[tokio::test]
    async fn test_merge_llm_failure_uses_fallback_label() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (g1, _) = duplicate_groups(&store);
        let merger = Merger::new(
            store.clone(),
            Arc::new(ScriptedChat::failing()),
            0.60,
            "test-model".to_string(),
        );
        let summary = merger.run().await.unwrap();
        assert_eq!(summary.merged_pairs, 1);
        let survivor = store.get_group(g1).unwrap().unwrap();
        assert_eq!(survivor.group_label, "OpenAI GPT-5 release / GPT-5 launch reactions");
    }

    #[tokio::test]
    async fn test_dissimilar_groups_not_merged() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let a1 = insert_article(&store, "https://a/1", "2024-06-01 10:00:00");
        let a2 = insert_article(&store, "https://b/1", "2024-06-01 11:00:00");
        store
            .with_tx(|tx| {
                let g1 = Store::create_group_tx(tx, "Other", "", "mars rover", "", 0.7)?;
                Store::move_article_to_group_tx(tx, a1, g1)?;
                let g2 = Store::create_group_tx(tx, "Other", "", "tax reform", "", 0.7)?;
                Store::move_article_to_group_tx(tx, a2, g2)?;
                Ok(())
            })
            .unwrap();
        let merger = Merger::new(
            store.clone(),
            Arc::new(ScriptedChat::failing()),
            0.60,
            "test-model".to_string(),
        );
        let summary = merger.run().await.unwrap();
        assert_eq!(summary.merged_pairs, 0);
        assert_eq!(store.groups_with_members().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_no_group_is_both_survivor_and_deleted() {
        // three near-identical groups: one merge happens per pass, the
        // third stays untouched because its partner was already processed
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (_, _) = duplicate_groups(&store);
        let extra = insert_article(&store, "https://c/0", "2024-06-01 12:00:00");
        store
            .with_tx(|tx| {
                let entity = Store::insert_or_bump_entity_tx(tx, "GPT-5", "product", None)?;
                Store::link_entity_to_article_tx(tx, extra, entity, 0.9, None)?;
                Store::insert_article_company_tx(tx, extra, "OpenAI")?;
                let g3 = Store::create_group_tx(tx, "Artificial Intelligence & Machine Learning", "", "GPT-5 again", "More GPT-5 coverage.", 0.7)?;
                Store::move_article_to_group_tx(tx, extra, g3)?;
                Ok(())
            })
            .unwrap();

        let merger = Merger::new(
            store.clone(),
            Arc::new(ScriptedChat::failing()),
            0.60,
            "test-model".to_string(),
        );
        let summary = merger.run().await.unwrap();
        assert_eq!(summary.merged_pairs, 1);
        assert_eq!(store.groups_with_members().unwrap().len(), 2);
    }
}
