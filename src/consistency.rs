use serde::Deserialize;
use std::sync::Arc;

use crate::llm::{self, ChatApi, ChatMessage};
use crate::models::group::GroupWithMembers;
use crate::store::{Store, StoreResult};

const MEMBER_EXCERPT_CHARS: usize = 500;
const HISTORY_DAYS: i64 = 30;
const HISTORY_LIMIT: i64 = 10;
const NEUTRAL_SCORE: f64 = 0.5;

/// Groups this coherent (and large enough) become exemplars for future
/// prompt context.
const EXEMPLAR_MIN_SCORE: f64 = 0.9;
const EXEMPLAR_MIN_MEMBERS: usize = 3;

#[derive(Debug, Deserialize)]
struct ConsistencyReply {
    #[serde(default)]
    consistency_score: Option<f64>,
    #[serde(default)]
    feedback: Option<String>,
}

#[derive(Debug)]
pub struct ConsistencyEvaluation {
    pub score: f64,
    pub feedback: String,
}

/// Ask the LLM how well a group's member articles hang together, store the
/// score on the group, and record an exemplar when the group is a
/// particularly clean example of its category. Failures fall back to a
/// neutral score without aborting the caller.
pub async fn evaluate_group_consistency(
    store: &Arc<Store>,
    chat: &Arc<dyn ChatApi>,
    model: &str,
    group: &GroupWithMembers,
) -> anyhow::Result<ConsistencyEvaluation> {
    let articles = store.articles_by_ids(&group.article_ids)?;
    if articles.is_empty() {
        return Ok(ConsistencyEvaluation {
            score: NEUTRAL_SCORE,
            feedback: "no member articles to evaluate".to_string(),
        });
    }

    let mut prompt = format!(
        "Evaluate how consistently these articles belong together in one news group.\n\n\
         Group label: {}\nDescription: {}\nCategory: {}\n\nMember articles:\n",
        group.group.group_label, group.group.description, group.group.main_topic
    );
    for article in &articles {
        prompt.push_str(&format!(
            "- {}\n  {}\n",
            article.title,
            llm::truncate_chars(&article.content, MEMBER_EXCERPT_CHARS)
        ));
    }

    let history = store.recent_consistent_groups(&group.group.main_topic, HISTORY_DAYS, HISTORY_LIMIT)?;
    if !history.is_empty() {
        prompt.push_str("\nFor calibration, recent well-formed groups in this category:\n");
        for (past, article_count) in &history {
            prompt.push_str(&format!(
                "- '{}' (score {:.2}, {article_count} articles): {}\n",
                past.group_label, past.consistency_score, past.description
            ));
        }
    }
    prompt.push_str(
        "\nRate the group's consistency from 0.0 (unrelated articles) to 1.0 (one tight story).\n\
         Return ONLY JSON: {\"consistency_score\": 0.0, \"feedback\": \"one sentence\"}",
    );

    let messages = [
        ChatMessage::system("You are an expert news analyst evaluating article grouping quality."),
        ChatMessage::user(prompt),
    ];
    let evaluation = match chat.chat(&messages, model).await {
        Ok(reply) => match llm::parse_json_reply::<ConsistencyReply>(&reply) {
            Some(parsed) => ConsistencyEvaluation {
                score: parsed.consistency_score.unwrap_or(NEUTRAL_SCORE).clamp(0.0, 1.0),
                feedback: parsed.feedback.unwrap_or_default(),
            },
            None => ConsistencyEvaluation {
                score: NEUTRAL_SCORE,
                feedback: "unparseable evaluation".to_string(),
            },
        },
        Err(e) => {
            tracing::warn!(
                "consistency evaluation failed for group {}: {e}",
                group.group.group_id
            );
            ConsistencyEvaluation {
                score: NEUTRAL_SCORE,
                feedback: "evaluation unavailable".to_string(),
            }
        }
    };

    store.update_group_consistency(group.group.group_id, evaluation.score)?;
    if evaluation.score >= EXEMPLAR_MIN_SCORE && group.article_ids.len() >= EXEMPLAR_MIN_MEMBERS {
        if let Err(e) = record_exemplar(store, group, evaluation.score) {
            tracing::warn!("failed to record exemplar for group {}: {e}", group.group.group_id);
        }
    }
    Ok(evaluation)
}

fn record_exemplar(store: &Arc<Store>, group: &GroupWithMembers, score: f64) -> StoreResult<()> {
    if store.exemplar_exists(&group.group.main_topic, &group.group.group_label)? {
        return Ok(());
    }
    store.with_tx(|tx| {
        let exemplar_id = Store::create_exemplar_tx(
            tx,
            &group.group.main_topic,
            &group.group.group_label,
            Some(&group.group.description),
            score,
        )?;
        for &article_id in &group.article_ids {
            Store::add_article_to_exemplar_tx(tx, exemplar_id, article_id)?;
        }
        Ok(())
    })?;
    tracing::info!(
        "recorded exemplar '{}' for category {}",
        group.group.group_label,
        group.group.main_topic
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedChat;
    use crate::models::article::ScrapedArticle;
    use crate::models::group::Group;

    fn seeded_group(store: &Arc<Store>, member_count: usize) -> GroupWithMembers {
        let mut article_ids = Vec::new();
        for i in 0..member_count {
            let id = store
                .insert_article(&ScrapedArticle {
                    link: format!("https://a/{i}"),
                    title: format!("breach update {i}"),
                    content: "details".to_string(),
                    published_date: "2024-06-01 12:00:00".to_string(),
                    source: "src".to_string(),
                    author: None,
                })
                .unwrap()
                .unwrap();
            article_ids.push(id);
        }
        let group_id = store
            .with_tx(|tx| {
                let id = Store::create_group_tx(tx, "Cybersecurity & Data Privacy", "", "breach", "d", 0.7)?;
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
                group_label: "breach".to_string(),
                description: "d".to_string(),
                consistency_score: 0.7,
                created_at: "2024-06-01 00:00:00".to_string(),
                updated_at: "2024-06-01 00:00:00".to_string(),
            },
            article_ids,
        }
    }

    #[tokio::test]
    async fn test_scores_are_stored_and_clamped() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let group = seeded_group(&store, 2);
        let chat: Arc<dyn ChatApi> = Arc::new(ScriptedChat::new(vec![
            r#"{"consistency_score": 1.7, "feedback": "tight"}"#,
        ]));
        let evaluation = evaluate_group_consistency(&store, &chat, "m", &group).await.unwrap();
        assert!((evaluation.score - 1.0).abs() < 1e-9);
        let stored = store.get_group(group.group.group_id).unwrap().unwrap();
        assert!((stored.consistency_score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_neutral() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let group = seeded_group(&store, 2);
        let chat: Arc<dyn ChatApi> = Arc::new(ScriptedChat::failing());
        let evaluation = evaluate_group_consistency(&store, &chat, "m", &group).await.unwrap();
        assert!((evaluation.score - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_high_scoring_group_becomes_exemplar() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let group = seeded_group(&store, 3);
        let chat: Arc<dyn ChatApi> = Arc::new(ScriptedChat::new(vec![
            r#"{"consistency_score": 0.95, "feedback": "exemplary"}"#,
        ]));
        evaluate_group_consistency(&store, &chat, "m", &group).await.unwrap();
        let exemplars = store
            .exemplars_for_category("Cybersecurity & Data Privacy", 5)
            .unwrap();
        assert_eq!(exemplars.len(), 1);
        assert_eq!(exemplars[0].0, "breach");
        assert_eq!(exemplars[0].2.len(), 3);
    }

    #[tokio::test]
    async fn test_small_group_not_recorded_as_exemplar() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let group = seeded_group(&store, 2);
        let chat: Arc<dyn ChatApi> = Arc::new(ScriptedChat::new(vec![
            r#"{"consistency_score": 0.95, "feedback": "good"}"#,
        ]));
        evaluate_group_consistency(&store, &chat, "m", &group).await.unwrap();
        assert!(store
            .exemplars_for_category("Cybersecurity & Data Privacy", 5)
            .unwrap()
            .is_empty());
    }
}
