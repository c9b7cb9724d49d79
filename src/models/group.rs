use serde::{Deserialize, Serialize};

use crate::models::article::ArticlePreview;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub group_id: i64,
    pub main_topic: String,
    pub sub_topic: String,
    pub group_label: String,
    pub description: String,
    pub consistency_score: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// A group with its member article ids, as loaded at the start of a
/// grouping or merging run.
#[derive(Debug, Clone)]
pub struct GroupWithMembers {
    pub group: Group,
    pub article_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupWithArticles {
    pub group_id: i64,
    pub group_label: String,
    pub description: String,
    pub article_count: usize,
    pub articles: Vec<ArticlePreview>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryGroups {
    pub category: String,
    pub groups: Vec<GroupWithArticles>,
}
