use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trend {
    pub trend_id: i64,
    pub category: String,
    pub trend_label: String,
    pub summary: String,
    pub importance_score: f64,
    pub confidence_score: f64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendArticle {
    pub article_id: i64,
    pub title: String,
    pub link: String,
    pub published_date: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendEntity {
    pub entity_id: i64,
    pub entity_name: String,
    pub entity_type: String,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendWithDetails {
    pub trend_id: i64,
    pub category: String,
    pub trend_label: String,
    pub summary: String,
    pub importance_score: f64,
    pub confidence_score: f64,
    pub articles: Vec<TrendArticle>,
    pub entities: Vec<TrendEntity>,
}
