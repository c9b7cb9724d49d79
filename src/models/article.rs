use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub link: String,
    pub title: String,
    pub content: String,
    pub published_date: String,
    pub source: String,
    pub processed_date: String,
}

/// What a scraper hands the orchestrator. The store assigns the id and
/// deduplicates by link.
#[derive(Debug, Clone)]
pub struct ScrapedArticle {
    pub link: String,
    pub title: String,
    pub content: String,
    pub published_date: String,
    pub source: String,
    pub author: Option<String>,
}

/// Slim view used by the grouping loop (id, title, content, date).
#[derive(Debug, Clone)]
pub struct UngroupedArticle {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub published_date: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArticlePreview {
    pub article_id: i64,
    pub link: String,
    pub title: String,
    pub published_date: String,
    pub preview: String,
}
