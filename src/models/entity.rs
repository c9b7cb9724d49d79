use serde::{Deserialize, Serialize};

/// Entity types the enricher recognizes. Anything else an LLM invents
/// collapses to `Other` before it reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Organization,
    Technology,
    Product,
    Place,
    Concept,
    Event,
    Other,
}

impl EntityType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "person" => Self::Person,
            "organization" => Self::Organization,
            "technology" => Self::Technology,
            "product" => Self::Product,
            "place" => Self::Place,
            "concept" => Self::Concept,
            "event" => Self::Event,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Technology => "technology",
            Self::Product => "product",
            Self::Place => "place",
            Self::Concept => "concept",
            Self::Event => "event",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: i64,
    pub entity_name: String,
    pub entity_type: String,
    pub description: Option<String>,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    pub mention_count: i64,
}

/// An entity as linked to one article, joined with its profile.
#[derive(Debug, Clone, Serialize)]
pub struct ArticleEntity {
    pub entity_id: i64,
    pub entity_name: String,
    pub entity_type: String,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendingEntity {
    pub entity_id: i64,
    pub entity_name: String,
    pub entity_type: String,
    pub description: Option<String>,
    pub recent_mentions: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryEntity {
    pub entity_id: i64,
    pub entity_name: String,
    pub entity_type: String,
    pub description: Option<String>,
    pub mention_count: i64,
    pub article_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityCoOccurrence {
    pub entity1_name: String,
    pub entity2_name: String,
    pub co_occurrence_count: i64,
}
