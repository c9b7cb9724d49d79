use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::models::trend::TrendWithDetails;
use crate::timefmt;

const DEFAULT_TREND_LIMIT: i64 = 10;
const DEFAULT_ENTITY_LIMIT: i64 = 20;
const DEFAULT_ENTITY_HOURS: i64 = 48;

#[derive(Debug, Deserialize)]
pub struct TrendingQuery {
    pub category: Option<String>,
    pub limit: Option<i64>,
    pub hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TrendingEntitiesQuery {
    pub hours: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CategoryEntitiesQuery {
    pub category: Option<String>,
    pub limit: Option<i64>,
}

/// `/api/trending?category=X&limit=N&hours=N`: trends with their articles
/// and key entities, ordered by importance.
pub async fn trending(
    State(state): State<AppState>,
    Query(query): Query<TrendingQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let limit = query.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_TREND_LIMIT);
    let trends = state
        .store
        .trends(query.category.as_deref(), limit)
        .map_err(super::internal_error)?;

    let cutoff = query
        .hours
        .filter(|h| *h > 0)
        .map(timefmt::hours_ago_string);

    let mut detailed = Vec::with_capacity(trends.len());
    for trend in trends {
        if let Some(cutoff) = &cutoff {
            if trend.created_at < *cutoff {
                continue;
            }
        }
        let articles = state
            .store
            .trend_articles(trend.trend_id)
            .map_err(super::internal_error)?;
        let entities = state
            .store
            .trend_entities(trend.trend_id)
            .map_err(super::internal_error)?;
        detailed.push(TrendWithDetails {
            trend_id: trend.trend_id,
            category: trend.category,
            trend_label: trend.trend_label,
            summary: trend.summary,
            importance_score: trend.importance_score,
            confidence_score: trend.confidence_score,
            articles,
            entities,
        });
    }
    Ok(Json(json!({ "trends": detailed })))
}

/// `/api/trending_entities?hours=N&limit=N`.
pub async fn trending_entities(
    State(state): State<AppState>,
    Query(query): Query<TrendingEntitiesQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let hours = query.hours.filter(|h| *h > 0).unwrap_or(DEFAULT_ENTITY_HOURS);
    let limit = query.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_ENTITY_LIMIT);
    let entities = state
        .store
        .trending_entities(hours, limit)
        .map_err(super::internal_error)?;
    Ok(Json(json!({ "entities": entities })))
}

/// `/api/category_entities?category=X&limit=N`.
pub async fn category_entities(
    State(state): State<AppState>,
    Query(query): Query<CategoryEntitiesQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let Some(category) = query.category else {
        return Err((StatusCode::BAD_REQUEST, "missing 'category' parameter".to_string()));
    };
    let limit = query.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_ENTITY_LIMIT);
    let entities = state
        .store
        .category_entities(&category, limit)
        .map_err(super::internal_error)?;
    Ok(Json(json!({ "category": category, "entities": entities })))
}
