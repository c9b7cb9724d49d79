use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::category;
use crate::llm::truncate_chars;
use crate::models::article::ArticlePreview;
use crate::models::group::{CategoryGroups, GroupWithArticles};
use crate::store::Store;

const PREVIEW_CHARS: usize = 300;
const HOME_GROUP_LIMIT: usize = 3;

#[derive(Debug, Deserialize)]
pub struct HomeGroupsQuery {
    pub hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CategoryGroupsQuery {
    pub category: Option<String>,
    pub hours: Option<i64>,
}

/// Groups of one category with article previews, ordered by (member count,
/// latest article) descending. Groups with no articles in the window are
/// omitted.
fn fetch_groups_for_category(
    store: &Store,
    cat: &str,
    hours: Option<i64>,
) -> Result<Vec<GroupWithArticles>, crate::store::StoreError> {
    let mut out: Vec<(GroupWithArticles, String)> = Vec::new();
    for group in store.groups_for_category(cat)? {
        let articles = store.articles_for_group(group.group_id, hours)?;
        if articles.is_empty() {
            continue;
        }
        let latest = articles
            .iter()
            .map(|a| a.published_date.clone())
            .max()
            .unwrap_or_default();
        let previews: Vec<ArticlePreview> = articles
            .into_iter()
            .map(|a| {
                let preview = if a.content.is_empty() {
                    String::new()
                } else {
                    format!("{}...", truncate_chars(&a.content, PREVIEW_CHARS))
                };
                ArticlePreview {
                    article_id: a.id,
                    link: a.link,
                    title: a.title,
                    published_date: a.published_date,
                    preview,
                }
            })
            .collect();
        let description = if group.description.is_empty() {
            "No description available.".to_string()
        } else {
            group.description
        };
        out.push((
            GroupWithArticles {
                group_id: group.group_id,
                group_label: group.group_label,
                description,
                article_count: previews.len(),
                articles: previews,
            },
            latest,
        ));
    }
    out.sort_by(|(a, a_latest), (b, b_latest)| {
        b.article_count
            .cmp(&a.article_count)
            .then(b_latest.cmp(a_latest))
    });
    Ok(out.into_iter().map(|(group, _)| group).collect())
}

/// `/api/home_groups?hours=N`: per-category top groups.
pub async fn home_groups(
    State(state): State<AppState>,
    Query(query): Query<HomeGroupsQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let hours = query.hours.filter(|h| *h > 0);
    let mut categories = Vec::new();
    for cat in category::CATEGORIES {
        let groups = fetch_groups_for_category(&state.store, cat, hours)
            .map_err(super::internal_error)?;
        let top: Vec<GroupWithArticles> = groups.into_iter().take(HOME_GROUP_LIMIT).collect();
        if !top.is_empty() {
            categories.push(CategoryGroups {
                category: cat.to_string(),
                groups: top,
            });
        }
    }
    Ok(Json(json!({ "categories": categories })))
}

/// `/api/category_groups?category=X&hours=N`.
pub async fn category_groups(
    State(state): State<AppState>,
    Query(query): Query<CategoryGroupsQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let Some(cat) = query.category else {
        return Err((StatusCode::BAD_REQUEST, "missing 'category' parameter".to_string()));
    };
    let hours = query.hours.filter(|h| *h > 0);
    let groups =
        fetch_groups_for_category(&state.store, &cat, hours).map_err(super::internal_error)?;
    Ok(Json(json!({ "category": cat, "groups": groups })))
}
