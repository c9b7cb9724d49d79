pub mod cves;
pub mod groups;
pub mod health;
pub mod trending;

use axum::http::StatusCode;

pub(crate) fn internal_error(e: impl std::fmt::Display) -> (StatusCode, String) {
    tracing::error!("handler query failed: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("query failed: {e}"))
}
