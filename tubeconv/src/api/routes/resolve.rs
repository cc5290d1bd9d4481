//! Direct resolution of a source into a media URL and title.

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::Deserialize;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::resolver::ResolvedMedia;

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    #[serde(alias = "youtube_url")]
    pub url: Option<String>,
    /// Format selector; the configured default when absent.
    pub fmt: Option<String>,
}

/// Mounted under `/api/resolve` and the legacy `/getVideoUrl`.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(resolve))
}

async fn resolve(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> ApiResult<Json<ResolvedMedia>> {
    let url = query
        .url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::validation("missing 'url' query parameter"))?;

    let media = state
        .orchestrator
        .resolve(url, query.fmt.as_deref())
        .await?;
    Ok(Json(media))
}
