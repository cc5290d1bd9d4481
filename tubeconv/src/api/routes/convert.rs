//! Background conversion submission.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;

#[derive(Debug, Deserialize)]
pub struct SourceQuery {
    pub url: Option<String>,
}

impl SourceQuery {
    pub(crate) fn require_url(&self) -> ApiResult<&str> {
        self.url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ApiError::validation("missing 'url' query parameter"))
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: String,
}

/// Mounted under `/api/convert`.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(submit).post(submit))
}

async fn submit(
    State(state): State<AppState>,
    Query(query): Query<SourceQuery>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let job_id = state.orchestrator.submit(query.require_url()?)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}
