//! Job status and artifact download.

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_util::io::ReaderStream;

use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::attachment_disposition;
use crate::api::server::AppState;
use crate::jobs::Job;

/// Mounted under `/api/jobs`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_status))
        .route("/{id}/download", get(download))
}

async fn get_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    Ok(Json(state.orchestrator.get_status(&id)?))
}

async fn download(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let artifact = state.orchestrator.fetch_artifact(&id).await?;

    let file = tokio::fs::File::open(&artifact.path).await.map_err(|e| {
        tracing::warn!(job_id = %id, error = %e, "Artifact vanished before download");
        ApiError::not_found(format!("artifact with id '{id}' not found"))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&artifact.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(artifact.size));
    headers.insert(
        header::CONTENT_DISPOSITION,
        attachment_disposition(&artifact.file_name),
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::test_support::offline_state;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn get(uri: &str) -> (StatusCode, serde_json::Value) {
        let dir = TempDir::new().unwrap();
        let app = Router::new()
            .nest("/api/jobs", router())
            .with_state(offline_state(dir.path()));

        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (status, body) = get("/api/jobs/does-not-exist").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not found");
    }

    #[tokio::test]
    async fn unknown_artifact_is_not_found() {
        let (status, body) = get("/api/jobs/does-not-exist/download").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not found");
    }
}
