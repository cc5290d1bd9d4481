//! Live conversion: transcoded bytes are sent as they are produced.

use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::api::error::ApiResult;
use crate::api::routes::attachment_disposition;
use crate::api::routes::convert::SourceQuery;
use crate::api::server::AppState;

/// Mounted under `/api/stream`.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(stream))
}

/// Errors before the first chunk become a JSON error response. A failure
/// later aborts the chunked body, so the client sees a truncated download.
async fn stream(
    State(state): State<AppState>,
    Query(query): Query<SourceQuery>,
) -> ApiResult<Response> {
    let live = state.orchestrator.stream(query.require_url()?).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&live.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("audio/mpeg")),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        attachment_disposition(&live.file_name),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    Ok((headers, Body::from_stream(live.body)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::test_support::offline_state;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[tokio::test]
    async fn resolver_failure_is_reported_before_streaming() {
        let dir = TempDir::new().unwrap();
        let app = Router::new()
            .nest("/api/stream", router())
            .with_state(offline_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/stream?url=https%3A%2F%2Fyoutu.be%2Fabc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
