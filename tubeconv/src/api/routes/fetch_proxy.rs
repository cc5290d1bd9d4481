//! CORS pass-through fetch.
//!
//! Lets a browser page read media or metadata from hosts that do not send
//! CORS headers. Only http(s) targets are allowed, and loopback or private
//! address literals are refused.

use axum::Router;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::TryStreamExt;
use serde::Deserialize;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;

#[derive(Debug, Deserialize)]
pub struct FetchProxyQuery {
    pub url: Option<String>,
}

/// Mounted under `/api/fetch-proxy`.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(fetch_proxy_get).options(fetch_proxy_options))
}

fn cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Range"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Length, Content-Range, Accept-Ranges"),
    );
}

async fn fetch_proxy_options() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    cors_headers(&mut headers);
    (StatusCode::NO_CONTENT, headers)
}

fn validate_target(raw: Option<&str>) -> ApiResult<url::Url> {
    let raw = raw
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("URL is required"))?;

    let target =
        url::Url::parse(raw).map_err(|e| ApiError::bad_request(format!("Invalid url: {e}")))?;
    match target.scheme() {
        "http" | "https" => {}
        _ => return Err(ApiError::bad_request("Only http/https URLs are allowed")),
    }

    if let Some(host) = target.host_str() {
        if host.eq_ignore_ascii_case("localhost") {
            return Err(ApiError::bad_request("localhost is not allowed"));
        }

        // Tests stand up an in-process upstream on loopback.
        if !cfg!(test)
            && let Ok(ip) = host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<std::net::IpAddr>()
        {
            if ip.is_loopback() || ip.is_unspecified() {
                return Err(ApiError::bad_request("loopback is not allowed"));
            }
            if matches!(ip, std::net::IpAddr::V4(v4) if v4.is_private() || v4.is_link_local()) {
                return Err(ApiError::bad_request("private ip is not allowed"));
            }
        }
    }

    Ok(target)
}

pub async fn fetch_proxy_get(
    State(state): State<AppState>,
    Query(query): Query<FetchProxyQuery>,
    req: Request,
) -> ApiResult<Response> {
    let target = validate_target(query.url.as_deref())?;

    let mut request = state.http_client.get(target.clone());
    if let Some(range) = req.headers().get(header::RANGE)
        && let Ok(val) = range.to_str()
        && let Ok(value) = HeaderValue::from_str(val)
    {
        request = request.header(reqwest::header::RANGE, value);
    }

    let upstream = request.send().await.map_err(|e| {
        tracing::warn!(url = %target, error = %e, "Fetch proxy request failed");
        ApiError::bad_gateway("BAD_GATEWAY", format!("Proxy request failed: {e}"))
    })?;

    let status = upstream.status();

    let mut out_headers = HeaderMap::new();
    let allowed = [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::CONTENT_RANGE,
        header::ACCEPT_RANGES,
        header::CACHE_CONTROL,
        header::ETAG,
        header::LAST_MODIFIED,
    ];
    for key in allowed {
        if let Some(value) = upstream.headers().get(key.as_str()) {
            out_headers.insert(key, value.clone());
        }
    }
    cors_headers(&mut out_headers);

    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    let body = axum::body::Body::from_stream(stream);

    let mut response = (status, body).into_response();
    *response.headers_mut() = out_headers;
    Ok(response)
}
