//! API route modules.

pub mod convert;
pub mod fetch_proxy;
pub mod health;
pub mod jobs;
pub mod resolve;
pub mod stream;

use axum::Router;
use axum::http::HeaderValue;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/convert", convert::router())
        .nest("/api/jobs", jobs::router())
        .nest("/api/stream", stream::router())
        .nest("/api/resolve", resolve::router())
        .nest("/getVideoUrl", resolve::router())
        .nest("/api/fetch-proxy", fetch_proxy::router())
        .nest("/health", health::router())
        .with_state(state)
}

/// `attachment` disposition with an ASCII fallback name and an RFC 5987 UTF-8 name.
pub(crate) fn attachment_disposition(file_name: &str) -> HeaderValue {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut encoded = String::with_capacity(file_name.len() * 3);
    for byte in file_name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }

    HeaderValue::from_str(&format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_escapes_non_ascii_names() {
        let value = attachment_disposition("Café \"Live\".mp3");
        let text = value.to_str().unwrap();
        assert!(text.starts_with("attachment; filename=\"Caf_ _Live_.mp3\""));
        assert!(text.ends_with("filename*=UTF-8''Caf%C3%A9%20%22Live%22.mp3"));
    }
}
