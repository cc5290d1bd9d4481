//! Resolver diagnostic classification.

use crate::error::ResolutionErrorKind;

const RATE_LIMITED: &[&str] = &["http error 429", "too many requests", "rate limit", "rate-limit"];

const ACCESS_DENIED: &[&str] = &[
    "sign in to confirm",
    "login required",
    "log in",
    "members-only",
    "confirm your age",
    "age-restricted",
    "http error 403",
    "forbidden",
    "cookies",
];

const INVALID_REFERENCE: &[&str] = &[
    "unsupported url",
    "is not a valid url",
    "invalid url",
    "no such file or directory",
    "incomplete youtube id",
];

const UNAVAILABLE: &[&str] = &[
    "video unavailable",
    "private video",
    "has been removed",
    "not available",
    "does not exist",
    "http error 404",
    "no video formats found",
];

/// Classify a resolver's stderr text.
///
/// Checks run from most to least specific, so a throttled sign-in prompt is
/// reported as rate limiting.
pub fn classify_diagnostic(stderr: &str) -> ResolutionErrorKind {
    let text = stderr.to_lowercase();
    let matches = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if matches(RATE_LIMITED) {
        ResolutionErrorKind::RateLimited
    } else if matches(ACCESS_DENIED) {
        ResolutionErrorKind::AccessDenied
    } else if matches(INVALID_REFERENCE) {
        ResolutionErrorKind::InvalidReference
    } else if matches(UNAVAILABLE) {
        ResolutionErrorKind::Unavailable
    } else {
        ResolutionErrorKind::Other
    }
}
