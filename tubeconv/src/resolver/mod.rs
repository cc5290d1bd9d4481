//! Source reference resolution.
//!
//! A resolver turns a user-supplied reference into a direct media URL and a
//! title, and knows how to launch itself as the producer half of a pipeline.

mod classify;
mod ytdlp;

use async_trait::async_trait;
use serde::Serialize;

use crate::pipeline::CommandSpec;
use crate::{Error, Result};

pub use classify::classify_diagnostic;
pub use ytdlp::{ResolverConfig, YtDlpResolver};

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedMedia {
    /// Direct URL of the selected media stream.
    #[serde(rename = "audioUrl")]
    pub media_url: String,
    pub title: String,
}

#[async_trait]
pub trait StreamResolver: Send + Sync {
    /// Short tool name for logs.
    fn name(&self) -> &str;

    /// Resolve `source` into a direct media URL and a title.
    ///
    /// Fails with [`Error::Resolution`] when the tool exits non-zero. No
    /// timeout and no retry are applied here.
    async fn resolve(&self, source: &str, format: &str, proxy: Option<&str>)
    -> Result<ResolvedMedia>;

    /// Command that downloads `source` and writes the media bytes to stdout.
    fn producer_command(&self, source: &str, format: &str, proxy: Option<&str>) -> CommandSpec;
}

/// Reject references that are empty or could be parsed as tool options.
pub fn validate_reference(source: &str) -> Result<&str> {
    let source = source.trim();
    if source.is_empty() {
        return Err(Error::validation("source reference must not be empty"));
    }
    if source.starts_with('-') {
        return Err(Error::validation("source reference must not start with '-'"));
    }
    if source.chars().any(char::is_control) {
        return Err(Error::validation(
            "source reference must not contain control characters",
        ));
    }
    Ok(source)
}
