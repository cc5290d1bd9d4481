//! Environment-driven application configuration.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::api::server::ApiServerConfig;
use crate::jobs::OrchestratorConfig;
use crate::pipeline::{PipelineConfig, TranscodeProfile};
use crate::proxy::ProxyPoolConfig;
use crate::resolver::ResolverConfig;
use crate::{Error, Result};

/// Cookies file picked up from the working directory when none is configured.
const DEFAULT_COOKIES_FILE: &str = "cookies.txt";

/// Everything the binary needs to wire the service together.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api: ApiServerConfig,
    pub log_dir: String,
    /// Filter applied after logging is up; `RUST_LOG` still wins at startup.
    pub log_filter: Option<String>,
    pub orchestrator: OrchestratorConfig,
    pub resolver: ResolverConfig,
    pub transcode: TranscodeProfile,
    pub pipeline: PipelineConfig,
    pub proxy: ProxyPoolConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiServerConfig::default(),
            log_dir: "logs".to_string(),
            log_filter: None,
            orchestrator: OrchestratorConfig::default(),
            resolver: ResolverConfig::default(),
            transcode: TranscodeProfile::default(),
            pipeline: PipelineConfig::default(),
            proxy: ProxyPoolConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from process environment variables, falling back to defaults.
    pub fn from_env_or_default() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    ///
    /// Unparseable values fall back to their default with a warning; a zero
    /// concurrency limit is rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(bind_address) = var("API_BIND_ADDRESS") {
            config.api.bind_address = bind_address;
        }
        config.api.port = parse_or(&var, "API_PORT", config.api.port);

        if let Some(log_dir) = var("LOG_DIR") {
            config.log_dir = log_dir;
        }
        config.log_filter = var("LOG_FILTER");

        let orchestrator = &mut config.orchestrator;
        if let Some(dir) = var("ARTIFACT_DIR") {
            orchestrator.artifact_dir = PathBuf::from(dir);
        }
        if let Some(format) = var("FORMAT_SELECTOR") {
            orchestrator.format_selector = format;
        }
        orchestrator.max_concurrent_jobs =
            parse_or(&var, "MAX_CONCURRENT_JOBS", orchestrator.max_concurrent_jobs);
        if orchestrator.max_concurrent_jobs == 0 {
            return Err(Error::config("MAX_CONCURRENT_JOBS must be at least 1"));
        }
        orchestrator.resolve_attempts =
            parse_nonzero(&var, "RESOLVE_ATTEMPTS", orchestrator.resolve_attempts);

        if let Some(path) = var("YTDLP_PATH") {
            config.resolver.binary_path = path;
        }
        config.resolver.cookies_file = var("COOKIES_FILE")
            .map(PathBuf::from)
            .or_else(|| {
                let fallback = Path::new(DEFAULT_COOKIES_FILE);
                fallback.is_file().then(|| fallback.to_path_buf())
            });

        if let Some(path) = var("FFMPEG_PATH") {
            config.transcode.binary_path = path;
        }
        if let Some(bitrate) = var("AUDIO_BITRATE") {
            config.transcode.bitrate = Some(bitrate);
        }

        config.pipeline.pipe_chunk_size =
            parse_nonzero(&var, "PIPE_CHUNK_SIZE", config.pipeline.pipe_chunk_size);
        config.pipeline.stream_chunk_size =
            parse_nonzero(&var, "STREAM_CHUNK_SIZE", config.pipeline.stream_chunk_size);

        let proxy = &mut config.proxy;
        proxy.listing_url = var("PROXY_LIST_URL");
        proxy.refresh_interval = Duration::from_secs(parse_nonzero(
            &var,
            "PROXY_REFRESH_SECS",
            proxy.refresh_interval.as_secs(),
        ));
        proxy.max_entries = var("PROXY_MAX_ENTRIES").and_then(|raw| match raw.parse::<usize>() {
            Ok(0) | Err(_) => {
                warn!(key = "PROXY_MAX_ENTRIES", value = %raw, "Ignoring invalid value");
                None
            }
            Ok(max) => Some(max),
        });
        proxy.static_proxies = var("STATIC_PROXIES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(config)
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> T
where
    T: FromStr + Display + Copy,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            warn!(key, value = %raw, error = %e, default = %default, "Invalid value, using default");
            default
        }),
    }
}

fn parse_nonzero<T, F>(var: &F, key: &str, default: T) -> T
where
    T: FromStr + Display + Copy + Default + PartialEq,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(var, key, default);
    if value == T::default() {
        warn!(key, default = %default, "Zero is not allowed, using default");
        default
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = load(&[]).unwrap();
        assert_eq!(config.api.bind_address, "0.0.0.0");
        assert_eq!(config.api.port, 8000);
        assert_eq!(config.log_dir, "logs");
        assert_eq!(config.orchestrator.max_concurrent_jobs, 2);
        assert_eq!(config.orchestrator.resolve_attempts, 1);
        assert_eq!(config.orchestrator.format_selector, "bestaudio");
        assert_eq!(config.resolver.binary_path, "yt-dlp");
        assert_eq!(config.transcode.binary_path, "ffmpeg");
        assert!(config.transcode.bitrate.is_none());
        assert_eq!(config.pipeline.pipe_chunk_size, 1024 * 1024);
        assert_eq!(config.pipeline.stream_chunk_size, 64 * 1024);
        assert!(config.proxy.listing_url.is_none());
        assert_eq!(config.proxy.refresh_interval, Duration::from_secs(3600));
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("API_PORT", "9000"),
            ("ARTIFACT_DIR", "/data/out"),
            ("COOKIES_FILE", "/secrets/cookies.txt"),
            ("AUDIO_BITRATE", "128k"),
            ("MAX_CONCURRENT_JOBS", "4"),
            ("RESOLVE_ATTEMPTS", "3"),
            ("PROXY_LIST_URL", "https://proxies.example/list"),
            ("PROXY_MAX_ENTRIES", "50"),
            ("STATIC_PROXIES", "10.0.0.1:8080, ,http://10.0.0.2:3128"),
        ])
        .unwrap();

        assert_eq!(config.api.port, 9000);
        assert_eq!(config.orchestrator.artifact_dir, PathBuf::from("/data/out"));
        assert_eq!(
            config.resolver.cookies_file,
            Some(PathBuf::from("/secrets/cookies.txt"))
        );
        assert_eq!(config.transcode.bitrate.as_deref(), Some("128k"));
        assert_eq!(config.orchestrator.max_concurrent_jobs, 4);
        assert_eq!(config.orchestrator.resolve_attempts, 3);
        assert_eq!(config.proxy.max_entries, Some(50));
        assert_eq!(config.proxy.static_proxies.len(), 2);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = load(&[
            ("API_PORT", "not-a-port"),
            ("PIPE_CHUNK_SIZE", "0"),
            ("RESOLVE_ATTEMPTS", "-1"),
            ("PROXY_MAX_ENTRIES", "lots"),
        ])
        .unwrap();

        assert_eq!(config.api.port, 8000);
        assert_eq!(config.pipeline.pipe_chunk_size, 1024 * 1024);
        assert_eq!(config.orchestrator.resolve_attempts, 1);
        assert!(config.proxy.max_entries.is_none());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = load(&[("MAX_CONCURRENT_JOBS", "0")]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
