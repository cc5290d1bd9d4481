//! yt-dlp backed resolver.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::classify::classify_diagnostic;
use super::{ResolvedMedia, StreamResolver};
use crate::error::ResolutionErrorKind;
use crate::pipeline::CommandSpec;
use crate::{Error, Result};

/// yt-dlp invocation settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub binary_path: String,
    /// Netscape cookies file passed with `--cookies`.
    pub cookies_file: Option<PathBuf>,
    /// Extra arguments placed before the source on every invocation.
    pub extra_args: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            binary_path: "yt-dlp".to_string(),
            cookies_file: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct YtDlpResolver {
    config: ResolverConfig,
}

impl YtDlpResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    fn command(&self, leading: &[&str], source: &str, proxy: Option<&str>) -> CommandSpec {
        let mut args: Vec<String> = leading.iter().map(|a| a.to_string()).collect();
        args.extend(["--no-warnings".to_string(), "--no-playlist".to_string()]);
        if let Some(proxy) = proxy {
            args.extend(["--proxy".to_string(), proxy.to_string()]);
        }
        if let Some(ref cookies) = self.config.cookies_file {
            args.extend([
                "--cookies".to_string(),
                cookies.to_string_lossy().into_owned(),
            ]);
        }
        args.extend(self.config.extra_args.iter().cloned());
        args.extend(["--".to_string(), source.to_string()]);

        CommandSpec::new(self.config.binary_path.clone(), args)
    }

    /// Run one invocation and return its first non-empty stdout line.
    async fn first_line(&self, spec: CommandSpec) -> Result<String> {
        debug!(command = %spec, "Running resolver");

        let output = spec
            .to_command()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                let err = Error::spawn(&spec.program, e);
                Error::resolution(ResolutionErrorKind::Other, err.to_string())
            })?;

        if !output.status.success() {
            let diagnostic =
                process_utils::collect_tail(&output.stderr[..], process_utils::DEFAULT_TAIL_LINES)
                    .await;
            let diagnostic = if diagnostic.is_empty() {
                format!("{} exited with status {}", spec.program, output.status)
            } else {
                diagnostic
            };
            let kind = classify_diagnostic(&diagnostic);
            warn!(kind = %kind, diagnostic = %diagnostic, "Resolver failed");
            return Err(Error::resolution(kind, diagnostic));
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::resolution(
                    ResolutionErrorKind::Other,
                    format!("{} produced no output", spec.program),
                )
            })
    }
}

#[async_trait]
impl StreamResolver for YtDlpResolver {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn resolve(
        &self,
        source: &str,
        format: &str,
        proxy: Option<&str>,
    ) -> Result<ResolvedMedia> {
        let url_cmd = self.command(&["-f", format, "-g"], source, proxy);
        let title_cmd = self.command(&["--get-title"], source, proxy);

        let (media_url, title) =
            tokio::try_join!(self.first_line(url_cmd), self.first_line(title_cmd))?;

        Ok(ResolvedMedia { media_url, title })
    }

    fn producer_command(&self, source: &str, format: &str, proxy: Option<&str>) -> CommandSpec {
        self.command(
            &["-f", format, "-o", "-", "--quiet", "--no-part"],
            source,
            proxy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_command_writes_to_stdout() {
        let resolver = YtDlpResolver::new(ResolverConfig {
            cookies_file: Some(PathBuf::from("cookies.txt")),
            ..Default::default()
        });
        let cmd = resolver.producer_command(
            "https://youtu.be/abc",
            "bestaudio",
            Some("http://10.0.0.1:8080"),
        );

        assert_eq!(cmd.program, "yt-dlp");
        let line = cmd.to_string();
        assert!(line.starts_with("yt-dlp -f bestaudio -o - --quiet --no-part"));
        assert!(line.contains("--proxy http://10.0.0.1:8080"));
        assert!(line.contains("--cookies cookies.txt"));
        assert!(line.ends_with("-- https://youtu.be/abc"));
    }

    #[test]
    fn no_proxy_means_no_proxy_flag() {
        let cmd = YtDlpResolver::default().producer_command("abc", "bestaudio", None);
        assert!(!cmd.args.iter().any(|a| a == "--proxy"));
        assert!(!cmd.args.iter().any(|a| a == "--cookies"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_resolution_error() {
        let resolver = YtDlpResolver::new(ResolverConfig {
            binary_path: "/nonexistent/yt-dlp".to_string(),
            ..Default::default()
        });
        let err = resolver.resolve("abc", "bestaudio", None).await.unwrap_err();
        assert!(matches!(err, Error::Resolution { .. }));
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn write_script(dir: &TempDir, body: &str) -> String {
            let path = dir.path().join("yt-dlp");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        #[tokio::test]
        async fn resolves_url_and_title() {
            let dir = TempDir::new().unwrap();
            let script = write_script(
                &dir,
                r#"for a in "$@"; do
  if [ "$a" = "-g" ]; then echo "https://cdn.example/audio.webm"; exit 0; fi
  if [ "$a" = "--get-title" ]; then printf '\nMy Song\n'; exit 0; fi
done
exit 1"#,
            );
            let resolver = YtDlpResolver::new(ResolverConfig {
                binary_path: script,
                ..Default::default()
            });

            let media = resolver
                .resolve("https://youtu.be/abc", "bestaudio", None)
                .await
                .unwrap();
            assert_eq!(media.media_url, "https://cdn.example/audio.webm");
            assert_eq!(media.title, "My Song");
        }

        #[tokio::test]
        async fn nonzero_exit_carries_classified_diagnostic() {
            let dir = TempDir::new().unwrap();
            let script = write_script(
                &dir,
                "echo 'ERROR: [youtube] abc: Video unavailable' >&2; exit 1",
            );
            let resolver = YtDlpResolver::new(ResolverConfig {
                binary_path: script,
                ..Default::default()
            });

            let err = resolver.resolve("abc", "bestaudio", None).await.unwrap_err();
            match err {
                Error::Resolution { kind, message } => {
                    assert_eq!(kind, ResolutionErrorKind::Unavailable);
                    assert_eq!(message, "ERROR: [youtube] abc: Video unavailable");
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }
}
