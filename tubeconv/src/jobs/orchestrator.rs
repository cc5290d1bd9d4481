//! Conversion job orchestrator.
//!
//! Background jobs and live streams share one admission gate. A job holds
//! its permit from `downloading` until its terminal status is recorded; a
//! live stream holds one until the pipeline behind it has exited.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{Job, PROGRESS_INPUT_COMPLETE, PROGRESS_RESOLVED, PROGRESS_SPAWNED};
use super::store::JobStore;
use crate::pipeline::{
    PipelineOutcome, PipelinePhase, PipelineRunner, PipelineSink, TranscodeProfile,
};
use crate::proxy::ProxyPool;
use crate::resolver::{ResolvedMedia, StreamResolver, validate_reference};
use crate::utils::fs;
use crate::{Error, Result};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Admission gate size shared by jobs and live streams.
    pub max_concurrent_jobs: usize,
    /// Directory holding `<job_id>.<ext>` artifacts.
    pub artifact_dir: PathBuf,
    /// Format selector handed to the resolver.
    pub format_selector: String,
    /// Resolution attempts per job or stream, each with a fresh proxy.
    pub resolve_attempts: u32,
    /// Chunks buffered between the transcoder and a live client.
    pub stream_buffer_chunks: usize,
    /// Prefix of the `result_location` reported for finished jobs.
    pub download_base: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            artifact_dir: PathBuf::from("downloads"),
            format_selector: "bestaudio".to_string(),
            resolve_attempts: 1,
            stream_buffer_chunks: 8,
            download_base: "/api/jobs".to_string(),
        }
    }
}

/// A finished job's output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    /// Suggested download name derived from the title.
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
}

/// A transcoded byte stream for a single caller.
pub struct LiveStream {
    pub title: String,
    pub file_name: String,
    pub content_type: String,
    /// Ends with an `Err` item if the pipeline fails after the first chunk.
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl std::fmt::Debug for LiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStream")
            .field("title", &self.title)
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

pub struct JobOrchestrator {
    config: OrchestratorConfig,
    store: JobStore,
    slots: Arc<Semaphore>,
    resolver: Arc<dyn StreamResolver>,
    proxies: Arc<ProxyPool>,
    runner: PipelineRunner,
    profile: TranscodeProfile,
}

impl JobOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        resolver: Arc<dyn StreamResolver>,
        proxies: Arc<ProxyPool>,
        runner: PipelineRunner,
        profile: TranscodeProfile,
    ) -> Result<Self> {
        if config.max_concurrent_jobs == 0 {
            return Err(Error::config("max_concurrent_jobs must be at least 1"));
        }
        if config.stream_buffer_chunks == 0 {
            return Err(Error::config("stream_buffer_chunks must be at least 1"));
        }

        info!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            artifact_dir = %config.artifact_dir.display(),
            resolver = resolver.name(),
            "Job orchestrator created"
        );

        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            store: JobStore::new(),
            resolver,
            proxies,
            runner,
            profile,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Number of admission slots currently held by jobs and live streams.
    pub fn running_jobs(&self) -> usize {
        self.config.max_concurrent_jobs - self.slots.available_permits()
    }

    pub fn artifact_path(&self, job_id: &str) -> PathBuf {
        self.config
            .artifact_dir
            .join(format!("{job_id}.{}", self.profile.extension))
    }

    /// Delete `<job id>.<ext>` files no known job owns.
    ///
    /// Jobs cut short by a shutdown leave partial artifacts behind; the store
    /// starts empty, so at startup every such file is stale.
    pub async fn remove_stale_artifacts(&self) -> Result<usize> {
        let dir = &self.config.artifact_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(fs::io_error("listing artifacts", dir, e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| fs::io_error("listing artifacts", dir, e))?
        {
            let path = entry.path();
            let is_artifact =
                path.extension().and_then(|e| e.to_str()) == Some(self.profile.extension.as_str());
            let Some(job_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| Uuid::parse_str(s).is_ok())
            else {
                continue;
            };
            if !is_artifact || self.store.get(job_id).is_some() {
                continue;
            }

            fs::remove_file_if_exists(&path).await?;
            debug!(path = %path.display(), "Removed stale artifact");
            removed += 1;
        }
        Ok(removed)
    }

    fn result_location(&self, job_id: &str) -> String {
        format!(
            "{}/{job_id}/download",
            self.config.download_base.trim_end_matches('/')
        )
    }

    /// Register a job and start converting it in the background.
    ///
    /// The record is visible as `initializing` before this returns.
    pub fn submit(self: &Arc<Self>, source: &str) -> Result<String> {
        let source = validate_reference(source)?.to_string();
        let job_id = Uuid::new_v4().to_string();

        self.store.insert(Job::new(&job_id, &source));
        info!(job_id = %job_id, source = %source, "Job submitted");

        let this = Arc::clone(self);
        let id = job_id.clone();
        tokio::spawn(async move { this.run_job(id, source).await });

        Ok(job_id)
    }

    pub fn get_status(&self, job_id: &str) -> Result<Job> {
        self.store
            .get(job_id)
            .ok_or_else(|| Error::not_found("job", job_id))
    }

    async fn run_job(&self, job_id: String, source: String) {
        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                self.record_outcome(&job_id, Err(Error::Other(format!("Semaphore error: {e}"))));
                return;
            }
        };

        if let Err(e) = self.store.update(&job_id, |job| job.start_downloading()) {
            error!(job_id = %job_id, error = %e, "Failed to start job");
            return;
        }
        debug!(job_id = %job_id, running = self.running_jobs(), "Job admitted");

        let result = self.convert(&job_id, &source).await;
        self.record_outcome(&job_id, result);

        drop(permit);
    }

    fn record_outcome(&self, job_id: &str, result: Result<String>) {
        let updated = match result {
            Ok(location) => {
                info!(job_id = %job_id, location = %location, "Job finished");
                self.store.update(job_id, |job| job.complete(location))
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Job failed");
                let diagnostic = e.diagnostic();
                self.store.update(job_id, |job| job.fail(diagnostic))
            }
        };
        if let Err(e) = updated {
            error!(job_id = %job_id, error = %e, "Failed to record job outcome");
        }
    }

    async fn convert(&self, job_id: &str, source: &str) -> Result<String> {
        let format = self.config.format_selector.as_str();
        let (media, proxy) = self.resolve_with_retry(source, format).await?;

        self.store.update(job_id, |job| {
            job.title = Some(media.title.clone());
            job.advance(PROGRESS_RESOLVED);
            Ok(())
        })?;

        let producer = self
            .resolver
            .producer_command(source, format, proxy.as_deref());
        let transcoder = self.profile.command();
        let path = self.artifact_path(job_id);

        let (phase_tx, mut phase_rx) = mpsc::unbounded_channel();
        let progress = async {
            while let Some(phase) = phase_rx.recv().await {
                let value = match phase {
                    PipelinePhase::Spawned => PROGRESS_SPAWNED,
                    PipelinePhase::InputComplete => PROGRESS_INPUT_COMPLETE,
                    PipelinePhase::Finished => continue,
                };
                let _ = self.store.update(job_id, |job| {
                    job.advance(value);
                    Ok(())
                });
            }
        };

        let (outcome, ()) = tokio::join!(
            self.runner.run(
                &producer,
                &transcoder,
                PipelineSink::File(path.clone()),
                Some(phase_tx),
            ),
            progress
        );
        let PipelineOutcome {
            bytes_in,
            bytes_out,
        } = outcome?;

        info!(
            job_id = %job_id,
            path = %path.display(),
            bytes_in,
            bytes_out,
            "Artifact written"
        );

        Ok(self.result_location(job_id))
    }

    /// Resolve `source`, retrying resolution failures with a fresh proxy.
    async fn resolve_with_retry(
        &self,
        source: &str,
        format: &str,
    ) -> Result<(ResolvedMedia, Option<String>)> {
        let attempts = self.config.resolve_attempts.max(1);
        let mut attempt = 1;

        loop {
            let proxy = self.proxies.pick();
            debug!(source = %source, attempt, proxy = ?proxy, "Resolving source");

            match self.resolver.resolve(source, format, proxy.as_deref()).await {
                Ok(media) => return Ok((media, proxy)),
                Err(e @ Error::Resolution { .. }) if attempt < attempts => {
                    warn!(source = %source, attempt, error = %e, "Resolution failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve a reference without converting it.
    pub async fn resolve(&self, source: &str, format: Option<&str>) -> Result<ResolvedMedia> {
        let source = validate_reference(source)?;
        let format = format
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or(&self.config.format_selector);

        let (media, _) = self.resolve_with_retry(source, format).await?;
        Ok(media)
    }

    /// Locate the artifact of a finished job.
    ///
    /// Unknown jobs, unfinished jobs and vanished files are all `NotFound`.
    pub async fn fetch_artifact(&self, job_id: &str) -> Result<Artifact> {
        let job = self.get_status(job_id)?;
        if job.status != super::JobStatus::Done {
            return Err(Error::not_found("artifact", job_id));
        }

        let path = self.artifact_path(job_id);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::not_found("artifact", job_id))?;
        if !metadata.is_file() {
            return Err(Error::not_found("artifact", job_id));
        }

        Ok(Artifact {
            file_name: self.download_name(job.title.as_deref(), job_id),
            path,
            content_type: self.profile.content_type.clone(),
            size: metadata.len(),
        })
    }

    /// Resolve and transcode `source` straight to the caller.
    ///
    /// Errors up to the first transcoded chunk are returned here. Later
    /// failures end the body with an error item.
    pub async fn stream(&self, source: &str) -> Result<LiveStream> {
        let source = validate_reference(source)?.to_string();

        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Other(format!("Semaphore error: {e}")))?;

        let format = self.config.format_selector.clone();
        let (media, proxy) = self.resolve_with_retry(&source, &format).await?;
        info!(source = %source, title = %media.title, "Starting live stream");

        let producer = self
            .resolver
            .producer_command(&source, &format, proxy.as_deref());
        let transcoder = self.profile.command();
        let (tx, mut rx) = mpsc::channel::<Bytes>(self.config.stream_buffer_chunks);

        let runner = self.runner.clone();
        let handle: JoinHandle<Result<PipelineOutcome>> = tokio::spawn(async move {
            let _permit = permit;
            let result = runner
                .run(&producer, &transcoder, PipelineSink::Channel(tx), None)
                .await;
            match &result {
                Ok(outcome) => debug!(bytes_out = outcome.bytes_out, "Live stream finished"),
                Err(e) => debug!(error = %e, "Live stream ended with error"),
            }
            result
        });

        let first = match rx.recv().await {
            Some(chunk) => chunk,
            None => {
                return Err(match join_pipeline(handle).await {
                    Ok(_) => Error::Other("transcoder produced no output".to_string()),
                    Err(e) => e,
                });
            }
        };

        Ok(LiveStream {
            file_name: self.download_name(Some(&media.title), "audio"),
            title: media.title,
            content_type: self.profile.content_type.clone(),
            body: live_body(first, rx, handle),
        })
    }

    fn download_name(&self, title: Option<&str>, fallback: &str) -> String {
        let stem = title.map(sanitize_file_stem).unwrap_or_default();
        let stem = if stem.is_empty() { fallback } else { &stem };
        format!("{stem}.{}", self.profile.extension)
    }
}

async fn join_pipeline(handle: JoinHandle<Result<PipelineOutcome>>) -> Result<PipelineOutcome> {
    handle
        .await
        .unwrap_or_else(|e| Err(Error::Other(format!("pipeline task failed: {e}"))))
}

enum BodyState {
    First(Bytes, mpsc::Receiver<Bytes>, JoinHandle<Result<PipelineOutcome>>),
    Streaming(mpsc::Receiver<Bytes>, JoinHandle<Result<PipelineOutcome>>),
    Done,
}

fn live_body(
    first: Bytes,
    rx: mpsc::Receiver<Bytes>,
    handle: JoinHandle<Result<PipelineOutcome>>,
) -> BoxStream<'static, io::Result<Bytes>> {
    stream::unfold(BodyState::First(first, rx, handle), |state| async move {
        match state {
            BodyState::First(chunk, rx, handle) => {
                Some((Ok(chunk), BodyState::Streaming(rx, handle)))
            }
            BodyState::Streaming(mut rx, handle) => match rx.recv().await {
                Some(chunk) => Some((Ok(chunk), BodyState::Streaming(rx, handle))),
                None => match join_pipeline(handle).await {
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Live stream failed after first byte");
                        Some((Err(io::Error::other(e.to_string())), BodyState::Done))
                    }
                },
            },
            BodyState::Done => None,
        }
    })
    .boxed()
}

/// Keep characters that are safe in a `Content-Disposition` file name.
fn sanitize_file_stem(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '(' | ')' | '[' | ']') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace()).to_string()
}
