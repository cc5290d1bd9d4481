//! Producer → transcoder process pair.
//!
//! The producer's stdout is copied into the transcoder's stdin by one task;
//! with a live sink, a second task copies the transcoder's stdout into a
//! bounded channel. Both tasks are joined before the pipeline is declared
//! complete, and both processes are reaped on every exit path.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::CommandSpec;
use crate::utils::fs;
use crate::{Error, Result};

/// Chunk size for producer → transcoder copies.
pub const DEFAULT_PIPE_CHUNK_SIZE: usize = 1024 * 1024;

/// Chunk size for transcoder → live channel copies.
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Where the transcoder's output goes.
#[derive(Debug)]
pub enum PipelineSink {
    /// Transcoder stdout is redirected straight into this file.
    File(PathBuf),
    /// Transcoder stdout is forwarded chunk by chunk as it is produced.
    Channel(mpsc::Sender<Bytes>),
}

/// Coarse pipeline milestones, in the order they happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    /// Both processes are running.
    Spawned,
    /// The producer reached EOF and the transcoder's stdin was closed.
    InputComplete,
    /// Both processes exited successfully.
    Finished,
}

pub type PhaseSender = mpsc::UnboundedSender<PipelinePhase>;

/// Pipeline runner configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub pipe_chunk_size: usize,
    pub stream_chunk_size: usize,
    /// Stderr lines kept per process for diagnostics.
    pub stderr_tail_lines: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipe_chunk_size: DEFAULT_PIPE_CHUNK_SIZE,
            stream_chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
            stderr_tail_lines: process_utils::DEFAULT_TAIL_LINES,
        }
    }
}

/// Byte counters of a finished pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// Bytes copied from the producer into the transcoder.
    pub bytes_in: u64,
    /// Bytes the transcoder emitted.
    pub bytes_out: u64,
}

#[derive(Debug)]
enum ForwardError {
    Io(io::Error),
    Disconnected,
}

struct ProcessPair {
    producer: Child,
    transcoder: Child,
}

impl ProcessPair {
    fn start_kill(&mut self) {
        let _ = self.producer.start_kill();
        let _ = self.transcoder.start_kill();
    }

    async fn kill_and_reap(&mut self) {
        self.start_kill();
        let _ = self.producer.wait().await;
        let _ = self.transcoder.wait().await;
    }
}

struct PipeHandles {
    producer_stdout: ChildStdout,
    producer_stderr: ChildStderr,
    transcoder_stdin: ChildStdin,
    transcoder_stderr: ChildStderr,
    transcoder_stdout: Option<ChildStdout>,
}

impl PipeHandles {
    fn take(pair: &mut ProcessPair, want_stdout: bool) -> Option<Self> {
        let transcoder_stdout = if want_stdout {
            Some(pair.transcoder.stdout.take()?)
        } else {
            None
        };
        Some(Self {
            producer_stdout: pair.producer.stdout.take()?,
            producer_stderr: pair.producer.stderr.take()?,
            transcoder_stdin: pair.transcoder.stdin.take()?,
            transcoder_stderr: pair.transcoder.stderr.take()?,
            transcoder_stdout,
        })
    }
}

/// Runs producer/transcoder pairs.
#[derive(Debug, Clone, Default)]
pub struct PipelineRunner {
    config: PipelineConfig,
}

impl PipelineRunner {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Run `producer | transcoder > sink` to completion.
    ///
    /// A file sink that was partially written is removed on failure. With a
    /// channel sink, dropping the receiver kills both processes and the call
    /// returns [`Error::Cancelled`].
    pub async fn run(
        &self,
        producer: &CommandSpec,
        transcoder: &CommandSpec,
        sink: PipelineSink,
        phases: Option<PhaseSender>,
    ) -> Result<PipelineOutcome> {
        let artifact = match &sink {
            PipelineSink::File(path) => Some(path.clone()),
            PipelineSink::Channel(_) => None,
        };

        let result = self.execute(producer, transcoder, sink, phases).await;

        if result.is_err()
            && let Some(path) = artifact
            && let Err(e) = fs::remove_file_if_exists(&path).await
        {
            warn!(path = %path.display(), error = %e, "Failed to remove partial artifact");
        }

        result
    }

    async fn execute(
        &self,
        producer_spec: &CommandSpec,
        transcoder_spec: &CommandSpec,
        sink: PipelineSink,
        phases: Option<PhaseSender>,
    ) -> Result<PipelineOutcome> {
        let (transcoder_stdout, channel, artifact) = match sink {
            PipelineSink::File(path) => {
                fs::ensure_parent_dir(&path).await?;
                let file = tokio::fs::File::create(&path)
                    .await
                    .map_err(|e| fs::io_error("creating artifact", &path, e))?;
                (Stdio::from(file.into_std().await), None, Some(path))
            }
            PipelineSink::Channel(tx) => (Stdio::piped(), Some(tx), None),
        };

        debug!(producer = %producer_spec, transcoder = %transcoder_spec, "Spawning pipeline");

        let mut producer = producer_spec
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::spawn(&producer_spec.program, e))?;

        let transcoder = transcoder_spec
            .to_command()
            .stdin(Stdio::piped())
            .stdout(transcoder_stdout)
            .stderr(Stdio::piped())
            .spawn();
        let transcoder = match transcoder {
            Ok(child) => child,
            Err(e) => {
                let _ = producer.start_kill();
                let _ = producer.wait().await;
                return Err(Error::spawn(&transcoder_spec.program, e));
            }
        };

        let mut pair = ProcessPair {
            producer,
            transcoder,
        };

        let Some(handles) = PipeHandles::take(&mut pair, channel.is_some()) else {
            pair.kill_and_reap().await;
            return Err(Error::Other("Failed to capture pipeline stdio".to_string()));
        };

        notify(&phases, PipelinePhase::Spawned);

        let tail_lines = self.config.stderr_tail_lines;
        let producer_tail = tokio::spawn(process_utils::collect_tail(handles.producer_stderr, tail_lines));
        let transcoder_tail =
            tokio::spawn(process_utils::collect_tail(handles.transcoder_stderr, tail_lines));

        let cancel = CancellationToken::new();

        let pump_task = tokio::spawn(pump(
            handles.producer_stdout,
            handles.transcoder_stdin,
            self.config.pipe_chunk_size,
            cancel.clone(),
            phases.clone(),
        ));
        let forward_task = match (handles.transcoder_stdout, channel) {
            (Some(stdout), Some(tx)) => Some(tokio::spawn(forward(
                stdout,
                tx,
                self.config.stream_chunk_size,
                cancel.clone(),
            ))),
            _ => None,
        };

        let copies = async move {
            let pumped = pump_task.await.unwrap_or_else(|e| Err(io::Error::other(e)));
            let forwarded = match forward_task {
                Some(handle) => Some(
                    handle
                        .await
                        .unwrap_or_else(|e| Err(ForwardError::Io(io::Error::other(e)))),
                ),
                None => None,
            };
            (pumped, forwarded)
        };
        tokio::pin!(copies);

        let (pumped, forwarded) = tokio::select! {
            res = &mut copies => res,
            _ = cancel.cancelled() => {
                debug!("Pipeline copy stopped early; killing both processes");
                pair.start_kill();
                copies.await
            }
        };

        let transcoder_status = pair.transcoder.wait().await;
        let producer_status = pair.producer.wait().await;
        let producer_stderr = producer_tail.await.unwrap_or_default();
        let transcoder_stderr = transcoder_tail.await.unwrap_or_default();

        let forwarded = match forwarded {
            Some(Err(ForwardError::Disconnected)) => {
                return Err(Error::Cancelled(
                    "live stream consumer disconnected".to_string(),
                ));
            }
            Some(Err(ForwardError::Io(e))) => Some(Err(e)),
            Some(Ok(n)) => Some(Ok(n)),
            None => None,
        };

        let transcoder_status = transcoder_status?;
        let producer_status = producer_status?;

        // A producer that failed after delivering all it had starves the
        // transcoder, so its diagnostic is the one worth reporting.
        if !producer_status.success() && pumped.is_ok() {
            return Err(Error::Producer {
                code: producer_status.code(),
                stderr: producer_stderr,
            });
        }

        if !transcoder_status.success() {
            return Err(Error::Transcode {
                code: transcoder_status.code(),
                stderr: transcoder_stderr,
            });
        }

        if !producer_status.success() {
            return Err(Error::Producer {
                code: producer_status.code(),
                stderr: producer_stderr,
            });
        }

        let bytes_in = pumped?;
        let bytes_out = match (forwarded, artifact) {
            (Some(forwarded), _) => forwarded?,
            (None, Some(path)) => tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0),
            (None, None) => 0,
        };

        notify(&phases, PipelinePhase::Finished);

        Ok(PipelineOutcome {
            bytes_in,
            bytes_out,
        })
    }
}

fn notify(phases: &Option<PhaseSender>, phase: PipelinePhase) {
    if let Some(tx) = phases {
        let _ = tx.send(phase);
    }
}

fn interrupted() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "pipeline cancelled")
}

/// Producer stdout → transcoder stdin. Dropping stdin at the end is the
/// transcoder's end-of-input signal.
async fn pump(
    mut reader: ChildStdout,
    mut writer: ChildStdin,
    chunk_size: usize,
    cancel: CancellationToken,
    phases: Option<PhaseSender>,
) -> io::Result<u64> {
    let result = copy_chunks(&mut reader, &mut writer, chunk_size, &cancel).await;
    let _ = writer.shutdown().await;
    drop(writer);

    match &result {
        Ok(bytes) => {
            debug!(bytes, "Producer output exhausted; transcoder input closed");
            notify(&phases, PipelinePhase::InputComplete);
        }
        Err(e) => {
            debug!(error = %e, "Producer to transcoder copy failed");
            cancel.cancel();
        }
    }
    result
}

async fn copy_chunks<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(interrupted()),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(total);
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(interrupted()),
            written = writer.write_all(&buf[..n]) => written?,
        }
        total += n as u64;
    }
}

/// Transcoder stdout → live channel.
async fn forward<R>(
    mut reader: R,
    tx: mpsc::Sender<Bytes>,
    chunk_size: usize,
    cancel: CancellationToken,
) -> std::result::Result<u64, ForwardError>
where
    R: AsyncRead + Unpin,
{
    let result = forward_chunks(&mut reader, &tx, chunk_size, &cancel).await;
    if result.is_err() {
        cancel.cancel();
    }
    result
}

async fn forward_chunks<R>(
    reader: &mut R,
    tx: &mpsc::Sender<Bytes>,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> std::result::Result<u64, ForwardError>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0u64;

    loop {
        let mut buf = BytesMut::with_capacity(chunk_size.max(1));
        let n = tokio::select! {
            _ = tx.closed() => return Err(ForwardError::Disconnected),
            _ = cancel.cancelled() => return Err(ForwardError::Io(interrupted())),
            read = reader.read_buf(&mut buf) => read.map_err(ForwardError::Io)?,
        };
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        tx.send(buf.freeze())
            .await
            .map_err(|_| ForwardError::Disconnected)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_chunks_copies_everything() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = &data[..];
        let mut out: Vec<u8> = Vec::new();

        let copied = copy_chunks(&mut reader, &mut out, 1024, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(copied, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn copy_chunks_stops_when_cancelled() {
        let (_writer, mut reader) = tokio::io::duplex(64);
        let mut out: Vec<u8> = Vec::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = copy_chunks(&mut reader, &mut out, 16, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn forward_chunks_respects_chunk_size() {
        let data = vec![7u8; 1000];
        let mut reader = &data[..];
        let (tx, mut rx) = mpsc::channel(64);

        let total = forward_chunks(&mut reader, &tx, 300, &CancellationToken::new())
            .await
            .unwrap();
        drop(tx);

        let mut sizes = Vec::new();
        while let Some(chunk) = rx.recv().await {
            sizes.push(chunk.len());
        }
        assert_eq!(total, 1000);
        assert_eq!(sizes.iter().sum::<usize>(), 1000);
        assert!(sizes.iter().all(|s| *s <= 300));
    }

    #[tokio::test]
    async fn forward_chunks_detects_dropped_receiver() {
        let (_writer, mut reader) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let result = forward_chunks(&mut reader, &tx, 16, &CancellationToken::new()).await;
        assert!(matches!(result, Err(ForwardError::Disconnected)));
    }

    #[cfg(unix)]
    mod processes {
        use super::*;
        use std::time::Duration;
        use tempfile::TempDir;

        fn sh(script: &str) -> CommandSpec {
            CommandSpec::new("sh", ["-c", script])
        }

        #[tokio::test]
        async fn file_sink_receives_transcoded_bytes() {
            let temp = TempDir::new().unwrap();
            let path = temp.path().join("out").join("job.mp3");
            let (phase_tx, mut phase_rx) = mpsc::unbounded_channel();

            let outcome = PipelineRunner::default()
                .run(
                    &sh("printf hello"),
                    &CommandSpec::new("tr", ["a-z", "A-Z"]),
                    PipelineSink::File(path.clone()),
                    Some(phase_tx),
                )
                .await
                .unwrap();

            assert_eq!(outcome.bytes_in, 5);
            assert_eq!(outcome.bytes_out, 5);
            assert_eq!(tokio::fs::read(&path).await.unwrap(), b"HELLO");

            let mut phases = Vec::new();
            while let Some(phase) = phase_rx.recv().await {
                phases.push(phase);
            }
            assert_eq!(
                phases,
                vec![
                    PipelinePhase::Spawned,
                    PipelinePhase::InputComplete,
                    PipelinePhase::Finished
                ]
            );
        }

        #[tokio::test]
        async fn channel_sink_streams_all_bytes() {
            let (tx, mut rx) = mpsc::channel(4);
            let runner = PipelineRunner::new(PipelineConfig {
                stream_chunk_size: 64,
                ..Default::default()
            });

            let handle = tokio::spawn(async move {
                runner
                    .run(
                        &sh("i=0; while [ $i -lt 50 ]; do printf 0123456789; i=$((i+1)); done"),
                        &CommandSpec::new("cat", Vec::<String>::new()),
                        PipelineSink::Channel(tx),
                        None,
                    )
                    .await
            });

            let mut received = Vec::new();
            while let Some(chunk) = rx.recv().await {
                assert!(!chunk.is_empty());
                assert!(chunk.len() <= 64);
                received.extend_from_slice(&chunk);
            }

            let outcome = handle.await.unwrap().unwrap();
            assert_eq!(received.len(), 500);
            assert_eq!(outcome.bytes_out, 500);
        }

        #[tokio::test]
        async fn failing_transcoder_reports_stderr_and_removes_artifact() {
            let temp = TempDir::new().unwrap();
            let path = temp.path().join("job.mp3");

            let err = PipelineRunner::default()
                .run(
                    &sh("printf data"),
                    &sh("cat >/dev/null; echo 'Invalid data found' >&2; exit 3"),
                    PipelineSink::File(path.clone()),
                    None,
                )
                .await
                .unwrap_err();

            match err {
                Error::Transcode { code, stderr } => {
                    assert_eq!(code, Some(3));
                    assert!(stderr.contains("Invalid data found"));
                }
                other => panic!("unexpected error: {other:?}"),
            }
            assert!(!path.exists());
        }

        #[tokio::test]
        async fn failing_producer_is_a_hard_failure() {
            let temp = TempDir::new().unwrap();
            let path = temp.path().join("job.mp3");

            let err = PipelineRunner::default()
                .run(
                    &sh("printf partial; echo 'HTTP Error 403' >&2; exit 2"),
                    &CommandSpec::new("cat", Vec::<String>::new()),
                    PipelineSink::File(path.clone()),
                    None,
                )
                .await
                .unwrap_err();

            match err {
                Error::Producer { code, stderr } => {
                    assert_eq!(code, Some(2));
                    assert!(stderr.contains("403"));
                }
                other => panic!("unexpected error: {other:?}"),
            }
            assert!(!path.exists());
        }

        #[tokio::test]
        async fn producer_failure_wins_when_both_processes_fail() {
            let temp = TempDir::new().unwrap();
            let path = temp.path().join("job.mp3");

            let err = PipelineRunner::default()
                .run(
                    &sh("echo 'ERROR: HTTP Error 403: Forbidden' >&2; exit 1"),
                    &sh("cat >/dev/null; echo 'pipe:0: Invalid data found when processing input' >&2; exit 1"),
                    PipelineSink::File(path.clone()),
                    None,
                )
                .await
                .unwrap_err();

            match err {
                Error::Producer { code, stderr } => {
                    assert_eq!(code, Some(1));
                    assert!(stderr.contains("HTTP Error 403"));
                }
                other => panic!("unexpected error: {other:?}"),
            }
            assert!(!path.exists());
        }

        #[tokio::test]
        async fn missing_binary_is_a_spawn_error() {
            let (tx, _rx) = mpsc::channel(1);
            let err = PipelineRunner::default()
                .run(
                    &CommandSpec::new("/nonexistent/producer", Vec::<String>::new()),
                    &CommandSpec::new("cat", Vec::<String>::new()),
                    PipelineSink::Channel(tx),
                    None,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Spawn { .. }));
        }

        #[tokio::test]
        async fn dropping_the_receiver_kills_both_processes() {
            let (tx, mut rx) = mpsc::channel(1);
            let runner = PipelineRunner::new(PipelineConfig {
                stream_chunk_size: 16,
                ..Default::default()
            });

            let handle = tokio::spawn(async move {
                runner
                    .run(
                        &sh("while :; do echo endless; done"),
                        &CommandSpec::new("cat", Vec::<String>::new()),
                        PipelineSink::Channel(tx),
                        None,
                    )
                    .await
            });

            assert!(rx.recv().await.is_some());
            drop(rx);

            let result = tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("pipeline did not stop after disconnect")
                .unwrap();
            assert!(matches!(result, Err(Error::Cancelled(_))));
        }
    }
}
