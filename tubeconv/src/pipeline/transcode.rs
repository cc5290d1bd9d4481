//! Transcoder command line.

use super::CommandSpec;

/// Target audio format and the ffmpeg invocation producing it.
///
/// The transcoder always reads from stdin and writes to stdout; the
/// pipeline decides whether stdout is a file or a live channel.
#[derive(Debug, Clone)]
pub struct TranscodeProfile {
    /// Path to the ffmpeg binary.
    pub binary_path: String,
    /// Audio encoder, e.g. `libmp3lame`.
    pub codec: String,
    /// Constant bitrate such as `192k`. Takes precedence over `quality`.
    pub bitrate: Option<String>,
    /// Encoder VBR quality (`-q:a`), `0` being best.
    pub quality: Option<String>,
    /// Output muxer passed to `-f`.
    pub container: String,
    /// Artifact file extension.
    pub extension: String,
    /// MIME type served for the produced bytes.
    pub content_type: String,
    /// Additional arguments placed before the output.
    pub extra_args: Vec<String>,
}

impl Default for TranscodeProfile {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            codec: "libmp3lame".to_string(),
            bitrate: None,
            quality: Some("0".to_string()),
            container: "mp3".to_string(),
            extension: "mp3".to_string(),
            content_type: "audio/mpeg".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl TranscodeProfile {
    pub fn command(&self) -> CommandSpec {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-vn"]
            .into_iter()
            .map(String::from)
            .collect();

        args.extend(["-c:a".to_string(), self.codec.clone()]);

        if let Some(ref bitrate) = self.bitrate {
            args.extend(["-b:a".to_string(), bitrate.clone()]);
        } else if let Some(ref quality) = self.quality {
            args.extend(["-q:a".to_string(), quality.clone()]);
        }

        args.extend(self.extra_args.iter().cloned());
        args.extend(["-f".to_string(), self.container.clone(), "pipe:1".to_string()]);

        CommandSpec::new(self.binary_path.clone(), args)
    }
}
