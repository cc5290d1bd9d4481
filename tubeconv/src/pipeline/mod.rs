//! External process pipeline: producer → transcoder → sink.

mod command;
mod runner;
mod transcode;

pub use command::CommandSpec;
pub use runner::{
    DEFAULT_PIPE_CHUNK_SIZE, DEFAULT_STREAM_CHUNK_SIZE, PhaseSender, PipelineConfig,
    PipelineOutcome, PipelinePhase, PipelineRunner, PipelineSink,
};
pub use transcode::TranscodeProfile;
