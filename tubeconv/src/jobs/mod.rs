//! Conversion jobs: record model, registry and orchestrator.

mod model;
mod orchestrator;
mod store;

pub use model::{
    Job, JobStatus, PROGRESS_ADMITTED, PROGRESS_DONE, PROGRESS_INPUT_COMPLETE, PROGRESS_RESOLVED,
    PROGRESS_SPAWNED,
};
pub use orchestrator::{Artifact, JobOrchestrator, LiveStream, OrchestratorConfig};
pub use store::JobStore;
