//! Conversion job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Progress reported once a job has been admitted.
pub const PROGRESS_ADMITTED: u8 = 10;
/// Progress reported after the source was resolved.
pub const PROGRESS_RESOLVED: u8 = 25;
/// Progress reported once both pipeline processes are running.
pub const PROGRESS_SPAWNED: u8 = 40;
/// Progress reported when the producer reached end of input.
pub const PROGRESS_INPUT_COMPLETE: u8 = 85;
pub const PROGRESS_DONE: u8 = 100;

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted and waiting for an admission slot.
    #[default]
    Initializing,
    /// Holding a slot; resolving or transcoding.
    Downloading,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Downloading => "downloading",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Forward-only: no state is ever revisited.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Initializing, Downloading) | (Downloading, Done) | (Initializing | Downloading, Error)
        )
    }

    pub fn transition_to(&self, target: JobStatus) -> Result<JobStatus> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::invalid_transition(self.as_str(), target.as_str()))
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one conversion job.
///
/// `result_location` is set only in `done` and `error` only in `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub source: String,
    pub status: JobStatus,
    pub progress: u8,
    pub title: Option<String>,
    pub result_location: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source: source.into(),
            status: JobStatus::Initializing,
            progress: 0,
            title: None,
            result_location: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, target: JobStatus) -> Result<()> {
        self.status = self.status.transition_to(target)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn start_downloading(&mut self) -> Result<()> {
        self.transition(JobStatus::Downloading)?;
        self.advance(PROGRESS_ADMITTED);
        Ok(())
    }

    /// Raise progress; lower values are ignored.
    pub fn advance(&mut self, progress: u8) {
        let progress = progress.min(PROGRESS_DONE);
        if progress > self.progress {
            self.progress = progress;
            self.updated_at = Utc::now();
        }
    }

    pub fn complete(&mut self, result_location: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Done)?;
        self.progress = PROGRESS_DONE;
        self.result_location = Some(result_location.into());
        self.error = None;
        Ok(())
    }

    /// Progress keeps its last value.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Error)?;
        self.error = Some(error.into());
        self.result_location = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_forward_transitions_are_allowed() {
        use JobStatus::*;

        assert!(Initializing.can_transition_to(Downloading));
        assert!(Initializing.can_transition_to(Error));
        assert!(Downloading.can_transition_to(Done));
        assert!(Downloading.can_transition_to(Error));

        assert!(!Initializing.can_transition_to(Done));
        assert!(!Downloading.can_transition_to(Initializing));
        assert!(!Done.can_transition_to(Error));
        assert!(!Error.can_transition_to(Downloading));
        assert!(!Downloading.can_transition_to(Downloading));
    }

    #[test]
    fn completed_job_carries_only_a_result() {
        let mut job = Job::new("id", "src");
        job.start_downloading().unwrap();
        job.advance(PROGRESS_SPAWNED);
        job.complete("/api/jobs/id/download").unwrap();

        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.progress, 100);
        assert!(job.result_location.is_some());
        assert!(job.error.is_none());

        let err = job.fail("late").unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn failed_job_keeps_last_progress() {
        let mut job = Job::new("id", "src");
        job.start_downloading().unwrap();
        job.advance(PROGRESS_RESOLVED);
        job.fail("boom").unwrap();

        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.progress, PROGRESS_RESOLVED);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.result_location.is_none());
    }

    #[test]
    fn progress_never_decreases() {
        let mut job = Job::new("id", "src");
        job.advance(40);
        job.advance(20);
        assert_eq!(job.progress, 40);
        job.advance(250);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_value(Job::new("id", "src")).unwrap();
        assert_eq!(json["status"], "initializing");
        assert_eq!(json["progress"], 0);
        assert!(json["result_location"].is_null());
    }
}
