//! Application-wide error types.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a resolver failure, derived from its diagnostic text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionErrorKind {
    /// The media does not exist, was removed, or is private.
    Unavailable,
    /// Sign-in, age verification or another access check is required.
    AccessDenied,
    /// The reference is not something the resolver understands.
    InvalidReference,
    /// The upstream throttled the request.
    RateLimited,
    Other,
}

impl ResolutionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::AccessDenied => "access_denied",
            Self::InvalidReference => "invalid_reference",
            Self::RateLimited => "rate_limited",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ResolutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Resolution failed: {message}")]
    Resolution {
        kind: ResolutionErrorKind,
        message: String,
    },

    #[error("Producer exited with {}: {stderr}", exit_label(*code))]
    Producer { code: Option<i32>, stderr: String },

    #[error("Transcoder exited with {}: {stderr}", exit_label(*code))]
    Transcode { code: Option<i32>, stderr: String },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} at {path}: {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code".to_string(),
    }
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn resolution(kind: ResolutionErrorKind, message: impl Into<String>) -> Self {
        Self::Resolution {
            kind,
            message: message.into(),
        }
    }

    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Human-readable diagnostic recorded on a failed job.
    ///
    /// Resolver failures report the tool's own text rather than the wrapper message.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Resolution { message, .. } => message.clone(),
            _ => self.to_string(),
        }
    }
}
