//! Error taxonomy shared by the library and its callers.
//!
//! Every variant names the offending artifact or reference and the rule that
//! was violated; the CLI prints these and exits 1, the HTTP API maps them to
//! 4xx bodies.

use crate::types::ArtifactKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VeError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("Cannot transition from {from} to {to}. {detail}")]
    IllegalTransition {
        kind: ArtifactKind,
        from: String,
        to: String,
        detail: String,
    },

    #[error("invalid {field}: {reason}")]
    ValidationFailure { field: String, reason: String },

    #[error("{kind} with short name '{name}' already exists")]
    CollisionDetected { kind: ArtifactKind, name: String },

    #[error("cycle detected in {kind} causal ordering involving: {}", participants.join(", "))]
    CycleInKind {
        kind: ArtifactKind,
        participants: Vec<String>,
    },

    #[error("git {op} failed: {detail}")]
    GitFailure { op: String, detail: String },

    #[error("failed to refresh cached repository '{repo}': {detail}")]
    CacheRefreshFailed { repo: String, detail: String },

    #[error("orchestrator daemon is not running")]
    DaemonNotRunning,

    #[error("orchestrator daemon already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("timed out connecting to the daemon")]
    ConnectTimeout,

    #[error("malformed frontmatter in {path}: {reason}")]
    Frontmatter { path: String, reason: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VeError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build the transition error with the valid-next-states detail, matching
    /// the user-visible phrasing required by the CLI.
    pub fn illegal_transition(
        kind: ArtifactKind,
        from: &str,
        to: &str,
        allowed: &[&str],
    ) -> Self {
        let detail = if allowed.is_empty() {
            format!("{from} is a terminal state with no valid transitions")
        } else {
            format!("Valid transitions: {}", allowed.join(", "))
        };
        Self::IllegalTransition {
            kind,
            from: from.to_string(),
            to: to.to_string(),
            detail,
        }
    }
}

pub type Result<T> = std::result::Result<T, VeError>;
