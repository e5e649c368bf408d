//! Typed error hierarchy for the QRALPH engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — persistence, locking, and integrity failures
//! - `PipelineError` — phase preconditions and gate failures
//! - `RegistryError` — process-registry refusals

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the state store and atomic file helpers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Refusing to write: parent directory is a symlink: {path}")]
    ParentSymlink { path: PathBuf },

    #[error("JSON serialization for {path} did not round-trip")]
    RoundTrip { path: PathBuf },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to acquire lock on {path}: {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("project_path escapes the projects root: {path}")]
    PathEscape { path: PathBuf },
}

/// Errors from pipeline commands. These surface as `{"error": ...}` JSON
/// with exit code 1; the state machine itself reports recoverable
/// preconditions as `error` actions instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No active project. Run 'plan' first.")]
    NoActiveProject,

    #[error("Cannot {command} in phase {actual}. Must be in {expected}.")]
    WrongPhase {
        command: String,
        expected: String,
        actual: String,
    },

    #[error("Request too long ({len} chars, max {max})")]
    RequestTooLong { len: usize, max: usize },

    #[error("No manifest.json found. Run plan-collect first.")]
    MissingManifest,

    #[error("No tasks defined in manifest.json. Define tasks before finalizing.")]
    NoTasks,

    #[error("No agent outputs found. Write agent results to agent-outputs/ first.")]
    NoAgentOutputs,

    #[error("No verification result. Write verification output to verification/result.md first.")]
    NoVerificationResult,

    #[error("Verification FAILED. Review verification/result.md before finalizing.")]
    VerificationFailed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the process registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("PID {pid} not owned by caller (ppid mismatch)")]
    NotParent { pid: u32 },

    #[error("Registry project_id '{registered}' does not match '{requested}'")]
    ProjectMismatch {
        registered: String,
        requested: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_path_escape_carries_path() {
        let err = StoreError::PathEscape {
            path: PathBuf::from("/etc/passwd"),
        };
        assert!(err.to_string().contains("/etc/passwd"));
    }

    #[test]
    fn pipeline_error_wrong_phase_names_both_phases() {
        let err = PipelineError::WrongPhase {
            command: "execute".into(),
            expected: "EXECUTE".into(),
            actual: "PLAN".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("EXECUTE"));
        assert!(msg.contains("PLAN"));
    }

    #[test]
    fn pipeline_error_converts_from_store_error() {
        let inner = StoreError::RoundTrip {
            path: PathBuf::from("/tmp/x.json"),
        };
        let err: PipelineError = inner.into();
        assert!(matches!(err, PipelineError::Store(StoreError::RoundTrip { .. })));
    }

    #[test]
    fn registry_error_not_parent_carries_pid() {
        let err = RegistryError::NotParent { pid: 4242 };
        assert!(err.to_string().contains("4242"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::PathEscape { path: PathBuf::new() });
        assert_std_error(&PipelineError::NoActiveProject);
        assert_std_error(&RegistryError::NotParent { pid: 1 });
    }
}
