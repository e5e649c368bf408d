//! Filesystem layout for the QRALPH working directory.
//!
//! Everything the engine owns lives under `.qralph/` inside the directory the
//! CLI was invoked from. The layout is a value (`QralphPaths`) passed to each
//! subsystem rather than a module-level global, so tests can point the whole
//! engine at a temp directory.

use std::path::{Path, PathBuf};

/// Resolved paths for one QRALPH working directory.
#[derive(Debug, Clone)]
pub struct QralphPaths {
    /// The `.qralph` directory itself.
    root: PathBuf,
    /// The directory the CLI was invoked from (quality-gate detection probes here).
    working_dir: PathBuf,
}

impl QralphPaths {
    /// Build the layout rooted at `<working_dir>/.qralph`.
    pub fn from_working_dir(working_dir: &Path) -> Self {
        Self {
            root: working_dir.join(".qralph"),
            working_dir: working_dir.to_path_buf(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `projects/` — one subdirectory per project.
    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    /// `current-project.json` — the global state pointer.
    pub fn state_file(&self) -> PathBuf {
        self.root.join("current-project.json")
    }

    /// `state.lock` — exclusive-lock file held across read-modify-write cycles.
    pub fn state_lock(&self) -> PathBuf {
        self.root.join("state.lock")
    }

    /// `process-registry.json` — spawned-PID bookkeeping.
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("process-registry.json")
    }

    /// `process-registry.lock` — sibling lock for the registry.
    pub fn registry_lock(&self) -> PathBuf {
        self.root.join("process-registry.lock")
    }

    /// `process-kills.log` — append-only audit of kill decisions.
    pub fn kill_log(&self) -> PathBuf {
        self.root.join("process-kills.log")
    }

    /// `qralph.toml` — research tools, pricing, platform settings.
    pub fn config_file(&self) -> PathBuf {
        self.root.join("qralph.toml")
    }
}
