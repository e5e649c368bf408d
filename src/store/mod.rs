//! Crash-safe persistent state store.
//!
//! The store owns `current-project.json`, its checkpoint mirror inside the
//! project directory, and the lock file guarding both. Loads verify the
//! embedded checksum and repair on mismatch; saves are atomic and refuse a
//! `project_path` that escapes the projects root.

pub mod atomic;
pub mod canonical;
pub mod lock;
pub mod state;

pub use lock::StateLock;
pub use state::{
    AgentConfig, CircuitBreakers, ExecutionGroup, ModelTier, Phase, PipelineState, State, SubPhase,
};

use crate::errors::StoreError;
use crate::paths::QralphPaths;
use canonical::{CHECKSUM_FIELD, state_checksum};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Handle to one working directory's persistent state.
#[derive(Debug, Clone)]
pub struct Store {
    state_file: PathBuf,
    lock_path: PathBuf,
    projects_dir: PathBuf,
}

impl Store {
    pub fn new(paths: &QralphPaths) -> Self {
        Self {
            state_file: paths.state_file(),
            lock_path: paths.state_lock(),
            projects_dir: paths.projects_dir(),
        }
    }

    /// Acquire the exclusive lock guarding read-modify-write cycles.
    pub fn lock(&self) -> Result<StateLock, StoreError> {
        StateLock::acquire(&self.lock_path)
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    /// Load the current state. Returns `None` when the file is missing or
    /// unparseable. On checksum mismatch, warns and returns the repaired
    /// state; the corrupt file is left untouched until the next save.
    pub fn load(&self) -> Option<State> {
        let content = atomic::read_locked(&self.state_file)?;
        if content.trim().is_empty() {
            return None;
        }

        let raw: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %self.state_file.display(), error = %e, "invalid JSON in state file");
                return None;
            }
        };

        if let Some(expected) = raw.get(CHECKSUM_FIELD).and_then(Value::as_str) {
            let actual = state_checksum(&raw);
            if expected != actual {
                warn!(
                    expected,
                    actual, "state checksum mismatch, returning repaired state"
                );
                return Some(State::repair(&raw));
            }
        }

        match serde_json::from_value::<State>(raw.clone()) {
            Ok(state) => {
                for issue in state.validate() {
                    warn!(issue = %issue, "state invariant violation");
                }
                Some(state)
            }
            Err(e) => {
                warn!(error = %e, "state schema violation, returning repaired state");
                Some(State::repair(&raw))
            }
        }
    }

    /// Persist the state atomically, recomputing its checksum. The caller
    /// must hold the exclusive lock for the whole read-modify-write cycle;
    /// the `StateLock` parameter is the proof.
    pub fn save(&self, _lock: &StateLock, state: &mut State) -> Result<(), StoreError> {
        self.assert_contained(&state.project_path)?;

        state.checksum = None;
        let value = serde_json::to_value(&*state).map_err(StoreError::Encode)?;
        state.checksum = Some(state_checksum(&value));

        atomic::safe_write_json(&self.state_file, state)
    }

    /// Mirror the state into the project's `checkpoints/state.json`.
    pub fn save_checkpoint(&self, state: &State) -> Result<(), StoreError> {
        let checkpoint = state.project_path.join("checkpoints").join("state.json");
        atomic::safe_write_json(&checkpoint, state)
    }

    /// Reject any project path that does not resolve inside the projects
    /// root. Called before every disk write of the state.
    pub fn assert_contained(&self, project_path: &Path) -> Result<(), StoreError> {
        let root = self
            .projects_dir
            .canonicalize()
            .unwrap_or_else(|_| self.projects_dir.clone());
        let resolved = project_path
            .canonicalize()
            .unwrap_or_else(|_| project_path.to_path_buf());
        if resolved.starts_with(&root) && resolved != root {
            Ok(())
        } else {
            Err(StoreError::PathEscape {
                path: project_path.to_path_buf(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> Store {
        let paths = QralphPaths::from_working_dir(dir.path());
        fs::create_dir_all(paths.projects_dir()).unwrap();
        Store::new(&paths)
    }

    fn state_for(store: &Store, id: &str) -> State {
        let project_path = store.projects_dir().join(id);
        fs::create_dir_all(&project_path).unwrap();
        State {
            project_id: id.to_string(),
            project_path,
            target_directory: store.projects_dir().parent().unwrap().to_path_buf(),
            request: "audit the code".to_string(),
            phase: Phase::Plan,
            template: "code-audit".to_string(),
            pipeline: PipelineState::default(),
            circuit_breakers: CircuitBreakers::default(),
            heal_attempts: 0,
            created_at: Utc::now(),
            completed_at: None,
            checksum: None,
        }
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(store_in(&dir).load().is_none());
    }

    #[test]
    fn test_save_then_load_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut state = state_for(&store, "001-audit");

        let lock = store.lock().unwrap();
        store.save(&lock, &mut state).unwrap();
        drop(lock);

        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
        assert!(loaded.checksum.is_some());
    }

    #[test]
    fn test_save_injects_valid_checksum() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut state = state_for(&store, "001-audit");

        let lock = store.lock().unwrap();
        store.save(&lock, &mut state).unwrap();
        drop(lock);

        let content = fs::read_to_string(dir.path().join(".qralph/current-project.json")).unwrap();
        let raw: Value = serde_json::from_str(&content).unwrap();
        let embedded = raw["_checksum"].as_str().unwrap().to_string();
        assert_eq!(embedded, state_checksum(&raw));
    }

    #[test]
    fn test_load_repairs_on_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut state = state_for(&store, "001-audit");

        let lock = store.lock().unwrap();
        store.save(&lock, &mut state).unwrap();
        drop(lock);

        // Flip a field without updating the checksum.
        let state_file = dir.path().join(".qralph/current-project.json");
        let content = fs::read_to_string(&state_file).unwrap();
        fs::write(&state_file, content.replace("\"PLAN\"", "\"EXECUTE\"")).unwrap();

        let loaded = store.load().unwrap();
        // Repaired state keeps parseable fields; the checksum is cleared.
        assert_eq!(loaded.project_id, "001-audit");
        assert!(loaded.checksum.is_none());
    }

    #[test]
    fn test_load_corrupt_json_is_none() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(dir.path().join(".qralph")).unwrap();
        fs::write(dir.path().join(".qralph/current-project.json"), "{broken").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn test_save_rejects_path_escape() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut state = state_for(&store, "001-audit");
        state.project_path = PathBuf::from("/etc/passwd");

        let lock = store.lock().unwrap();
        let result = store.save(&lock, &mut state);
        assert!(matches!(result, Err(StoreError::PathEscape { .. })));
        // Nothing was written.
        assert!(!dir.path().join(".qralph/current-project.json").exists());
    }

    #[test]
    fn test_assert_contained_rejects_projects_root_itself() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.assert_contained(&store.projects_dir().to_path_buf()).is_err());
    }

    #[test]
    fn test_checkpoint_mirrors_state() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut state = state_for(&store, "001-audit");

        let lock = store.lock().unwrap();
        store.save(&lock, &mut state).unwrap();
        store.save_checkpoint(&state).unwrap();
        drop(lock);

        let checkpoint = state.project_path.join("checkpoints/state.json");
        let mirrored: State =
            serde_json::from_str(&fs::read_to_string(&checkpoint).unwrap()).unwrap();
        assert_eq!(mirrored, state);
    }
}
