//! Process-lifecycle registry.
//!
//! Tracks child processes spawned during a run, identifies genuine orphans,
//! and refuses to kill anything it cannot positively identify. All
//! operations hold an exclusive advisory lock on a sibling lock file around
//! the load/modify/save cycle. The registry never touches an unregistered
//! process.

pub mod supervisor;

pub use supervisor::{ProcessKind, ProcessSupervisor};

use crate::breakers::ORPHAN_TRIP_THRESHOLD;
use crate::decisions::append_line;
use crate::errors::RegistryError;
use crate::paths::QralphPaths;
use crate::store::atomic::{safe_read_json, safe_write, safe_write_json};
use crate::store::lock::StateLock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// How long a kill waits between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// One registered child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub pid: u32,
    #[serde(rename = "type")]
    pub kind: ProcessKind,
    pub spawned_at: DateTime<Utc>,
    pub purpose: String,
}

impl RegistryEntry {
    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.spawned_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// The persisted registry document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub session_id: Uuid,
    pub project_id: Option<String>,
    pub parent_pid: u32,
    #[serde(default)]
    pub spawned_processes: Vec<RegistryEntry>,
    /// Per-kind grace periods in seconds, persisted for visibility.
    #[serde(default)]
    pub grace_periods: BTreeMap<String, u64>,
}

impl Registry {
    fn fresh() -> Self {
        let mut grace_periods = BTreeMap::new();
        for kind in [
            ProcessKind::Node,
            ProcessKind::Vitest,
            ProcessKind::Claude,
            ProcessKind::TeamAgent,
        ] {
            grace_periods.insert(kind.to_string(), kind.grace_period().as_secs());
        }
        grace_periods.insert("default".to_string(), 900);

        Self {
            session_id: Uuid::new_v4(),
            project_id: None,
            parent_pid: std::process::id(),
            spawned_processes: Vec::new(),
            grace_periods,
        }
    }

    fn grace_for(&self, kind: &ProcessKind) -> Duration {
        self.grace_periods
            .get(&kind.to_string())
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| kind.grace_period())
    }
}

/// Outcome of a sweep.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SweepReport {
    pub status: String,
    pub alive: Vec<serde_json::Value>,
    pub dead: Vec<serde_json::Value>,
    pub killed: Vec<serde_json::Value>,
    pub warned: Vec<serde_json::Value>,
    pub dry_run: bool,
    pub orphan_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_tripped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_message: Option<String>,
}

/// Outcome of a cleanup.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub status: String,
    pub project_id: String,
    pub killed_count: usize,
    pub killed: Vec<serde_json::Value>,
}

/// Outcome of a status query.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: String,
    pub session_id: Uuid,
    pub project_id: Option<String>,
    pub parent_pid: u32,
    pub parent_alive: bool,
    pub process_count: usize,
    pub processes: Vec<serde_json::Value>,
}

/// Handle to the on-disk registry.
#[derive(Debug)]
pub struct RegistryStore {
    registry_file: PathBuf,
    lock_path: PathBuf,
    kill_log: PathBuf,
    projects_dir: PathBuf,
    supervisor: ProcessSupervisor,
}

impl RegistryStore {
    pub fn new(paths: &QralphPaths) -> Self {
        Self {
            registry_file: paths.registry_file(),
            lock_path: paths.registry_lock(),
            kill_log: paths.kill_log(),
            projects_dir: paths.projects_dir(),
            supervisor: ProcessSupervisor::new(),
        }
    }

    fn load(&self) -> Registry {
        let raw = safe_read_json(&self.registry_file, serde_json::Value::Null);
        serde_json::from_value(raw).unwrap_or_else(|_| Registry::fresh())
    }

    fn save(&self, registry: &Registry) -> Result<(), RegistryError> {
        safe_write_json(&self.registry_file, registry)?;
        Ok(())
    }

    fn log(&self, message: &str) {
        append_line(&self.kill_log, message);
    }

    /// Bind the registry to a project so sweeps can pause it.
    pub fn set_project(&self, project_id: &str) -> Result<(), RegistryError> {
        let _lock = StateLock::acquire(&self.lock_path)?;
        let mut registry = self.load();
        registry.project_id = Some(project_id.to_string());
        self.save(&registry)
    }

    /// Register a spawned child. Rejected when the caller is verifiably not
    /// the parent of `pid`; allowed where parentage cannot be determined.
    pub fn register(
        &self,
        pid: u32,
        kind: ProcessKind,
        purpose: &str,
    ) -> Result<RegistryEntry, RegistryError> {
        if let Some(ppid) = self.supervisor.parent_pid(pid)
            && ppid != std::process::id()
        {
            self.log(&format!("REGISTER REJECTED PID {pid}: caller is not parent"));
            return Err(RegistryError::NotParent { pid });
        }

        let entry = RegistryEntry {
            pid,
            kind: kind.clone(),
            spawned_at: Utc::now(),
            purpose: purpose.to_string(),
        };

        {
            let _lock = StateLock::acquire(&self.lock_path)?;
            let mut registry = self.load();
            registry.spawned_processes.push(entry.clone());
            self.save(&registry)?;
        }
        self.log(&format!("REGISTER PID {pid} type={kind} purpose={purpose}"));

        Ok(entry)
    }

    /// Sweep registered pids for orphans.
    ///
    /// A pid is an orphan when it is alive, past its grace period, and the
    /// recorded parent is dead (or `force` is set). Identity is re-verified
    /// immediately before each kill; a mismatch is treated as PID reuse and
    /// aborts that kill only. Three or more orphans trip the circuit
    /// breaker: `PAUSE` is written into the project's CONTROL.md.
    pub fn sweep(&self, dry_run: bool, force: bool) -> Result<SweepReport, RegistryError> {
        let _lock = StateLock::acquire(&self.lock_path)?;
        let mut registry = self.load();
        let now = Utc::now();
        let parent_alive = self.supervisor.is_alive(registry.parent_pid);

        let mut report = SweepReport {
            status: "sweep_complete".to_string(),
            dry_run,
            ..SweepReport::default()
        };
        let mut remaining = Vec::new();

        for entry in std::mem::take(&mut registry.spawned_processes) {
            let pid = entry.pid;
            let kind = entry.kind.clone();

            if !self.supervisor.is_alive(pid) {
                self.log(&format!("SWEEP PID {pid} already dead (type={kind})"));
                report.dead.push(json!({
                    "pid": pid, "type": kind.to_string(), "purpose": entry.purpose.clone(),
                }));
                continue;
            }

            let age = entry.age(now);
            let past_grace = age > registry.grace_for(&kind);
            let is_orphan = (!parent_alive || force) && past_grace;

            if !is_orphan {
                report.alive.push(json!({
                    "pid": pid, "type": kind.to_string(), "purpose": entry.purpose.clone(),
                    "age_seconds": age.as_secs(),
                }));
                remaining.push(entry);
                continue;
            }

            report.orphan_count += 1;
            if dry_run {
                self.log(&format!(
                    "WARN DRY-RUN would kill PID {pid} (orphan, age={}s)",
                    age.as_secs()
                ));
                report.warned.push(json!({
                    "pid": pid, "type": kind.to_string(), "purpose": entry.purpose.clone(),
                    "age_seconds": age.as_secs(), "reason": "orphan (dry-run)",
                }));
                remaining.push(entry);
                continue;
            }

            if !self.supervisor.verify_identity(pid, &kind) {
                self.log(&format!(
                    "SKIP PID {pid}: identity changed (possible PID reuse), not killing"
                ));
                remaining.push(entry);
                continue;
            }

            let killed = self.kill_verified(pid);
            report.killed.push(json!({
                "pid": pid, "type": kind.to_string(), "purpose": entry.purpose.clone(),
                "age_seconds": age.as_secs(), "killed": killed,
            }));
            if !killed {
                remaining.push(entry);
            }
        }

        if !dry_run {
            registry.spawned_processes = remaining;
            self.save(&registry)?;
        }

        if report.orphan_count >= ORPHAN_TRIP_THRESHOLD
            && let Some(project_id) = &registry.project_id
        {
            if !dry_run {
                self.write_pause(project_id);
                self.log(&format!(
                    "CIRCUIT_BREAKER tripped for project {project_id}: {} orphans detected",
                    report.orphan_count
                ));
            }
            report.circuit_breaker_tripped = Some(true);
            report.circuit_breaker_message = Some(format!(
                "Circuit breaker tripped: {} orphans detected for project {project_id}. \
                 PAUSE written to CONTROL.md.",
                report.orphan_count
            ));
        }

        Ok(report)
    }

    /// Kill every still-live registered process for `project_id`, with the
    /// same identity discipline as the sweep. Used at run end.
    pub fn cleanup(&self, project_id: &str) -> Result<CleanupReport, RegistryError> {
        let _lock = StateLock::acquire(&self.lock_path)?;
        let mut registry = self.load();

        match &registry.project_id {
            Some(registered) if registered == project_id => {}
            other => {
                return Err(RegistryError::ProjectMismatch {
                    registered: other.clone().unwrap_or_default(),
                    requested: project_id.to_string(),
                });
            }
        }

        let mut killed = Vec::new();
        for entry in &registry.spawned_processes {
            let pid = entry.pid;
            if !self.supervisor.is_alive(pid) {
                self.log(&format!("CLEANUP PID {pid} already dead"));
                continue;
            }
            if !self.supervisor.verify_identity(pid, &entry.kind) {
                self.log(&format!("SKIP PID {pid}: process identity mismatch"));
                continue;
            }
            let success = self.kill_verified(pid);
            killed.push(json!({
                "pid": pid, "type": entry.kind.to_string(), "killed": success,
            }));
        }

        registry.spawned_processes.clear();
        self.save(&registry)?;
        self.log(&format!(
            "CLEANUP project {project_id}: killed {} processes",
            killed.len()
        ));

        Ok(CleanupReport {
            status: "cleaned".to_string(),
            project_id: project_id.to_string(),
            killed_count: killed.len(),
            killed,
        })
    }

    /// Report aliveness and age of every registered process.
    pub fn status(&self) -> StatusReport {
        let registry = self.load();
        let now = Utc::now();

        let processes: Vec<serde_json::Value> = registry
            .spawned_processes
            .iter()
            .map(|entry| {
                json!({
                    "pid": entry.pid,
                    "type": entry.kind.to_string(),
                    "purpose": entry.purpose.clone(),
                    "alive": self.supervisor.is_alive(entry.pid),
                    "age_seconds": entry.age(now).as_secs(),
                })
            })
            .collect();

        StatusReport {
            status: "ok".to_string(),
            session_id: registry.session_id,
            project_id: registry.project_id.clone(),
            parent_pid: registry.parent_pid,
            parent_alive: self.supervisor.is_alive(registry.parent_pid),
            process_count: processes.len(),
            processes,
        }
    }

    fn kill_verified(&self, pid: u32) -> bool {
        self.log(&format!("KILL SIGTERM sent to PID {pid}"));
        let gone = self.supervisor.terminate_gracefully(pid, TERM_GRACE);
        if gone {
            self.log(&format!("KILL PID {pid} terminated"));
        } else {
            self.log(&format!("KILL PID {pid} survived SIGKILL"));
        }
        gone
    }

    fn write_pause(&self, project_id: &str) {
        let control = self.projects_dir.join(project_id).join("CONTROL.md");
        if let Some(parent) = control.parent()
            && parent.exists()
            && let Err(e) = safe_write(
                &control,
                "PAUSE\n# Circuit breaker tripped: 3+ orphan processes detected\n",
            )
        {
            tracing::warn!(error = %e, "failed to write PAUSE to CONTROL.md");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry_in(dir: &TempDir) -> RegistryStore {
        RegistryStore::new(&QralphPaths::from_working_dir(dir.path()))
    }

    #[test]
    fn test_register_own_child() {
        let dir = TempDir::new().unwrap();
        let store = registry_in(&dir);

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();

        let entry = store
            .register(pid, ProcessKind::Other("sleep".to_string()), "test child")
            .unwrap();
        assert_eq!(entry.pid, pid);

        let status = store.status();
        assert_eq!(status.process_count, 1);
        assert_eq!(status.parent_pid, std::process::id());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_register_rejects_foreign_pid() {
        let dir = TempDir::new().unwrap();
        let store = registry_in(&dir);
        // PID 1 is never our child.
        let result = store.register(1, ProcessKind::Node, "not ours");
        assert!(matches!(result, Err(RegistryError::NotParent { pid: 1 })));
    }

    #[test]
    fn test_sweep_removes_dead_entries() {
        let dir = TempDir::new().unwrap();
        let store = registry_in(&dir);

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();
        store
            .register(pid, ProcessKind::Other("sleep".to_string()), "short-lived")
            .unwrap();
        child.kill().unwrap();
        child.wait().unwrap();

        let report = store.sweep(false, false).unwrap();
        assert_eq!(report.dead.len(), 1);
        assert_eq!(store.status().process_count, 0);
    }

    #[test]
    fn test_sweep_spares_processes_within_grace() {
        let dir = TempDir::new().unwrap();
        let store = registry_in(&dir);

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        store
            .register(child.id(), ProcessKind::Other("sleep".to_string()), "fresh")
            .unwrap();

        // force=true would bypass the parent check, but the child is well
        // within its 900 s grace period.
        let report = store.sweep(false, true).unwrap();
        assert_eq!(report.alive.len(), 1);
        assert!(report.killed.is_empty());
        assert_eq!(report.orphan_count, 0);

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_sweep_dry_run_kills_nothing() {
        let dir = TempDir::new().unwrap();
        let store = registry_in(&dir);

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();
        store
            .register(pid, ProcessKind::Other("sleep".to_string()), "dry-run target")
            .unwrap();

        // Backdate the spawn time so the entry is past grace.
        {
            let _lock = StateLock::acquire(&dir.path().join(".qralph/process-registry.lock")).unwrap();
            let mut registry = store.load();
            registry.spawned_processes[0].spawned_at = Utc::now() - chrono::Duration::hours(2);
            store.save(&registry).unwrap();
        }

        let report = store.sweep(true, true).unwrap();
        assert_eq!(report.warned.len(), 1);
        assert!(report.killed.is_empty());
        // Still alive and still registered.
        assert_eq!(store.status().process_count, 1);

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_sweep_kills_verified_orphan() {
        let dir = TempDir::new().unwrap();
        let store = registry_in(&dir);

        let mut child = std::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        let pid = child.id();
        store
            .register(pid, ProcessKind::Other("sleep".to_string()), "orphan")
            .unwrap();

        {
            let _lock = StateLock::acquire(&dir.path().join(".qralph/process-registry.lock")).unwrap();
            let mut registry = store.load();
            registry.spawned_processes[0].spawned_at = Utc::now() - chrono::Duration::hours(2);
            store.save(&registry).unwrap();
        }

        // Reap the child as soon as it dies so the post-kill aliveness
        // probe does not see a zombie.
        let reaper = std::thread::spawn(move || {
            let _ = child.wait();
        });

        let report = store.sweep(false, true).unwrap();
        assert_eq!(report.killed.len(), 1);
        assert_eq!(report.orphan_count, 1);

        reaper.join().unwrap();
        assert_eq!(store.status().process_count, 0);
    }

    #[test]
    fn test_cleanup_requires_matching_project() {
        let dir = TempDir::new().unwrap();
        let store = registry_in(&dir);
        store.set_project("001-real").unwrap();

        let result = store.cleanup("002-other");
        assert!(matches!(result, Err(RegistryError::ProjectMismatch { .. })));
    }

    #[test]
    fn test_cleanup_clears_registry() {
        let dir = TempDir::new().unwrap();
        let store = registry_in(&dir);
        store.set_project("001-real").unwrap();

        let report = store.cleanup("001-real").unwrap();
        assert_eq!(report.status, "cleaned");
        assert_eq!(report.killed_count, 0);
    }
}
