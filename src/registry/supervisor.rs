//! Process kinds and the platform supervisor.
//!
//! The supervisor hides platform divergence: on Unix it probes aliveness
//! with `kill(pid, 0)` and inspects commands and parent pids through `ps`;
//! on Windows command introspection is unreliable, so identity verification
//! always fails and every kill is refused.

use serde::{Deserialize, Serialize};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::warn;

/// Kind of a registered child process. Each kind carries its own grace
/// period and the command tokens its process must still match at kill time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProcessKind {
    Node,
    Vitest,
    Claude,
    TeamAgent,
    Other(String),
}

impl ProcessKind {
    /// Seconds a process of this kind may live before the sweep considers
    /// it overdue.
    pub fn grace_period(&self) -> Duration {
        let secs = match self {
            ProcessKind::Node | ProcessKind::Vitest | ProcessKind::TeamAgent => 1800,
            ProcessKind::Claude => 3600,
            ProcessKind::Other(_) => 900,
        };
        Duration::from_secs(secs)
    }

    /// Command-name tokens that identify this kind. A live process whose
    /// command matches none of them is assumed to be a reused PID.
    pub fn command_tokens(&self) -> Vec<&str> {
        match self {
            ProcessKind::Node => vec!["node", "npm"],
            ProcessKind::Vitest => vec!["vitest", "node"],
            ProcessKind::Claude => vec!["claude", "node"],
            ProcessKind::TeamAgent => vec!["team-agent", "node"],
            ProcessKind::Other(name) => vec![name.as_str()],
        }
    }
}

impl From<String> for ProcessKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "node" => ProcessKind::Node,
            "vitest" => ProcessKind::Vitest,
            "claude" => ProcessKind::Claude,
            "team-agent" => ProcessKind::TeamAgent,
            _ => ProcessKind::Other(s),
        }
    }
}

impl From<ProcessKind> for String {
    fn from(kind: ProcessKind) -> Self {
        kind.to_string()
    }
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessKind::Node => write!(f, "node"),
            ProcessKind::Vitest => write!(f, "vitest"),
            ProcessKind::Claude => write!(f, "claude"),
            ProcessKind::TeamAgent => write!(f, "team-agent"),
            ProcessKind::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Platform operations on live processes.
#[derive(Debug, Default)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self
    }

    /// Whether a process with this pid exists.
    #[cfg(unix)]
    pub fn is_alive(&self, pid: u32) -> bool {
        // kill(pid, 0) probes existence; EPERM still means "exists".
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    pub fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    /// The parent pid of `pid`, when it can be determined.
    pub fn parent_pid(&self, pid: u32) -> Option<u32> {
        if cfg!(windows) {
            return None;
        }
        let output = Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "ppid="])
            .output()
            .ok()?;
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }

    /// Verify the process's current command still matches the registered
    /// kind. Returns `false` on Windows and on any probe failure: an
    /// unverifiable process is never killed.
    pub fn verify_identity(&self, pid: u32, kind: &ProcessKind) -> bool {
        if cfg!(windows) {
            return false;
        }
        let output = match Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "comm="])
            .output()
        {
            Ok(out) => out,
            Err(e) => {
                warn!(pid, error = %e, "ps probe failed, refusing kill");
                return false;
            }
        };
        let comm = String::from_utf8_lossy(&output.stdout).trim().to_lowercase();
        kind.command_tokens().iter().any(|token| comm.contains(token))
    }

    /// SIGTERM, poll up to `timeout` for exit, then SIGKILL. Returns whether
    /// the process is gone afterwards.
    #[cfg(unix)]
    pub fn terminate_gracefully(&self, pid: u32, timeout: Duration) -> bool {
        let pid_t = pid as libc::pid_t;
        if unsafe { libc::kill(pid_t, libc::SIGTERM) } != 0 {
            // Already dead before SIGTERM.
            return true;
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_alive(pid) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        unsafe { libc::kill(pid_t, libc::SIGKILL) };
        !self.is_alive(pid)
    }

    #[cfg(not(unix))]
    pub fn terminate_gracefully(&self, _pid: u32, _timeout: Duration) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grace_periods_per_kind() {
        assert_eq!(ProcessKind::Node.grace_period(), Duration::from_secs(1800));
        assert_eq!(ProcessKind::Vitest.grace_period(), Duration::from_secs(1800));
        assert_eq!(ProcessKind::Claude.grace_period(), Duration::from_secs(3600));
        assert_eq!(ProcessKind::TeamAgent.grace_period(), Duration::from_secs(1800));
        assert_eq!(
            ProcessKind::Other("ffmpeg".to_string()).grace_period(),
            Duration::from_secs(900)
        );
    }

    #[test]
    fn test_kind_roundtrips_through_string() {
        for kind in [
            ProcessKind::Node,
            ProcessKind::Vitest,
            ProcessKind::Claude,
            ProcessKind::TeamAgent,
            ProcessKind::Other("ffmpeg".to_string()),
        ] {
            let s: String = kind.clone().into();
            assert_eq!(ProcessKind::from(s), kind);
        }
    }

    #[test]
    fn test_kind_serde_as_string() {
        let json = serde_json::to_string(&ProcessKind::TeamAgent).unwrap();
        assert_eq!(json, "\"team-agent\"");
        let back: ProcessKind = serde_json::from_str("\"vitest\"").unwrap();
        assert_eq!(back, ProcessKind::Vitest);
    }

    #[cfg(unix)]
    #[test]
    fn test_own_process_is_alive() {
        let supervisor = ProcessSupervisor::new();
        assert!(supervisor.is_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_parent_pid_of_self() {
        let supervisor = ProcessSupervisor::new();
        let ppid = supervisor.parent_pid(std::process::id());
        assert!(ppid.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_mismatch_refused() {
        let supervisor = ProcessSupervisor::new();
        // The test binary is not a node process.
        assert!(!supervisor.verify_identity(std::process::id(), &ProcessKind::Node));
    }
}
