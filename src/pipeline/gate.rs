//! The project quality gate.
//!
//! Detection happens at planning time by probing the target directory for
//! build files; execution happens once per run, after the last execution
//! group and before the verifier is spawned. The gate command runs through
//! the OS shell in the manifest's target directory with a hard 120-second
//! timeout, and only the last 2,000 bytes of combined output are kept.

use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Wall-clock limit for the gate subprocess.
pub const GATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Bytes of combined stdout+stderr retained on failure.
pub const GATE_OUTPUT_TAIL: usize = 2000;

/// Outcome of one gate run.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Empty command: nothing to run.
    Skipped,
    Passed,
    Failed { exit_code: i32, output_tail: String },
    TimedOut,
    LaunchError { message: String },
}

/// Detect the project's test infrastructure and return a gate command.
/// Probes in order: package.json scripts (composing typecheck/lint/test),
/// pytest markers, Cargo.toml, go.mod, a Makefile with a `test:` target.
/// Returns an empty string when nothing is recognized.
pub fn detect_quality_gate(dir: &Path) -> String {
    let pkg_json = dir.join("package.json");
    if pkg_json.exists()
        && let Ok(content) = std::fs::read_to_string(&pkg_json)
        && let Ok(pkg) = serde_json::from_str::<Value>(&content)
    {
        let scripts = pkg.get("scripts").and_then(Value::as_object);
        if let Some(scripts) = scripts {
            let mut parts = Vec::new();
            if scripts.contains_key("typecheck") {
                parts.push("npm run typecheck");
            }
            if scripts.contains_key("lint") {
                parts.push("npm run lint");
            }
            if scripts.contains_key("test") {
                parts.push("npm run test");
            }
            if !parts.is_empty() {
                return parts.join(" && ");
            }
        }
    }

    if dir.join("pytest.ini").exists() || dir.join("pyproject.toml").exists() {
        return "python3 -m pytest".to_string();
    }
    if dir.join("Cargo.toml").exists() {
        return "cargo test".to_string();
    }
    if dir.join("go.mod").exists() {
        return "go test ./...".to_string();
    }
    if dir.join("Makefile").exists()
        && let Ok(makefile) = std::fs::read_to_string(dir.join("Makefile"))
        && makefile.lines().any(|l| l.starts_with("test:"))
    {
        return "make test".to_string();
    }

    String::new()
}

/// Run the gate command in `working_dir` through the shell.
pub async fn run_quality_gate(cmd: &str, working_dir: &Path) -> GateOutcome {
    if cmd.trim().is_empty() {
        return GateOutcome::Skipped;
    }

    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.args(["/C", cmd]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", cmd]);
        c
    };
    command
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return GateOutcome::LaunchError {
                message: e.to_string(),
            };
        }
    };

    let output = match tokio::time::timeout(GATE_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return GateOutcome::LaunchError {
                message: e.to_string(),
            };
        }
        // kill_on_drop terminates the child when the future is dropped.
        Err(_) => return GateOutcome::TimedOut,
    };

    if output.status.success() {
        return GateOutcome::Passed;
    }

    let mut combined = Vec::with_capacity(output.stdout.len() + output.stderr.len());
    combined.extend_from_slice(&output.stdout);
    combined.extend_from_slice(&output.stderr);
    let tail_start = combined.len().saturating_sub(GATE_OUTPUT_TAIL);
    let output_tail = String::from_utf8_lossy(&combined[tail_start..]).into_owned();

    GateOutcome::Failed {
        exit_code: output.status.code().unwrap_or(-1),
        output_tail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // =========================================
    // Detection probes
    // =========================================

    #[test]
    fn test_detect_npm_scripts_composed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"typecheck": "tsc", "lint": "eslint .", "test": "vitest run"}}"#,
        )
        .unwrap();
        assert_eq!(
            detect_quality_gate(dir.path()),
            "npm run typecheck && npm run lint && npm run test"
        );
    }

    #[test]
    fn test_detect_partial_npm_scripts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"test": "jest"}}"#,
        )
        .unwrap();
        assert_eq!(detect_quality_gate(dir.path()), "npm run test");
    }

    #[test]
    fn test_detect_pytest() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "[tool.pytest]").unwrap();
        assert_eq!(detect_quality_gate(dir.path()), "python3 -m pytest");
    }

    #[test]
    fn test_detect_cargo() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        assert_eq!(detect_quality_gate(dir.path()), "cargo test");
    }

    #[test]
    fn test_detect_go() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module example").unwrap();
        assert_eq!(detect_quality_gate(dir.path()), "go test ./...");
    }

    #[test]
    fn test_detect_makefile_with_test_target() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Makefile"), "build:\n\tcc\ntest:\n\t./run\n").unwrap();
        assert_eq!(detect_quality_gate(dir.path()), "make test");
    }

    #[test]
    fn test_detect_makefile_without_test_target() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Makefile"), "build:\n\tcc\n").unwrap();
        assert_eq!(detect_quality_gate(dir.path()), "");
    }

    #[test]
    fn test_detect_nothing() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect_quality_gate(dir.path()), "");
    }

    #[test]
    fn test_detect_corrupt_package_json_falls_through() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{broken").unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        assert_eq!(detect_quality_gate(dir.path()), "cargo test");
    }

    // =========================================
    // Gate execution
    // =========================================

    #[tokio::test]
    async fn test_empty_command_is_skipped() {
        let dir = TempDir::new().unwrap();
        assert_eq!(run_quality_gate("", dir.path()).await, GateOutcome::Skipped);
        assert_eq!(run_quality_gate("  ", dir.path()).await, GateOutcome::Skipped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_zero_exit_passes() {
        let dir = TempDir::new().unwrap();
        assert_eq!(run_quality_gate("true", dir.path()).await, GateOutcome::Passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_fails_with_tail() {
        let dir = TempDir::new().unwrap();
        let outcome = run_quality_gate("echo boom && exit 3", dir.path()).await;
        match outcome {
            GateOutcome::Failed {
                exit_code,
                output_tail,
            } => {
                assert_eq!(exit_code, 3);
                assert!(output_tail.contains("boom"));
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_tail_is_bounded() {
        let dir = TempDir::new().unwrap();
        let outcome = run_quality_gate("yes x | head -c 10000; exit 1", dir.path()).await;
        match outcome {
            GateOutcome::Failed { output_tail, .. } => {
                assert!(output_tail.len() <= GATE_OUTPUT_TAIL);
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let outcome = run_quality_gate("test -f marker.txt", dir.path()).await;
        assert_eq!(outcome, GateOutcome::Passed);
    }
}
