//! The CONTROL.md protocol.
//!
//! Users (and the orphan circuit breaker) steer a run by writing a single
//! command word into the project's `CONTROL.md`. Only lines containing
//! exactly one recognized command (case-insensitive, ignoring surrounding
//! whitespace) count; everything else is template text and is ignored. The
//! driver inspects the file on entry to every transition.

use std::path::Path;

/// Commands recognized in CONTROL.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Skip,
    Abort,
    Status,
    Escalate,
}

impl ControlCommand {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().to_uppercase().as_str() {
            "PAUSE" => Some(Self::Pause),
            "SKIP" => Some(Self::Skip),
            "ABORT" => Some(Self::Abort),
            "STATUS" => Some(Self::Status),
            "ESCALATE" => Some(Self::Escalate),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pause => write!(f, "PAUSE"),
            Self::Skip => write!(f, "SKIP"),
            Self::Abort => write!(f, "ABORT"),
            Self::Status => write!(f, "STATUS"),
            Self::Escalate => write!(f, "ESCALATE"),
        }
    }
}

/// Read the project's CONTROL.md and return the first recognized command.
pub fn read_control(project_path: &Path) -> Option<ControlCommand> {
    let control_file = project_path.join("CONTROL.md");
    let content = std::fs::read_to_string(control_file).ok()?;
    content.lines().find_map(ControlCommand::parse)
}
