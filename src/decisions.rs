//! Append-only audit logs.
//!
//! One line per event, `[<iso-timestamp>] <message>`, written under an
//! exclusive advisory lock on the open descriptor. Control characters are
//! scrubbed and symlinked targets are refused. Logging failures are warned
//! about, never propagated: an audit line must not abort a transition.

use chrono::Utc;
use fs2::FileExt;
use regex::Regex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

static CONTROL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x1f\x7f]").expect("valid regex"));

/// Append a timestamped, scrubbed line to `path`.
pub fn append_line(path: &Path, message: &str) {
    let scrubbed = CONTROL_CHARS.replace_all(message, " ");
    let entry = format!("[{}] {}\n", Utc::now().to_rfc3339(), scrubbed);

    if let Some(parent) = path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!(path = %path.display(), error = %e, "failed to create log directory");
        return;
    }

    if let Ok(meta) = std::fs::symlink_metadata(path)
        && meta.file_type().is_symlink()
    {
        warn!(path = %path.display(), "refusing to append to symlink");
        return;
    }

    let file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open log");
            return;
        }
    };

    if let Err(e) = file.lock_exclusive() {
        warn!(path = %path.display(), error = %e, "failed to lock log");
        return;
    }
    let result = (|| {
        let mut f = &file;
        f.write_all(entry.as_bytes())?;
        f.flush()
    })();
    let _ = fs2::FileExt::unlock(&file);

    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to append log line");
    }
}

/// Append one line to the project's `decisions.log`.
pub fn log_decision(project_path: &Path, message: &str) {
    append_line(&project_path.join("decisions.log"), message);
}
