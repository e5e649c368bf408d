//! Atomic file helpers used throughout the engine.
//!
//! Writes go to a temp file in the target's own directory, are flushed and
//! fsynced under an exclusive advisory lock, then renamed over the target.
//! A crash mid-write can therefore never leave a partial file behind. Reads
//! take a shared advisory lock and degrade to a default value on any
//! failure; read errors never propagate to callers.

use crate::errors::StoreError;
use fs2::FileExt;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::warn;

/// Atomically write `content` to `path`.
///
/// Refuses to operate when the parent directory is a symlink, and unlinks
/// the target first when the target itself is one, so the rename never
/// follows a link out of the owned tree.
pub fn safe_write(path: &Path, content: &str) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    if let Ok(meta) = fs::symlink_metadata(parent)
        && meta.file_type().is_symlink()
    {
        return Err(StoreError::ParentSymlink {
            path: parent.to_path_buf(),
        });
    }

    fs::create_dir_all(parent).map_err(|source| StoreError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = NamedTempFile::new_in(parent).map_err(|source| StoreError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })?;

    // Temp file is dropped (and unlinked) automatically on any error path.
    let write_result: std::io::Result<()> = (|| {
        let file = tmp.as_file();
        file.lock_exclusive()?;
        let mut writer = file;
        let result = writer
            .write_all(content.as_bytes())
            .and_then(|_| writer.flush())
            .and_then(|_| file.sync_all());
        let _ = fs2::FileExt::unlock(file);
        result
    })();
    write_result.map_err(|source| StoreError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })?;

    if let Ok(meta) = fs::symlink_metadata(path)
        && meta.file_type().is_symlink()
    {
        fs::remove_file(path).map_err(|source| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
    }

    tmp.persist(path)
        .map_err(|e| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source: e.error,
        })?;

    Ok(())
}

/// Atomically write `data` as pretty-printed JSON, verifying first that the
/// serialisation round-trips to an identical value.
pub fn safe_write_json<T: Serialize>(path: &Path, data: &T) -> Result<(), StoreError> {
    let original = serde_json::to_value(data).map_err(StoreError::Encode)?;
    let content = serde_json::to_string_pretty(&original).map_err(StoreError::Encode)?;

    let reparsed: Value = serde_json::from_str(&content).map_err(|_| StoreError::RoundTrip {
        path: path.to_path_buf(),
    })?;
    if reparsed != original {
        return Err(StoreError::RoundTrip {
            path: path.to_path_buf(),
        });
    }

    safe_write(path, &content)
}

/// Read and parse a JSON file under a shared lock. Missing, unreadable, or
/// unparseable files yield `default` and a warning; never an error.
pub fn safe_read_json(path: &Path, default: Value) -> Value {
    match read_locked(path) {
        Some(content) if !content.is_empty() => match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid JSON, using default");
                default
            }
        },
        _ => default,
    }
}

/// Read a file's contents under a shared advisory lock. Returns `None` when
/// the file is missing or unreadable.
pub fn read_locked(path: &Path) -> Option<String> {
    if !path.exists() {
        return None;
    }
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open file");
            return None;
        }
    };
    if let Err(e) = file.lock_shared() {
        warn!(path = %path.display(), error = %e, "failed to take shared lock");
        return None;
    }
    let mut content = String::new();
    let result = file.read_to_string(&mut content);
    let _ = fs2::FileExt::unlock(&file);
    match result {
        Ok(_) => Some(content),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_safe_write_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");
        safe_write(&path, "hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn test_safe_write_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");
        safe_write(&path, "one").unwrap();
        safe_write(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
    }

    #[test]
    fn test_safe_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/out.txt");
        safe_write(&path, "nested").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "nested");
    }

    #[test]
    fn test_safe_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");
        safe_write(&path, "content").unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_safe_write_refuses_symlink_parent() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let result = safe_write(&link.join("out.txt"), "x");
        assert!(matches!(result, Err(StoreError::ParentSymlink { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_safe_write_replaces_symlink_target() {
        let dir = TempDir::new().unwrap();
        let victim = dir.path().join("victim.txt");
        fs::write(&victim, "untouched").unwrap();
        let link = dir.path().join("state.json");
        std::os::unix::fs::symlink(&victim, &link).unwrap();

        safe_write(&link, "new content").unwrap();

        // The symlink was unlinked and replaced by a regular file; the
        // victim the link pointed at was never written through.
        assert!(!fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&victim).unwrap(), "untouched");
        assert_eq!(fs::read_to_string(&link).unwrap(), "new content");
    }

    #[test]
    fn test_safe_write_json_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");
        safe_write_json(&path, &json!({"key": "value", "n": 3})).unwrap();
        let back = safe_read_json(&path, json!(null));
        assert_eq!(back, json!({"key": "value", "n": 3}));
    }

    #[test]
    fn test_safe_read_json_missing_returns_default() {
        let dir = TempDir::new().unwrap();
        let value = safe_read_json(&dir.path().join("nope.json"), json!({"d": 1}));
        assert_eq!(value, json!({"d": 1}));
    }

    #[test]
    fn test_safe_read_json_corrupt_returns_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        let value = safe_read_json(&path, json!([]));
        assert_eq!(value, json!([]));
    }

    #[test]
    fn test_read_locked_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_locked(&dir.path().join("absent")).is_none());
    }
}
