//! Project creation: id allocation, slugs, and the directory scaffold.

use crate::decisions::log_decision;
use crate::paths::QralphPaths;
use crate::store::{CircuitBreakers, Phase, PipelineState, State};
use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static ID_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)-").expect("valid regex"));
static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9\s-]").expect("valid regex"));
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Next sequential zero-padded project number under `projects_dir`.
pub fn next_project_number(projects_dir: &Path) -> String {
    let mut max_num: u32 = 0;
    if let Ok(entries) = std::fs::read_dir(projects_dir) {
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(caps) = ID_PREFIX.captures(&name.to_string_lossy())
                && let Ok(num) = caps[1].parse::<u32>()
            {
                max_num = max_num.max(num);
            }
        }
    }
    format!("{:03}", max_num + 1)
}

/// Directory-safe slug from the request text, capped at 50 chars.
pub fn slugify(text: &str) -> String {
    let lower = text.to_lowercase();
    let cleaned = NON_SLUG.replace_all(&lower, "");
    let slug = SPACES.replace_all(cleaned.trim(), "-");
    slug.chars().take(50).collect()
}

/// Create a new project directory tree and its initial state.
///
/// `target_dir` is where execution agents may write real files; relative
/// paths resolve against the working directory, and it defaults to the
/// working directory itself.
pub fn init_project(
    paths: &QralphPaths,
    request: &str,
    target_dir: Option<&Path>,
) -> Result<State> {
    let projects_dir = paths.projects_dir();
    std::fs::create_dir_all(&projects_dir).context("Failed to create projects directory")?;

    let number = next_project_number(&projects_dir);
    let slug = slugify(request);
    let project_id = if slug.is_empty() {
        number.clone()
    } else {
        format!("{number}-{slug}")
    };
    let project_path = projects_dir.join(&project_id);

    let target_directory: PathBuf = match target_dir {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => paths.working_dir().join(dir),
        None => paths.working_dir().to_path_buf(),
    };
    std::fs::create_dir_all(&target_directory).context("Failed to create target directory")?;

    for sub in ["agent-outputs", "execution-outputs", "verification", "checkpoints"] {
        std::fs::create_dir_all(project_path.join(sub))
            .with_context(|| format!("Failed to create {sub}/"))?;
    }

    let state = State {
        project_id,
        project_path: project_path.clone(),
        target_directory,
        request: request.to_string(),
        phase: Phase::Plan,
        template: String::new(),
        pipeline: PipelineState::default(),
        circuit_breakers: CircuitBreakers::default(),
        heal_attempts: 0,
        created_at: Utc::now(),
        completed_at: None,
        checksum: None,
    };

    log_decision(&project_path, &format!("INIT: Project created — {request}"));

    Ok(state)
}
