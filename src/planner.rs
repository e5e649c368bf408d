//! Task dependency planner.
//!
//! Computes parallel execution groups from per-task file-access sets plus
//! explicit dependencies. Two tasks that touch the same file are ordered by
//! their position in the manifest (earlier blocks later); independent tasks
//! share a group. Groups are then capped at [`MAX_PARALLEL_AGENTS`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Maximum agents spawned in any one group.
pub const MAX_PARALLEL_AGENTS: usize = 4;

fn default_tests_needed() -> bool {
    true
}

/// One unit of implementation work from the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default = "default_tests_needed")]
    pub tests_needed: bool,
}

/// The planner's output, written to `manifest.json` during PLAN_REVIEW.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub project_id: String,
    pub request: String,
    pub template: String,
    pub target_directory: PathBuf,
    /// Plan agents whose analyses fed this manifest.
    #[serde(default)]
    pub agent_analyses: Vec<String>,
    /// Plan agents that never produced output (skipped).
    #[serde(default)]
    pub missing_agents: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub parallel_groups: Vec<Vec<String>>,
    #[serde(default)]
    pub quality_gate_cmd: String,
    pub created_at: DateTime<Utc>,
}

/// Compute parallel execution groups.
///
/// Dependency edges come from each task's `depends_on` plus an implicit edge
/// for every ordered pair (earlier, later) sharing a file. Each round emits
/// the sorted set of tasks whose predecessors are all placed; when nothing
/// is ready (a cycle), the lexicographically smallest remaining task is
/// emitted alone to break it.
pub fn compute_parallel_groups(tasks: &[Task]) -> Vec<Vec<String>> {
    if tasks.is_empty() {
        return Vec::new();
    }

    let task_files: BTreeMap<&str, BTreeSet<&str>> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.files.iter().map(String::as_str).collect()))
        .collect();

    let mut depends_on: BTreeMap<&str, BTreeSet<&str>> = tasks
        .iter()
        .map(|t| {
            (
                t.id.as_str(),
                t.depends_on.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    // File-overlap edges: an earlier task blocks every later task it shares
    // a file with.
    for (i, earlier) in tasks.iter().enumerate() {
        for later in &tasks[i + 1..] {
            let shared = task_files[earlier.id.as_str()]
                .intersection(&task_files[later.id.as_str()])
                .next()
                .is_some();
            if shared {
                depends_on
                    .get_mut(later.id.as_str())
                    .expect("task present")
                    .insert(earlier.id.as_str());
            }
        }
    }

    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut remaining: BTreeSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();

    while !remaining.is_empty() {
        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|tid| depends_on[**tid].iter().all(|dep| placed.contains(dep)))
            .copied()
            .collect();

        if ready.is_empty() {
            // Cycle: place the smallest remaining id alone and continue.
            ready = vec![remaining.iter().next().copied().expect("non-empty")];
        }
        // BTreeSet iteration already yields sorted order.

        for tid in &ready {
            placed.insert(*tid);
            remaining.remove(*tid);
        }
        groups.push(ready.into_iter().map(String::from).collect());
    }

    groups
}

/// Split any group larger than `cap` into consecutive chunks, preserving
/// relative order. Chunks never merge across group boundaries, so every
/// dependency edge still crosses a group boundary in the right direction.
pub fn cap_group_sizes(groups: Vec<Vec<String>>, cap: usize) -> Vec<Vec<String>> {
    let mut capped = Vec::new();
    for group in groups {
        for chunk in group.chunks(cap.max(1)) {
            capped.push(chunk.to_vec());
        }
    }
    capped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, files: &[&str], deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            summary: format!("Task {id}"),
            description: String::new(),
            files: files.iter().map(|s| s.to_string()).collect(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            acceptance_criteria: vec![],
            tests_needed: true,
        }
    }

    #[test]
    fn test_empty_tasks() {
        assert!(compute_parallel_groups(&[]).is_empty());
    }

    #[test]
    fn test_single_task() {
        let groups = compute_parallel_groups(&[task("T1", &[], &[])]);
        assert_eq!(groups, vec![vec!["T1"]]);
    }

    #[test]
    fn test_no_overlap_grouped_together() {
        let tasks = vec![
            task("T1", &["a.ts"], &[]),
            task("T2", &["b.ts"], &[]),
            task("T3", &["c.ts"], &[]),
        ];
        let groups = compute_parallel_groups(&tasks);
        assert_eq!(groups, vec![vec!["T1", "T2", "T3"]]);
    }

    #[test]
    fn test_overlap_is_sequential() {
        let tasks = vec![task("T1", &["shared.ts"], &[]), task("T2", &["shared.ts"], &[])];
        let groups = compute_parallel_groups(&tasks);
        assert_eq!(groups, vec![vec!["T1"], vec!["T2"]]);
    }

    #[test]
    fn test_mixed_overlap() {
        // T4 shares files with both T1 and T2, so it waits for them.
        let tasks = vec![
            task("T1", &["a.ts"], &[]),
            task("T2", &["b.ts"], &[]),
            task("T3", &["c.ts"], &[]),
            task("T4", &["a.ts", "b.ts"], &[]),
        ];
        let groups = compute_parallel_groups(&tasks);
        assert_eq!(groups, vec![vec!["T1", "T2", "T3"], vec!["T4"]]);
    }

    #[test]
    fn test_explicit_depends_on() {
        let tasks = vec![task("T1", &[], &[]), task("T2", &[], &["T1"])];
        let groups = compute_parallel_groups(&tasks);
        assert_eq!(groups, vec![vec!["T1"], vec!["T2"]]);
    }

    #[test]
    fn test_chain_dependency() {
        let tasks = vec![
            task("T1", &[], &[]),
            task("T2", &[], &["T1"]),
            task("T3", &[], &["T2"]),
        ];
        let groups = compute_parallel_groups(&tasks);
        assert_eq!(groups, vec![vec!["T1"], vec!["T2"], vec!["T3"]]);
    }

    #[test]
    fn test_cycle_broken_by_smallest_id() {
        // A and B depend on each other; A is placed alone first.
        let tasks = vec![task("A", &[], &["B"]), task("B", &[], &["A"])];
        let groups = compute_parallel_groups(&tasks);
        assert_eq!(groups, vec![vec!["A"], vec!["B"]]);
    }

    #[test]
    fn test_groups_respect_all_edges() {
        let tasks = vec![
            task("T1", &["x.ts"], &[]),
            task("T2", &["y.ts"], &["T1"]),
            task("T3", &["x.ts"], &[]),
            task("T4", &["z.ts"], &[]),
        ];
        let groups = compute_parallel_groups(&tasks);

        let index_of = |id: &str| {
            groups
                .iter()
                .position(|g| g.iter().any(|t| t == id))
                .unwrap()
        };
        // Explicit edge T1 -> T2 and file edge T1 -> T3.
        assert!(index_of("T1") < index_of("T2"));
        assert!(index_of("T1") < index_of("T3"));
        // T4 is free.
        assert_eq!(index_of("T4"), 0);
    }

    #[test]
    fn test_idempotent() {
        let tasks = vec![
            task("T1", &["a.ts"], &[]),
            task("T2", &["a.ts"], &[]),
            task("T3", &["b.ts"], &["T1"]),
        ];
        let first = compute_parallel_groups(&tasks);
        let second = compute_parallel_groups(&tasks);
        assert_eq!(first, second);
    }

    #[test]
    fn test_every_task_appears_exactly_once() {
        let tasks: Vec<Task> = (0..7)
            .map(|i| task(&format!("T{i}"), &[], &[]))
            .collect();
        let groups = compute_parallel_groups(&tasks);
        let mut seen: Vec<&String> = groups.iter().flatten().collect();
        seen.sort();
        assert_eq!(seen.len(), 7);
        seen.dedup();
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn test_cap_splits_large_group() {
        let groups = vec![(1..=10).map(|i| format!("T{i:02}")).collect::<Vec<_>>()];
        let capped = cap_group_sizes(groups, MAX_PARALLEL_AGENTS);
        assert_eq!(capped.len(), 3);
        assert_eq!(capped[0].len(), 4);
        assert_eq!(capped[1].len(), 4);
        assert_eq!(capped[2].len(), 2);
        assert_eq!(capped[0][0], "T01");
        assert_eq!(capped[2][1], "T10");
    }

    #[test]
    fn test_cap_preserves_small_groups() {
        let groups = vec![vec!["A".to_string()], vec!["B".to_string(), "C".to_string()]];
        let capped = cap_group_sizes(groups.clone(), MAX_PARALLEL_AGENTS);
        assert_eq!(capped, groups);
    }

    #[test]
    fn test_cap_never_merges_across_groups() {
        let groups = vec![
            (1..=5).map(|i| format!("A{i}")).collect::<Vec<_>>(),
            vec!["B1".to_string()],
        ];
        let capped = cap_group_sizes(groups, MAX_PARALLEL_AGENTS);
        // A5 spills into its own chunk rather than joining B1's group.
        assert_eq!(capped, vec![
            vec!["A1", "A2", "A3", "A4"],
            vec!["A5"],
            vec!["B1"],
        ]);
    }

    #[test]
    fn test_manifest_roundtrips() {
        let manifest = Manifest {
            project_id: "001-x".to_string(),
            request: "r".to_string(),
            template: "research".to_string(),
            target_directory: PathBuf::from("/w"),
            agent_analyses: vec!["researcher".to_string()],
            missing_agents: vec![],
            tasks: vec![task("T1", &["a"], &[])],
            parallel_groups: vec![vec!["T1".to_string()]],
            quality_gate_cmd: "cargo test".to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_task_tests_needed_defaults_true() {
        let task: Task = serde_json::from_str(r#"{"id": "T1"}"#).unwrap();
        assert!(task.tests_needed);
    }
}
