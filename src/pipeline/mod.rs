//! The pipeline state machine.
//!
//! A project advances PLAN → EXECUTE → VERIFY → COMPLETE, driven by a single
//! `next` operation that inspects on-disk artifacts and performs at most one
//! transition per invocation. Every transition happens under the exclusive
//! state lock, in a fixed order: load, validate, inspect artifacts, mutate,
//! write state atomically, write checkpoint, append the decisions line,
//! release, emit one action.

pub mod gate;

use crate::breakers;
use crate::config::QralphConfig;
use crate::control::{self, ControlCommand};
use crate::decisions::log_decision;
use crate::errors::PipelineError;
use crate::paths::QralphPaths;
use crate::planner::{self, MAX_PARALLEL_AGENTS, Manifest, Task};
use crate::project;
use crate::prompts;
use crate::store::atomic::{safe_read_json, safe_write, safe_write_json};
use crate::store::{
    AgentConfig, ExecutionGroup, ModelTier, Phase, State, StateLock, Store, SubPhase,
};
use crate::templates::{self, TASK_TEMPLATES};
use chrono::Utc;
use gate::{GateOutcome, run_quality_gate};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Agent identity without its prompt, for confirmation displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub model: ModelTier,
}

impl From<&AgentConfig> for AgentSummary {
    fn from(agent: &AgentConfig) -> Self {
        Self {
            name: agent.name.clone(),
            model: agent.model,
        }
    }
}

/// Task identity for plan confirmation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub summary: String,
}

/// The single structured value returned by `next`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    ConfirmTemplate {
        template: String,
        template_description: String,
        agents: Vec<AgentSummary>,
        project_path: PathBuf,
    },
    SpawnAgents {
        agents: Vec<AgentConfig>,
        output_dir: PathBuf,
    },
    DefineTasks {
        analyses_summary: String,
        manifest_path: PathBuf,
        plan_path: PathBuf,
    },
    ConfirmPlan {
        plan_path: PathBuf,
        manifest_path: PathBuf,
        tasks: Vec<TaskSummary>,
    },
    Complete {
        summary_path: PathBuf,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_dir: Option<PathBuf>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        expected: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        verification_path: Option<PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        quality_gate_cmd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        quality_gate_output: Option<String>,
    },
}

impl Action {
    pub fn error(message: impl Into<String>) -> Self {
        Action::Error {
            message: message.into(),
            output_dir: None,
            expected: Vec::new(),
            verification_path: None,
            quality_gate_cmd: None,
            quality_gate_output: None,
        }
    }

    fn missing_outputs(message: String, output_dir: PathBuf, expected: Vec<String>) -> Self {
        Action::Error {
            message,
            output_dir: Some(output_dir),
            expected,
            verification_path: None,
            quality_gate_cmd: None,
            quality_gate_output: None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Action::Error { .. })
    }
}

// ─── Command reports ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub status: String,
    pub project_id: String,
    pub project_path: PathBuf,
    pub suggested_template: String,
    pub template_description: String,
    pub all_templates: BTreeMap<String, String>,
    pub scores: BTreeMap<String, u32>,
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub status: String,
    pub suggested_template: String,
    pub template_description: String,
    pub scores: BTreeMap<String, u32>,
    pub agents: Vec<AgentSummary>,
    pub quality_gate: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectReport {
    pub status: String,
    pub project_id: String,
    pub manifest_path: PathBuf,
    pub plan_path: PathBuf,
    pub agents_reported: Vec<String>,
    pub agents_missing: Vec<String>,
    pub quality_gate_cmd: String,
    pub analyses_summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanFinalizeReport {
    pub status: String,
    pub project_id: String,
    pub tasks: usize,
    pub groups: Vec<Vec<String>>,
    pub plan_path: PathBuf,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteReport {
    pub status: String,
    pub project_id: String,
    pub groups: Vec<ExecutionGroup>,
    pub quality_gate_cmd: String,
    pub total_tasks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteCollectReport {
    pub status: String,
    pub completed_tasks: Vec<String>,
    pub missing_tasks: Vec<String>,
    pub total_tasks: usize,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub status: String,
    pub project_id: String,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReport {
    pub status: String,
    pub project_id: String,
    pub summary_path: PathBuf,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeReport {
    pub status: String,
    pub project_id: String,
    pub request: String,
    pub phase: Phase,
    pub next_action: String,
    pub has_manifest: bool,
    pub has_plan: bool,
    pub agent_outputs_count: usize,
    pub execution_outputs_count: usize,
    pub template: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<PathBuf>,
}

// ─── The pipeline ───────────────────────────────────────────────────────────

/// The pipeline driver: owns the store handle and configuration for one
/// working directory.
#[derive(Debug)]
pub struct Pipeline {
    paths: QralphPaths,
    store: Store,
    config: QralphConfig,
}

/// True when the file exists and is non-empty after whitespace trim.
fn non_empty(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .map(|content| !content.trim().is_empty())
        .unwrap_or(false)
}

fn count_md(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "md"))
                .count()
        })
        .unwrap_or(0)
}

impl Pipeline {
    pub fn new(paths: QralphPaths, config: QralphConfig) -> Self {
        let store = Store::new(&paths);
        Self {
            paths,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn manifest_path(&self, state: &State) -> PathBuf {
        state.project_path.join("manifest.json")
    }

    fn load_manifest(&self, state: &State) -> Option<Manifest> {
        let path = self.manifest_path(state);
        if !path.exists() {
            return None;
        }
        let raw = safe_read_json(&path, serde_json::Value::Null);
        serde_json::from_value(raw).ok()
    }

    fn persist(&self, lock: &StateLock, state: &mut State) -> Result<(), PipelineError> {
        self.store.save(lock, state)?;
        self.store.save_checkpoint(state)?;
        Ok(())
    }

    fn require_phase(
        &self,
        state: &State,
        command: &str,
        expected: Phase,
    ) -> Result<(), PipelineError> {
        if state.phase != expected {
            return Err(PipelineError::WrongPhase {
                command: command.to_string(),
                expected: expected.to_string(),
                actual: state.phase.to_string(),
            });
        }
        Ok(())
    }

    // ─── plan ───────────────────────────────────────────────────────────

    /// Create a project, suggest a template, and emit plan-agent configs.
    pub fn plan(
        &self,
        request: &str,
        target_dir: Option<&Path>,
    ) -> Result<PlanReport, PipelineError> {
        let request = prompts::sanitize_request(request)?;
        let mut state = project::init_project(&self.paths, request, target_dir)?;

        let (suggested, scores) = templates::suggest_template(request);
        let template = templates::get_template(suggested).expect("suggested template exists");

        let roles = templates::enforce_critical_agents(template.plan_agents);
        let project_path_str = state.project_path.display().to_string();
        let agents: Vec<AgentConfig> = roles
            .iter()
            .map(|role| {
                prompts::build_plan_agent_prompt(role, request, &project_path_str, &self.config)
            })
            .collect();

        state.template = suggested.to_string();
        state.pipeline.sub_phase = SubPhase::Init;
        state.pipeline.plan_agents = agents.clone();

        let lock = self.store.lock()?;
        self.persist(&lock, &mut state)?;
        drop(lock);

        log_decision(
            &state.project_path,
            &format!("PLAN: Template '{suggested}' suggested (scores: {scores:?})"),
        );

        Ok(PlanReport {
            status: "plan_ready".to_string(),
            project_id: state.project_id.clone(),
            project_path: state.project_path.clone(),
            suggested_template: suggested.to_string(),
            template_description: template.description.to_string(),
            all_templates: TASK_TEMPLATES
                .iter()
                .map(|t| (t.name.to_string(), t.description.to_string()))
                .collect(),
            scores,
            agents,
        })
    }

    /// Template suggestion without creating a project.
    pub fn plan_dry_run(&self, request: &str) -> Result<DryRunReport, PipelineError> {
        let request = prompts::sanitize_request(request)?;
        let (suggested, scores) = templates::suggest_template(request);
        let template = templates::get_template(suggested).expect("suggested template exists");

        let roles = templates::enforce_critical_agents(template.plan_agents);
        let agents: Vec<AgentSummary> = roles
            .iter()
            .map(|role| {
                let config =
                    prompts::build_plan_agent_prompt(role, request, "<project-path>", &self.config);
                AgentSummary::from(&config)
            })
            .collect();

        Ok(DryRunReport {
            status: "dry_run".to_string(),
            suggested_template: suggested.to_string(),
            template_description: template.description.to_string(),
            scores,
            agents,
            quality_gate: gate::detect_quality_gate(self.paths.working_dir()),
        })
    }

    // ─── plan-collect ───────────────────────────────────────────────────

    pub fn plan_collect(&self) -> Result<CollectReport, PipelineError> {
        let lock = self.store.lock()?;
        let mut state = self.store.load().ok_or(PipelineError::NoActiveProject)?;
        self.step_plan_collect(&lock, &mut state)
    }

    fn step_plan_collect(
        &self,
        _lock: &StateLock,
        state: &mut State,
    ) -> Result<CollectReport, PipelineError> {
        self.require_phase(state, "plan-collect", Phase::Plan)?;
        self.store.assert_contained(&state.project_path)?;

        let outputs_dir = state.project_path.join("agent-outputs");
        let mut analyses: Vec<(String, String)> = Vec::new();
        let mut missing = Vec::new();
        for agent in &state.pipeline.plan_agents {
            let output_file = outputs_dir.join(format!("{}.md", agent.name));
            match std::fs::read_to_string(&output_file) {
                Ok(content) if !content.trim().is_empty() => {
                    analyses.push((
                        agent.name.clone(),
                        prompts::sanitize_agent_output(content.trim()),
                    ));
                }
                _ => missing.push(agent.name.clone()),
            }
        }

        if analyses.is_empty() {
            return Err(PipelineError::NoAgentOutputs);
        }

        let quality_gate = gate::detect_quality_gate(self.paths.working_dir());

        let manifest = Manifest {
            project_id: state.project_id.clone(),
            request: state.request.clone(),
            template: state.template.clone(),
            target_directory: state.target_directory.clone(),
            agent_analyses: analyses.iter().map(|(name, _)| name.clone()).collect(),
            missing_agents: missing.clone(),
            // The caller fills in concrete tasks after reviewing the analyses.
            tasks: Vec::new(),
            parallel_groups: Vec::new(),
            quality_gate_cmd: quality_gate.clone(),
            created_at: Utc::now(),
        };

        let mut analyses_summary = String::from("## Agent Analyses\n\n");
        for (name, content) in &analyses {
            analyses_summary.push_str(&format!("### {name}\n\n{content}\n\n---\n\n"));
        }

        let manifest_path = self.manifest_path(state);
        safe_write_json(&manifest_path, &manifest)?;

        let mut plan_md = format!("# Execution Plan: {}\n\n", state.request);
        plan_md.push_str(&format!("**Template**: {}\n", state.template));
        plan_md.push_str(&format!(
            "**Agents**: {}\n",
            manifest.agent_analyses.join(", ")
        ));
        if !missing.is_empty() {
            plan_md.push_str(&format!("**Missing agents**: {} (skipped)\n", missing.join(", ")));
        }
        plan_md.push_str(&format!("\n{analyses_summary}"));
        if !quality_gate.is_empty() {
            plan_md.push_str(&format!("\n## Quality Gate\n\n```\n{quality_gate}\n```\n"));
        }
        plan_md.push_str(
            "\n## Next Steps\n\n\
             Review the agent analyses above. Then define execution tasks by updating \
             manifest.json with concrete tasks, files, and acceptance criteria.\n",
        );

        let plan_path = state.project_path.join("PLAN.md");
        safe_write(&plan_path, &plan_md)?;

        log_decision(
            &state.project_path,
            &format!(
                "PLAN-COLLECT: {} agents reported, {} missing",
                analyses.len(),
                missing.len()
            ),
        );
        self.store.save_checkpoint(state)?;

        Ok(CollectReport {
            status: "manifest_ready".to_string(),
            project_id: state.project_id.clone(),
            manifest_path,
            plan_path,
            agents_reported: manifest.agent_analyses,
            agents_missing: missing,
            quality_gate_cmd: quality_gate,
            analyses_summary,
        })
    }

    // ─── plan-finalize ──────────────────────────────────────────────────

    pub fn plan_finalize(&self) -> Result<PlanFinalizeReport, PipelineError> {
        let lock = self.store.lock()?;
        let mut state = self.store.load().ok_or(PipelineError::NoActiveProject)?;
        self.step_plan_finalize(&lock, &mut state)
    }

    fn step_plan_finalize(
        &self,
        lock: &StateLock,
        state: &mut State,
    ) -> Result<PlanFinalizeReport, PipelineError> {
        self.store.assert_contained(&state.project_path)?;
        let mut manifest = self.load_manifest(state).ok_or(PipelineError::MissingManifest)?;
        if manifest.tasks.is_empty() {
            return Err(PipelineError::NoTasks);
        }

        let groups = planner::compute_parallel_groups(&manifest.tasks);
        manifest.parallel_groups = groups.clone();
        safe_write_json(&self.manifest_path(state), &manifest)?;

        let plan_path = state.project_path.join("PLAN.md");
        safe_write(&plan_path, &render_plan_md(state, &manifest, &groups))?;

        state.phase = Phase::Execute;
        self.persist(lock, state)?;
        log_decision(
            &state.project_path,
            &format!(
                "PLAN-FINALIZE: {} tasks, {} groups, transitioning to EXECUTE",
                manifest.tasks.len(),
                groups.len()
            ),
        );

        Ok(PlanFinalizeReport {
            status: "plan_finalized".to_string(),
            project_id: state.project_id.clone(),
            tasks: manifest.tasks.len(),
            groups,
            plan_path,
            phase: Phase::Execute,
        })
    }

    // ─── execute ────────────────────────────────────────────────────────

    pub fn execute(&self) -> Result<ExecuteReport, PipelineError> {
        let _lock = self.store.lock()?;
        let state = self.store.load().ok_or(PipelineError::NoActiveProject)?;
        self.step_execute(&state)
    }

    fn step_execute(&self, state: &State) -> Result<ExecuteReport, PipelineError> {
        self.require_phase(state, "execute", Phase::Execute)?;
        self.store.assert_contained(&state.project_path)?;
        let manifest = self.load_manifest(state).ok_or(PipelineError::MissingManifest)?;
        if manifest.tasks.is_empty() {
            return Err(PipelineError::NoTasks);
        }

        let task_map: BTreeMap<&str, &Task> = manifest
            .tasks
            .iter()
            .map(|task| (task.id.as_str(), task))
            .collect();

        let capped = planner::cap_group_sizes(manifest.parallel_groups.clone(), MAX_PARALLEL_AGENTS);

        let mut groups = Vec::new();
        for group_ids in capped {
            let parallel = group_ids.len() > 1;
            let mut agents = Vec::new();
            for tid in &group_ids {
                let Some(task) = task_map.get(tid.as_str()).copied() else {
                    continue;
                };
                let mut agent = AgentConfig::new(
                    format!("impl-{tid}"),
                    ModelTier::Sonnet,
                    prompts::build_execution_prompt(task, &manifest),
                );
                agent.task_id = Some(tid.clone());
                agent.use_worktree = parallel;
                agents.push(agent);
            }
            groups.push(ExecutionGroup {
                task_ids: group_ids,
                agents,
                parallel,
            });
        }

        log_decision(
            &state.project_path,
            &format!("EXECUTE: {} groups prepared", groups.len()),
        );

        Ok(ExecuteReport {
            status: "execute_ready".to_string(),
            project_id: state.project_id.clone(),
            groups,
            quality_gate_cmd: manifest.quality_gate_cmd,
            total_tasks: manifest.tasks.len(),
        })
    }

    // ─── execute-collect ────────────────────────────────────────────────

    pub fn execute_collect(&self) -> Result<ExecuteCollectReport, PipelineError> {
        let lock = self.store.lock()?;
        let mut state = self.store.load().ok_or(PipelineError::NoActiveProject)?;
        self.require_phase(&state, "execute-collect", Phase::Execute)?;
        self.step_execute_collect(&lock, &mut state)
    }

    /// Check execution completeness and transition to VERIFY when every
    /// task has output. Tolerates re-entry after the transition (the
    /// quality gate may fail repeatedly in VERIFY while the sub-phase is
    /// still EXEC_WAITING).
    fn step_execute_collect(
        &self,
        lock: &StateLock,
        state: &mut State,
    ) -> Result<ExecuteCollectReport, PipelineError> {
        self.store.assert_contained(&state.project_path)?;
        let manifest = self.load_manifest(state).ok_or(PipelineError::MissingManifest)?;
        if manifest.tasks.is_empty() {
            return Err(PipelineError::NoTasks);
        }

        let outputs_dir = state.project_path.join("execution-outputs");
        let mut completed = Vec::new();
        let mut missing = Vec::new();
        for task in &manifest.tasks {
            if non_empty(&outputs_dir.join(format!("{}.md", task.id))) {
                completed.push(task.id.clone());
            } else {
                missing.push(task.id.clone());
            }
        }

        let all_done = missing.is_empty();
        if all_done {
            if state.phase == Phase::Execute {
                state.phase = Phase::Verify;
                self.persist(lock, state)?;
            }
            log_decision(
                &state.project_path,
                &format!(
                    "EXECUTE-COLLECT: All {} tasks complete, transitioning to VERIFY",
                    completed.len()
                ),
            );
        } else {
            log_decision(
                &state.project_path,
                &format!(
                    "EXECUTE-COLLECT: {}/{} tasks complete, {} missing",
                    completed.len(),
                    manifest.tasks.len(),
                    missing.len()
                ),
            );
            self.store.save_checkpoint(state)?;
        }

        Ok(ExecuteCollectReport {
            status: if all_done {
                "execute_complete".to_string()
            } else {
                "execute_incomplete".to_string()
            },
            completed_tasks: completed,
            missing_tasks: missing,
            total_tasks: manifest.tasks.len(),
            phase: state.phase,
        })
    }

    // ─── verify ─────────────────────────────────────────────────────────

    pub fn verify(&self) -> Result<VerifyReport, PipelineError> {
        let _lock = self.store.lock()?;
        let state = self.store.load().ok_or(PipelineError::NoActiveProject)?;
        self.step_verify(&state)
    }

    fn step_verify(&self, state: &State) -> Result<VerifyReport, PipelineError> {
        self.require_phase(state, "verify", Phase::Verify)?;
        self.store.assert_contained(&state.project_path)?;
        let manifest = self.load_manifest(state).ok_or(PipelineError::MissingManifest)?;

        let outputs_dir = state.project_path.join("execution-outputs");
        let mut execution_results = String::new();
        if let Ok(entries) = std::fs::read_dir(&outputs_dir) {
            let mut files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
                .collect();
            files.sort();
            for file in files {
                let stem = file
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if let Ok(content) = std::fs::read_to_string(&file) {
                    execution_results.push_str(&format!(
                        "### {stem}\n\n{}\n\n---\n\n",
                        prompts::sanitize_agent_output(content.trim())
                    ));
                }
            }
        }

        let prompt = prompts::build_verification_prompt(&manifest, &execution_results);

        log_decision(&state.project_path, "VERIFY: Verification agent prepared");

        Ok(VerifyReport {
            status: "verify_ready".to_string(),
            project_id: state.project_id.clone(),
            agent: AgentConfig::new("verifier", ModelTier::Sonnet, prompt),
        })
    }

    // ─── finalize ───────────────────────────────────────────────────────

    pub fn finalize(&self) -> Result<FinalizeReport, PipelineError> {
        let lock = self.store.lock()?;
        let mut state = self.store.load().ok_or(PipelineError::NoActiveProject)?;
        self.step_finalize(&lock, &mut state)
    }

    fn step_finalize(
        &self,
        lock: &StateLock,
        state: &mut State,
    ) -> Result<FinalizeReport, PipelineError> {
        self.require_phase(state, "finalize", Phase::Verify)?;
        self.store.assert_contained(&state.project_path)?;

        let verify_file = state.project_path.join("verification").join("result.md");
        if !non_empty(&verify_file) {
            return Err(PipelineError::NoVerificationResult);
        }
        let verification_content = std::fs::read_to_string(&verify_file)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        if verdict_is_fail(&verification_content) {
            return Err(PipelineError::VerificationFailed);
        }

        let manifest = self.load_manifest(state);

        let mut summary = format!("# Project Summary: {}\n\n", state.request);
        summary.push_str(&format!("**Project ID**: {}\n", state.project_id));
        summary.push_str(&format!("**Template**: {}\n", state.template));
        summary.push_str(&format!(
            "**Created**: {}\n",
            state.created_at.to_rfc3339()
        ));
        summary.push_str(&format!("**Completed**: {}\n\n", Utc::now().to_rfc3339()));

        if let Some(manifest) = &manifest {
            if !manifest.tasks.is_empty() {
                summary.push_str("## Tasks\n\n");
                for task in &manifest.tasks {
                    summary.push_str(&format!("- **{}**: {}\n", task.id, task.summary));
                }
                summary.push('\n');
            }
            if !manifest.agent_analyses.is_empty() {
                summary.push_str(&format!(
                    "## Agents Used\n\n{}\n\n",
                    manifest.agent_analyses.join(", ")
                ));
            }
        }

        summary.push_str(&format!("## Verification\n\n{verification_content}\n\n"));

        if let Some(manifest) = &manifest
            && !manifest.quality_gate_cmd.is_empty()
        {
            summary.push_str(&format!(
                "## Quality Gate\n\n```\n{}\n```\n",
                manifest.quality_gate_cmd
            ));
        }

        let summary_path = state.project_path.join("SUMMARY.md");
        safe_write(&summary_path, &summary)?;

        state.phase = Phase::Complete;
        state.completed_at = Some(Utc::now());
        self.persist(lock, state)?;
        log_decision(&state.project_path, "FINALIZE: Project marked COMPLETE");

        Ok(FinalizeReport {
            status: "complete".to_string(),
            project_id: state.project_id.clone(),
            summary_path,
            phase: Phase::Complete,
        })
    }

    // ─── resume / status ────────────────────────────────────────────────

    pub fn resume(&self) -> Result<ResumeReport, PipelineError> {
        let state = self.store.load().ok_or(PipelineError::NoActiveProject)?;

        let next_action = match state.phase {
            Phase::Plan => "Run plan-collect if agents have reported. Otherwise spawn plan agents.",
            Phase::Execute => "Run execute if tasks are ready. Check execution-outputs/ for progress.",
            Phase::Verify => "Run verify to generate verification agent. Check verification/result.md.",
            Phase::Complete => "Project is complete. Review SUMMARY.md.",
        };

        Ok(ResumeReport {
            status: "resumable".to_string(),
            project_id: state.project_id.clone(),
            request: state.request.clone(),
            phase: state.phase,
            next_action: next_action.to_string(),
            has_manifest: self.manifest_path(&state).exists(),
            has_plan: state.project_path.join("PLAN.md").exists(),
            agent_outputs_count: count_md(&state.project_path.join("agent-outputs")),
            execution_outputs_count: count_md(&state.project_path.join("execution-outputs")),
            template: state.template,
        })
    }

    pub fn status(&self) -> ProjectStatus {
        match self.store.load() {
            Some(state) => ProjectStatus {
                status: "active".to_string(),
                project_id: Some(state.project_id.clone()),
                request: Some(state.request.chars().take(200).collect()),
                phase: Some(state.phase),
                template: Some(state.template.clone()),
                agents: state
                    .pipeline
                    .plan_agents
                    .iter()
                    .map(|a| a.name.clone())
                    .collect(),
                project_path: Some(state.project_path),
            },
            None => ProjectStatus {
                status: "no_active_project".to_string(),
                project_id: None,
                request: None,
                phase: None,
                template: None,
                agents: Vec::new(),
                project_path: None,
            },
        }
    }

    // ─── next: the state machine driver ─────────────────────────────────

    /// Perform at most one transition and return the next action. Holds the
    /// exclusive state lock for the whole invocation. Only fatal environment
    /// errors surface as `Err`; every recoverable condition is an `error`
    /// action.
    pub async fn next(&self, confirm: bool) -> Result<Action, PipelineError> {
        let lock = self.store.lock()?;

        let Some(mut state) = self.store.load() else {
            return Ok(Action::error("No active project. Run 'plan' first."));
        };

        if let Err(e) = self.store.assert_contained(&state.project_path) {
            return Ok(Action::error(e.to_string()));
        }

        match control::read_control(&state.project_path) {
            Some(ControlCommand::Pause) => {
                return Ok(Action::error(
                    "Project is paused (PAUSE in CONTROL.md). Clear it to continue.",
                ));
            }
            Some(ControlCommand::Abort) => {
                return Ok(Action::error(
                    "Project is aborted (ABORT in CONTROL.md). Clear it to continue.",
                ));
            }
            _ => {}
        }

        if let Some(reason) = breakers::check(&state, &lock) {
            return Ok(Action::error(reason.to_string()));
        }

        match state.pipeline.sub_phase {
            SubPhase::Init => self.next_init(&lock, &mut state, confirm),
            SubPhase::PlanWaiting => self.next_plan_waiting(&lock, &mut state),
            SubPhase::PlanReview => self.next_plan_review(&lock, &mut state, confirm),
            SubPhase::ExecWaiting => self.next_exec_waiting(&lock, &mut state).await,
            SubPhase::VerifyWait => self.next_verify_wait(&lock, &mut state),
            SubPhase::Complete => Ok(Action::Complete {
                summary_path: state.project_path.join("SUMMARY.md"),
            }),
        }
    }

    fn next_init(
        &self,
        lock: &StateLock,
        state: &mut State,
        confirm: bool,
    ) -> Result<Action, PipelineError> {
        if !confirm {
            return Ok(Action::ConfirmTemplate {
                template: state.template.clone(),
                template_description: templates::get_template(&state.template)
                    .map(|t| t.description.to_string())
                    .unwrap_or_default(),
                agents: state.pipeline.plan_agents.iter().map(AgentSummary::from).collect(),
                project_path: state.project_path.clone(),
            });
        }

        state.pipeline.sub_phase = SubPhase::PlanWaiting;
        self.persist(lock, state)?;
        log_decision(
            &state.project_path,
            "NEXT: Template confirmed, spawning plan agents",
        );

        Ok(Action::SpawnAgents {
            agents: state.pipeline.plan_agents.clone(),
            output_dir: state.project_path.join("agent-outputs"),
        })
    }

    fn next_plan_waiting(
        &self,
        lock: &StateLock,
        state: &mut State,
    ) -> Result<Action, PipelineError> {
        let outputs_dir = state.project_path.join("agent-outputs");
        let missing: Vec<String> = state
            .pipeline
            .plan_agents
            .iter()
            .filter(|agent| !non_empty(&outputs_dir.join(format!("{}.md", agent.name))))
            .map(|agent| agent.name.clone())
            .collect();

        if !missing.is_empty() {
            let expected = state
                .pipeline
                .plan_agents
                .iter()
                .map(|a| a.name.clone())
                .collect();
            return Ok(Action::missing_outputs(
                format!("Missing outputs: {}", missing.join(", ")),
                outputs_dir,
                expected,
            ));
        }

        let collected = match self.step_plan_collect(lock, state) {
            Ok(report) => report,
            Err(e) => return Ok(Action::error(e.to_string())),
        };

        state.pipeline.sub_phase = SubPhase::PlanReview;
        self.persist(lock, state)?;
        log_decision(
            &state.project_path,
            "NEXT: Agent outputs validated, plan collected",
        );

        Ok(Action::DefineTasks {
            analyses_summary: collected.analyses_summary,
            manifest_path: collected.manifest_path,
            plan_path: collected.plan_path,
        })
    }

    fn next_plan_review(
        &self,
        lock: &StateLock,
        state: &mut State,
        confirm: bool,
    ) -> Result<Action, PipelineError> {
        let manifest_path = self.manifest_path(state);
        let plan_path = state.project_path.join("PLAN.md");
        let tasks: Vec<TaskSummary> = self
            .load_manifest(state)
            .map(|m| {
                m.tasks
                    .iter()
                    .map(|t| TaskSummary {
                        id: t.id.clone(),
                        summary: t.summary.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if !confirm {
            return Ok(Action::ConfirmPlan {
                plan_path,
                manifest_path,
                tasks,
            });
        }

        if tasks.is_empty() {
            return Ok(Action::error(
                "No tasks defined in manifest.json. Define tasks before confirming.",
            ));
        }

        if let Err(e) = self.step_plan_finalize(lock, state) {
            return Ok(Action::error(e.to_string()));
        }
        let execute = match self.step_execute(state) {
            Ok(report) => report,
            Err(e) => return Ok(Action::error(e.to_string())),
        };
        if execute.groups.is_empty() {
            return Ok(Action::error("No execution groups computed."));
        }

        state.pipeline.execution_groups = execute.groups.clone();
        state.pipeline.current_group_index = 0;
        state.pipeline.sub_phase = SubPhase::ExecWaiting;
        self.persist(lock, state)?;
        log_decision(
            &state.project_path,
            &format!(
                "NEXT: Plan finalized, {} execution groups ready",
                execute.groups.len()
            ),
        );

        Ok(Action::SpawnAgents {
            agents: execute.groups[0].agents.clone(),
            output_dir: state.project_path.join("execution-outputs"),
        })
    }

    async fn next_exec_waiting(
        &self,
        lock: &StateLock,
        state: &mut State,
    ) -> Result<Action, PipelineError> {
        let outputs_dir = state.project_path.join("execution-outputs");
        let groups = state.pipeline.execution_groups.clone();
        let idx = state.pipeline.current_group_index;

        let Some(current_group) = groups.get(idx) else {
            return Ok(Action::error("No execution groups remaining."));
        };

        let missing: Vec<String> = current_group
            .task_ids
            .iter()
            .filter(|tid| !non_empty(&outputs_dir.join(format!("{tid}.md"))))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Ok(Action::missing_outputs(
                format!("Missing outputs: {}", missing.join(", ")),
                outputs_dir,
                current_group.task_ids.clone(),
            ));
        }

        // Current group complete; spawn the next one if any remain.
        let next_idx = idx + 1;
        if next_idx < groups.len() {
            state.pipeline.current_group_index = next_idx;
            self.persist(lock, state)?;
            log_decision(
                &state.project_path,
                &format!(
                    "NEXT: Group {}/{} complete, spawning group {}",
                    idx + 1,
                    groups.len(),
                    next_idx + 1
                ),
            );
            return Ok(Action::SpawnAgents {
                agents: groups[next_idx].agents.clone(),
                output_dir: outputs_dir,
            });
        }

        // All groups done: collect, gate, then spawn the verifier.
        let collect = match self.step_execute_collect(lock, state) {
            Ok(report) => report,
            Err(e) => return Ok(Action::error(e.to_string())),
        };
        if collect.status != "execute_complete" {
            return Ok(Action::error(format!(
                "Execution incomplete. Missing tasks: {:?}",
                collect.missing_tasks
            )));
        }

        // The quality gate runs before the verifier is spawned, always.
        if let Some(action) = self.run_gate(state).await {
            return Ok(action);
        }

        let verify = match self.step_verify(state) {
            Ok(report) => report,
            Err(e) => return Ok(Action::error(e.to_string())),
        };

        state.pipeline.sub_phase = SubPhase::VerifyWait;
        self.persist(lock, state)?;
        log_decision(
            &state.project_path,
            "NEXT: All execution groups complete, spawning verifier",
        );

        Ok(Action::SpawnAgents {
            agents: vec![verify.agent],
            output_dir: state.project_path.join("verification"),
        })
    }

    /// Run the manifest's quality gate. Returns an error action on any
    /// non-pass outcome; `None` means proceed.
    async fn run_gate(&self, state: &State) -> Option<Action> {
        let manifest = self.load_manifest(state)?;
        let cmd = manifest.quality_gate_cmd.clone();
        if cmd.is_empty() {
            log_decision(&state.project_path, "QUALITY-GATE: skipped (no command)");
            return None;
        }

        log_decision(
            &state.project_path,
            &format!(
                "QUALITY-GATE: Running '{cmd}' in {}",
                manifest.target_directory.display()
            ),
        );

        match run_quality_gate(&cmd, &manifest.target_directory).await {
            GateOutcome::Passed | GateOutcome::Skipped => {
                log_decision(&state.project_path, "QUALITY-GATE: PASSED (exit 0)");
                None
            }
            GateOutcome::Failed {
                exit_code,
                output_tail,
            } => {
                log_decision(
                    &state.project_path,
                    &format!("QUALITY-GATE: FAILED (exit {exit_code})"),
                );
                Some(Action::Error {
                    message: format!(
                        "Quality gate FAILED (exit {exit_code}). Fix issues before verification."
                    ),
                    output_dir: None,
                    expected: Vec::new(),
                    verification_path: None,
                    quality_gate_cmd: Some(cmd),
                    quality_gate_output: Some(output_tail),
                })
            }
            GateOutcome::TimedOut => {
                log_decision(&state.project_path, "QUALITY-GATE: TIMEOUT (120s)");
                Some(Action::error("Quality gate timed out after 120s."))
            }
            GateOutcome::LaunchError { message } => {
                log_decision(
                    &state.project_path,
                    &format!("QUALITY-GATE: OS ERROR — {message}"),
                );
                Some(Action::error(format!("Quality gate command failed: {message}")))
            }
        }
    }

    fn next_verify_wait(
        &self,
        lock: &StateLock,
        state: &mut State,
    ) -> Result<Action, PipelineError> {
        let verify_file = state.project_path.join("verification").join("result.md");
        if !non_empty(&verify_file) {
            return Ok(Action::missing_outputs(
                "Missing output: verification/result.md".to_string(),
                state.project_path.join("verification"),
                vec!["result".to_string()],
            ));
        }

        let content = std::fs::read_to_string(&verify_file)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        if verdict_is_fail(&content) {
            log_decision(
                &state.project_path,
                "VERIFY: Verdict is FAIL — blocking finalize",
            );
            return Ok(Action::Error {
                message: "Verification verdict is FAIL. Fix issues and re-run verification."
                    .to_string(),
                output_dir: None,
                expected: Vec::new(),
                verification_path: Some(verify_file),
                quality_gate_cmd: None,
                quality_gate_output: None,
            });
        }

        if !verdict_is_pass(&content) {
            log_decision(
                &state.project_path,
                "VERIFY: No PASS/FAIL verdict found — blocking finalize",
            );
            return Ok(Action::Error {
                message: "No PASS/FAIL verdict in verification output. Must contain \
                          '\"verdict\": \"PASS\"' to proceed."
                    .to_string(),
                output_dir: None,
                expected: Vec::new(),
                verification_path: Some(verify_file),
                quality_gate_cmd: None,
                quality_gate_output: None,
            });
        }

        log_decision(
            &state.project_path,
            "VERIFY: Verdict is PASS — proceeding to finalize",
        );

        let finalized = match self.step_finalize(lock, state) {
            Ok(report) => report,
            Err(e) => return Ok(Action::error(e.to_string())),
        };

        state.pipeline.sub_phase = SubPhase::Complete;
        self.persist(lock, state)?;
        log_decision(
            &state.project_path,
            "NEXT: Verification complete, project finalized",
        );

        Ok(Action::Complete {
            summary_path: finalized.summary_path,
        })
    }
}

fn render_plan_md(state: &State, manifest: &Manifest, groups: &[Vec<String>]) -> String {
    let mut plan_md = format!("# Execution Plan: {}\n\n", state.request);
    for task in &manifest.tasks {
        plan_md.push_str(&format!("### Task {}: {}\n", task.id, task.summary));
        if !task.files.is_empty() {
            plan_md.push_str(&format!("- **Files**: {}\n", task.files.join(", ")));
        }
        if !task.depends_on.is_empty() {
            plan_md.push_str(&format!("- **Depends on**: {}\n", task.depends_on.join(", ")));
        }
        for ac in &task.acceptance_criteria {
            plan_md.push_str(&format!("- **Acceptance**: {ac}\n"));
        }
        plan_md.push_str(&format!(
            "- **Tests needed**: {}\n\n",
            if task.tests_needed { "Yes" } else { "No" }
        ));
    }

    plan_md.push_str("### Execution Order\n\n");
    for (i, group) in groups.iter().enumerate() {
        if group.len() == 1 {
            plan_md.push_str(&format!("{}. [{}] solo\n", i + 1, group[0]));
        } else {
            plan_md.push_str(&format!(
                "{}. [{}] parallel (worktree isolation)\n",
                i + 1,
                group.join(", ")
            ));
        }
    }

    if !manifest.quality_gate_cmd.is_empty() {
        plan_md.push_str(&format!(
            "\n### Quality Gate\n\n```\n{}\n```\n",
            manifest.quality_gate_cmd
        ));
    }

    plan_md
}

/// The verifier's verdict tokens, matched case-insensitively with flexible
/// whitespace around the colon.
fn verdict_is_fail(content: &str) -> bool {
    verdict_regex("FAIL").is_match(content)
}

fn verdict_is_pass(content: &str) -> bool {
    verdict_regex("PASS").is_match(content)
}

fn verdict_regex(verdict: &str) -> regex::Regex {
    regex::Regex::new(&format!(r#"(?i)"verdict"\s*:\s*"{verdict}""#)).expect("valid regex")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serializes_tagged() {
        let action = Action::Complete {
            summary_path: PathBuf::from("/p/SUMMARY.md"),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["action"], "complete");
        assert_eq!(value["summary_path"], "/p/SUMMARY.md");
    }

    #[test]
    fn test_error_action_omits_empty_fields() {
        let value = serde_json::to_value(Action::error("boom")).unwrap();
        assert_eq!(value["action"], "error");
        assert_eq!(value["message"], "boom");
        assert!(value.get("output_dir").is_none());
        assert!(value.get("expected").is_none());
        assert!(value.get("quality_gate_cmd").is_none());
    }

    #[test]
    fn test_is_error() {
        assert!(Action::error("x").is_error());
        assert!(
            !Action::Complete {
                summary_path: PathBuf::new()
            }
            .is_error()
        );
    }

    #[test]
    fn test_verdict_matching() {
        assert!(verdict_is_pass(r#"{"verdict": "PASS", "issues": []}"#));
        assert!(verdict_is_pass(r#"{"VERDICT"  :  "pass"}"#));
        assert!(verdict_is_fail(r#"{"verdict":"FAIL"}"#));
        assert!(!verdict_is_pass("Everything looks great! All tests pass."));
        assert!(!verdict_is_fail("the word FAIL alone is not a verdict"));
    }

    #[test]
    fn test_spawn_agents_serializes_agents() {
        let action = Action::SpawnAgents {
            agents: vec![AgentConfig::new("researcher", ModelTier::Opus, "p")],
            output_dir: PathBuf::from("/p/agent-outputs"),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["action"], "spawn_agents");
        assert_eq!(value["agents"][0]["name"], "researcher");
        assert_eq!(value["agents"][0]["model"], "opus");
    }
}
