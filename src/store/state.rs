//! The persistent State record and its enumerated phases.
//!
//! The state is a single typed record persisted as JSON. Every committed
//! write carries a `_checksum` over the canonical serialisation (minus the
//! checksum itself) so corruption is detected at the next load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Coarse pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Plan,
    Execute,
    Verify,
    Complete,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Plan => write!(f, "PLAN"),
            Phase::Execute => write!(f, "EXECUTE"),
            Phase::Verify => write!(f, "VERIFY"),
            Phase::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// Fine-grained state: the actual vertex of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubPhase {
    #[default]
    Init,
    PlanWaiting,
    PlanReview,
    ExecWaiting,
    VerifyWait,
    Complete,
}

impl std::fmt::Display for SubPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubPhase::Init => write!(f, "INIT"),
            SubPhase::PlanWaiting => write!(f, "PLAN_WAITING"),
            SubPhase::PlanReview => write!(f, "PLAN_REVIEW"),
            SubPhase::ExecWaiting => write!(f, "EXEC_WAITING"),
            SubPhase::VerifyWait => write!(f, "VERIFY_WAIT"),
            SubPhase::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// Model capability tier assigned to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Haiku,
    #[default]
    Sonnet,
    Opus,
}

/// An agent the engine wants spawned: pure data, never invoked here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub model: ModelTier,
    pub prompt: String,
    /// Set for execution-phase agents only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Execution agents in a multi-member group run in worktree isolation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub use_worktree: bool,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, model: ModelTier, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model,
            prompt: prompt.into(),
            task_id: None,
            use_worktree: false,
        }
    }
}

/// One parallel execution group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionGroup {
    pub task_ids: Vec<String>,
    pub agents: Vec<AgentConfig>,
    pub parallel: bool,
}

/// Pipeline sub-state nested inside [`State`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineState {
    #[serde(default)]
    pub sub_phase: SubPhase,
    #[serde(default)]
    pub plan_agents: Vec<AgentConfig>,
    #[serde(default)]
    pub execution_groups: Vec<ExecutionGroup>,
    #[serde(default)]
    pub current_group_index: usize,
}

/// Budget accounting for the circuit breakers. Lives inside the state record
/// so it is persisted and checksummed with everything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CircuitBreakers {
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub error_counts: BTreeMap<String, u32>,
}

/// The persistent project state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub project_id: String,
    pub project_path: PathBuf,
    pub target_directory: PathBuf,
    pub request: String,
    pub phase: Phase,
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub pipeline: PipelineState,
    #[serde(default)]
    pub circuit_breakers: CircuitBreakers,
    #[serde(default)]
    pub heal_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Hex SHA-256 over the canonical serialisation with this field removed.
    #[serde(rename = "_checksum", default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Directory-safe project identifier.
static PROJECT_ID_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,99}$").expect("valid regex"));

/// Maximum entries retained in `error_counts`.
pub const MAX_ERROR_KEYS: usize = 100;

/// Maximum request length accepted anywhere in the engine.
pub const MAX_REQUEST_LENGTH: usize = 2000;

impl State {
    /// Validate structural invariants. Returns one message per violation;
    /// empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !PROJECT_ID_RE.is_match(&self.project_id) {
            errors.push(format!("project_id '{}' is not directory-safe", self.project_id));
        }
        if self.request.chars().count() > MAX_REQUEST_LENGTH {
            errors.push(format!(
                "request exceeds {} chars ({})",
                MAX_REQUEST_LENGTH,
                self.request.chars().count()
            ));
        }
        if !self.project_path.is_absolute() {
            errors.push(format!(
                "project_path is not absolute: {}",
                self.project_path.display()
            ));
        }
        if !self.target_directory.is_absolute() {
            errors.push(format!(
                "target_directory is not absolute: {}",
                self.target_directory.display()
            ));
        }
        if matches!(
            self.pipeline.sub_phase,
            SubPhase::ExecWaiting | SubPhase::VerifyWait | SubPhase::Complete
        ) && self.pipeline.execution_groups.is_empty()
        {
            errors.push(format!(
                "sub_phase {} requires non-empty execution_groups",
                self.pipeline.sub_phase
            ));
        }
        if !self.circuit_breakers.total_cost_usd.is_finite()
            || self.circuit_breakers.total_cost_usd < 0.0
        {
            errors.push("circuit_breakers.total_cost_usd must be a non-negative number".to_string());
        }
        if self.circuit_breakers.error_counts.len() > MAX_ERROR_KEYS {
            errors.push(format!(
                "circuit_breakers.error_counts has {} entries (max {})",
                self.circuit_breakers.error_counts.len(),
                MAX_ERROR_KEYS
            ));
        }

        errors
    }

    /// Rebuild a State from a raw JSON value, filling missing or malformed
    /// fields with defaults without touching valid values. Used on checksum
    /// mismatch and on explicit recovery.
    pub fn repair(raw: &Value) -> State {
        fn field<T: serde::de::DeserializeOwned>(raw: &Value, name: &str) -> Option<T> {
            raw.get(name)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
        }

        State {
            project_id: field(raw, "project_id").unwrap_or_else(|| "unknown".to_string()),
            project_path: field(raw, "project_path").unwrap_or_default(),
            target_directory: field(raw, "target_directory").unwrap_or_default(),
            request: field(raw, "request").unwrap_or_default(),
            phase: field(raw, "phase").unwrap_or_default(),
            template: field(raw, "template").unwrap_or_default(),
            pipeline: field(raw, "pipeline").unwrap_or_default(),
            circuit_breakers: field(raw, "circuit_breakers").unwrap_or_default(),
            heal_attempts: field(raw, "heal_attempts").unwrap_or_default(),
            created_at: field(raw, "created_at").unwrap_or_else(Utc::now),
            completed_at: field(raw, "completed_at").unwrap_or_default(),
            checksum: None,
        }
    }
}
