//! Deterministic prompt generation and input sanitation.
//!
//! Prompts are pure functions of (role, request, project path, config,
//! task, manifest): identical inputs produce byte-identical output. Any
//! agent-supplied text is sanitized before it is embedded in a prompt the
//! orchestrator itself consumes.

use crate::config::{QralphConfig, ResearchConfig};
use crate::planner::{Manifest, Task};
use crate::store::{AgentConfig, ModelTier};
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

/// Maximum characters of agent output embedded into any prompt.
pub const MAX_AGENT_OUTPUT_EMBED: usize = 8000;

/// Maximum characters accepted for a user request.
pub const MAX_REQUEST_LENGTH: usize = 2000;

/// Prompt-injection patterns stripped from agent output, in order.
static INJECTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)ignore\s+(all\s+)?(previous\s+|prior\s+)?(instructions?|prompts?|context)",
        r"(?i)disregard\s+(all\s+)?(previous\s+)?(instructions?|prompts?)",
        r"(?i)you\s+are\s+now\b",
        r"(?i)new\s+(system\s+)?prompt",
        r"(?i)act\s+as\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid injection pattern"))
    .collect()
});

static SECRET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(key|token|secret|password)\s*[=:]\s*\S{8,}").expect("valid secret pattern")
});

/// Truncate agent output and replace injection phrases with `[REDACTED]`.
pub fn sanitize_agent_output(content: &str) -> String {
    let mut content: String = content.chars().take(MAX_AGENT_OUTPUT_EMBED).collect();
    for pattern in INJECTION_PATTERNS.iter() {
        content = pattern.replace_all(&content, "[REDACTED]").into_owned();
    }
    content
}

/// Validate a user request: rejects over-length input, warns (but does not
/// rewrite) when it looks like it contains a credential.
pub fn sanitize_request(request: &str) -> Result<&str, crate::errors::PipelineError> {
    let len = request.chars().count();
    if len > MAX_REQUEST_LENGTH {
        return Err(crate::errors::PipelineError::RequestTooLong {
            len,
            max: MAX_REQUEST_LENGTH,
        });
    }
    if SECRET_PATTERN.is_match(request) {
        warn!("Request may contain sensitive data. Review before proceeding.");
    }
    Ok(request)
}

/// Build the research-tool instruction block from detected tools. The
/// built-in web-search/fetch fallback is always appended.
pub fn build_research_instructions(research: &ResearchConfig) -> String {
    let mut lines = Vec::new();
    if research.detected.iter().any(|t| t == "context7") {
        lines.push(
            "- For library/API documentation: use Context7 MCP (resolve-library-id -> query-docs)",
        );
    }
    if research.detected.iter().any(|t| t == "tavily") {
        lines.push("- For web research on bugs/design/patterns: use Tavily MCP");
    }
    if research.detected.iter().any(|t| t == "brave_search") {
        lines.push("- For web search: use Brave Search MCP");
    }
    lines.push("- Fallback: use WebSearch for anything the above tools don't cover");
    lines.push("- Use WebFetch to read specific URLs when needed");
    lines.join("\n")
}

/// Directive appended to every plan-phase prompt: plan agents analyse,
/// the orchestrator persists.
const NO_FILE_WRITES: &str = "IMPORTANT: Do NOT write any files to disk. Return your entire \
     analysis as your response text. The orchestrator will save your output.";

fn base_context(request: &str, project_path: &str) -> String {
    format!(
        "You are analyzing a codebase to help plan work on this request:\n\n\
         REQUEST: {request}\n\n\
         PROJECT PATH: {project_path}\n\n\
         Write your analysis as markdown. Be specific about file paths, line numbers, \
         and concrete findings. Keep your response under 3000 words.\n\n\
         {NO_FILE_WRITES}"
    )
}

/// Build the prompt for one plan-phase role. Unknown roles get a generic
/// analysis prompt. All plan agents run at the highest-capability tier.
pub fn build_plan_agent_prompt(
    role: &str,
    request: &str,
    project_path: &str,
    config: &QralphConfig,
) -> AgentConfig {
    let context = base_context(request, project_path);
    let research = build_research_instructions(&config.research);

    let prompt = match role {
        "researcher" => format!(
            "You are a technical researcher. Your job is to gather facts about the codebase \
             and external documentation relevant to the request.\n\n\
             {context}\n\n\
             ## Research Tools\n{research}\n\n\
             ## Your Deliverable\n\
             1. **Codebase Analysis**: Key files, patterns, dependencies relevant to the request\n\
             2. **External Research**: Relevant documentation, known issues, best practices\n\
             3. **Constraints**: Technical limitations, compatibility concerns, breaking changes\n\
             4. **Recommendations**: Specific suggestions based on your research"
        ),
        "sde-iii" => format!(
            "You are a senior software engineer (SDE-III). Your job is to analyze the codebase \
             and create a concrete implementation plan.\n\n\
             {context}\n\n\
             ## Research Tools\n{research}\n\n\
             ## Your Deliverable\n\
             1. **Files to Change**: List every file that needs modification with specific changes\n\
             2. **Implementation Steps**: Ordered list of changes with dependencies between them\n\
             3. **Testing Strategy**: What tests to write, what to verify\n\
             4. **Risk Assessment**: What could go wrong, edge cases, breaking changes\n\
             5. **Acceptance Criteria**: Testable conditions that prove the work is done"
        ),
        "security-reviewer" => format!(
            "You are a security reviewer. Your job is to identify security concerns \
             in the current code and in the proposed changes.\n\n\
             {context}\n\n\
             ## Research Tools\n{research}\n\n\
             ## Your Deliverable\n\
             1. **Current Vulnerabilities**: Security issues in existing code (with file:line)\n\
             2. **Change Risks**: Security implications of the proposed changes\n\
             3. **Recommendations**: Specific security improvements, ordered by severity\n\
             4. **Compliance**: OWASP Top 10, input validation, auth/authz concerns"
        ),
        "ux-designer" => format!(
            "You are a UX designer. Your job is to evaluate the user experience \
             implications of the proposed changes.\n\n\
             {context}\n\n\
             ## Research Tools\n{research}\n\n\
             ## Your Deliverable\n\
             1. **Current UX Assessment**: How the current UI/UX works\n\
             2. **Proposed Changes**: UX improvements aligned with the request\n\
             3. **Accessibility**: WCAG compliance considerations\n\
             4. **User Flows**: Key interaction paths affected by the changes"
        ),
        "architecture-advisor" => format!(
            "You are a system architect. Your job is to evaluate the architectural \
             implications of the proposed changes.\n\n\
             {context}\n\n\
             ## Research Tools\n{research}\n\n\
             ## Your Deliverable\n\
             1. **Current Architecture**: How the system is structured\n\
             2. **Impact Analysis**: How the proposed changes affect the architecture\n\
             3. **Alternatives**: Different approaches with trade-offs\n\
             4. **Recommendations**: Preferred approach with justification"
        ),
        other => format!(
            "You are a {other}. Analyze the codebase for this request.\n\n\
             {context}\n\n\
             ## Research Tools\n{research}"
        ),
    };

    AgentConfig::new(role, ModelTier::Opus, prompt)
}

/// Build the prompt for one execution-phase task agent.
pub fn build_execution_prompt(task: &Task, manifest: &Manifest) -> String {
    let acceptance: String = task
        .acceptance_criteria
        .iter()
        .map(|ac| format!("- {ac}"))
        .collect::<Vec<_>>()
        .join("\n");
    let files = task.files.join(", ");
    let working_dir = manifest.target_directory.display();

    let mut prompt = format!(
        "You are implementing a specific task for this project.\n\n\
         ## Working Directory\n\
         IMPORTANT: All files MUST be created/modified in: {working_dir}\n\
         Do NOT write files anywhere else. Use absolute paths based on this directory.\n\n\
         ## Original Request\n{}\n\n\
         ## Your Task: {}\n\n\
         {}\n\n\
         ## Files to Modify\n{files}\n\n\
         ## Acceptance Criteria\n{acceptance}\n\n",
        manifest.request, task.summary, task.description,
    );

    if task.tests_needed {
        prompt.push_str(
            "## Testing\n\
             Write tests BEFORE implementation (TDD). Tests must:\n\
             - Cover each acceptance criterion\n\
             - Be co-located with the code\n\
             - Pass after implementation\n\n",
        );
    }

    if !manifest.quality_gate_cmd.is_empty() {
        prompt.push_str(&format!(
            "## Quality Gate\n\
             After implementation, run: `{}`\n\
             All checks must pass.\n\n",
            manifest.quality_gate_cmd
        ));
    }

    prompt.push_str(
        "## Output Format\n\
         When done, report:\n\
         1. Files changed (with brief description of each change)\n\
         2. Tests written (file paths)\n\
         3. Quality gate results (pass/fail with output)\n\
         4. Any issues or concerns\n",
    );

    prompt
}

/// Build the fresh-context verification prompt. `execution_results` is the
/// pre-sanitized concatenation of all execution outputs.
pub fn build_verification_prompt(manifest: &Manifest, execution_results: &str) -> String {
    let criteria: Vec<String> = manifest
        .tasks
        .iter()
        .flat_map(|task| {
            task.acceptance_criteria
                .iter()
                .map(move |ac| format!("- [{}] {}", task.id, ac))
        })
        .collect();
    let criteria_text = if criteria.is_empty() {
        "No acceptance criteria defined.".to_string()
    } else {
        criteria.join("\n")
    };

    let mut prompt = format!(
        "You are a fresh-context verification agent. You have NO knowledge of how \
         the implementation was done. Your job is to independently verify the work.\n\n\
         ## Working Directory\n\
         The project codebase is at: {}\n\
         Read files from this directory to verify the implementation.\n\n\
         ## Original Request\n{}\n\n\
         ## Acceptance Criteria\n{criteria_text}\n\n\
         ## What Was Reported Done\n{execution_results}\n\n",
        manifest.target_directory.display(),
        manifest.request,
    );

    if !manifest.quality_gate_cmd.is_empty() {
        prompt.push_str(&format!(
            "## Quality Gate\nRun: `{}`\n\n",
            manifest.quality_gate_cmd
        ));
    }

    prompt.push_str(
        "## Your Job\n\
         1. Read the changed files directly from the codebase\n\
         2. For each acceptance criterion, verify it is actually met (not just claimed)\n\
         3. Run the quality gate command\n\
         4. Report your verdict:\n\n\
         ```json\n\
         {\"verdict\": \"PASS\" or \"FAIL\", \"criteria_results\": [{\"criterion\": \"...\", \
         \"status\": \"pass/fail\", \"evidence\": \"...\"}], \"quality_gate\": \"pass/fail\", \
         \"issues\": [\"...\"]}\n\
         ```\n",
    );

    prompt
}
