//! Task templates and keyword-based template suggestion.
//!
//! A template names the plan-phase review roles to spawn for a class of
//! request. Suggestion is a deterministic keyword count over the request
//! text; the first template in declaration order wins a tie, so `security`
//! is declared ahead of `code-audit` (a security-flavoured audit must land
//! on `security`). An empty score set falls back to `research`.

use std::collections::BTreeMap;

/// Plan-phase roles that must be present regardless of template.
pub const CRITICAL_AGENTS: &[&str] = &["sde-iii", "architecture-advisor"];

/// A task template: description plus the plan-phase roles it spawns.
#[derive(Debug, Clone)]
pub struct TaskTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub plan_agents: &'static [&'static str],
    keywords: &'static [&'static str],
}

/// All templates, in suggestion-priority order: ties go to the earlier
/// entry, so `security` outranks `code-audit`.
pub const TASK_TEMPLATES: &[TaskTemplate] = &[
    TaskTemplate {
        name: "security",
        description: "Security audit and hardening",
        plan_agents: &["researcher", "security-reviewer", "sde-iii"],
        keywords: &[
            "security", "vulnerability", "cve", "xss", "injection", "auth", "encrypt", "pentest",
        ],
    },
    TaskTemplate {
        name: "code-audit",
        description: "Analyze code for bugs, security issues, and quality problems",
        plan_agents: &["researcher", "sde-iii", "security-reviewer"],
        keywords: &["audit", "review", "analyze", "quality", "lint", "check"],
    },
    TaskTemplate {
        name: "bug-fix",
        description: "Debug and fix a specific issue",
        plan_agents: &["researcher", "sde-iii"],
        keywords: &["bug", "fix", "error", "broken", "crash", "fail", "issue", "debug"],
    },
    TaskTemplate {
        name: "ui-change",
        description: "Modify user interface components",
        plan_agents: &["researcher", "sde-iii", "ux-designer"],
        keywords: &[
            "ui", "ux", "interface", "design", "layout", "component", "page", "button", "form",
            "css", "style",
        ],
    },
    TaskTemplate {
        name: "new-feature",
        description: "Build new functionality end-to-end",
        plan_agents: &["researcher", "sde-iii", "security-reviewer", "ux-designer"],
        keywords: &["add", "create", "build", "implement", "new", "feature"],
    },
    TaskTemplate {
        name: "architecture",
        description: "System design and architecture review",
        plan_agents: &["researcher", "sde-iii", "architecture-advisor"],
        keywords: &[
            "architecture", "design", "scale", "refactor", "migrate", "pattern", "system",
        ],
    },
    TaskTemplate {
        name: "research",
        description: "Research a topic, produce options and recommendations",
        plan_agents: &["researcher", "sde-iii"],
        keywords: &[
            "research", "compare", "evaluate", "investigate", "options", "recommend",
        ],
    },
];

/// Look up a template by name.
pub fn get_template(name: &str) -> Option<&'static TaskTemplate> {
    TASK_TEMPLATES.iter().find(|t| t.name == name)
}

/// Suggest a template by keyword count over the lowercased request.
/// Returns the winning template name and the non-zero scores.
pub fn suggest_template(request: &str) -> (&'static str, BTreeMap<String, u32>) {
    let request_lower = request.to_lowercase();
    let mut scores: BTreeMap<String, u32> = BTreeMap::new();

    for template in TASK_TEMPLATES {
        let score = template
            .keywords
            .iter()
            .filter(|kw| request_lower.contains(*kw))
            .count() as u32;
        if score > 0 {
            scores.insert(template.name.to_string(), score);
        }
    }

    if scores.is_empty() {
        return ("research", scores);
    }

    // First max wins: only a strictly higher score displaces an earlier
    // template, so ties follow declaration order.
    let mut best = "research";
    let mut best_score = 0u32;
    for template in TASK_TEMPLATES {
        if let Some(&score) = scores.get(template.name)
            && score > best_score
        {
            best = template.name;
            best_score = score;
        }
    }

    (best, scores)
}

/// Ensure every critical agent appears in the role list, appending any that
/// are missing while preserving order and avoiding duplicates.
pub fn enforce_critical_agents(agents: &[&str]) -> Vec<String> {
    let mut result: Vec<String> = agents.iter().map(|s| s.to_string()).collect();
    for critical in CRITICAL_AGENTS {
        if !result.iter().any(|a| a == critical) {
            result.push(critical.to_string());
        }
    }
    result
}
