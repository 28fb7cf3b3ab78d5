//! System prompts and request messages for each agent flavor.

use devpilot_core::{AgentKind, Phase};
use serde_json::Value;

const SHARED_RULES: &str = r#"## RULES
1. Use tools to gather information. Never invent file contents, paths, or history.
2. Paths are relative to the workspace root.
3. Keep your own messages short. Put the result into the final tool call.
4. When several independent lookups are needed, call several tools at once.
"#;

pub const COMMIT_SYSTEM_PROMPT: &str = r#"You are DevPilot, writing a git commit message for the changes in this repository.

Inspect the staged diff (git_diff with staged=true) first. If nothing is staged, use the unstaged diff.
Read surrounding code only when the diff alone does not explain the change.

Finish by calling submit_commit exactly once with a Conventional Commits message:
- type: one of feat, fix, docs, style, refactor, perf, test, build, ci, chore, revert
- scope: optional, a single word naming the area touched
- subject: imperative mood, lower case, no trailing period, at most 72 characters
- body: optional, explains what changed and why
"#;

pub const REVIEW_SYSTEM_PROMPT: &str = r#"You are DevPilot, reviewing a code change.

Read the diff, then read the changed files where context is needed. Look for bugs, missing error handling, unsafe assumptions, and missing tests.
Report only findings you can point to in the code.

Finish by calling submit_review exactly once with a summary, a verdict (approve, request_changes, or comment) and the list of findings.
"#;

pub const DEBUG_SYSTEM_PROMPT: &str = r#"You are DevPilot, investigating a defect in this repository.

Work through the investigation phases in order:
problem_definition, impact_analysis, root_cause_hypothesis, investigation_plan, execution, verification, reporting.
Record your plan with add_task and keep it current with update_task. Call transition_phase when you move on.
Use ask_user only when the repository cannot answer a question.

Finish by calling submit_report with the root cause, the evidence that supports it, and your recommendations.
"#;

pub const REPORT_SYSTEM_PROMPT: &str = r#"You are DevPilot, writing a technical report about this repository.

Explore the code and history that bear on the topic. Cite files and commits as evidence.
Use ask_user only when the repository cannot answer a question.

Finish by calling submit_report with a title, a summary, the evidence and recommendations.
"#;

pub fn system_prompt(kind: AgentKind) -> String {
    let base = match kind {
        AgentKind::Commit => COMMIT_SYSTEM_PROMPT,
        AgentKind::Review => REVIEW_SYSTEM_PROMPT,
        AgentKind::Debug => DEBUG_SYSTEM_PROMPT,
        AgentKind::Report => REPORT_SYSTEM_PROMPT,
    };
    format!("{base}\n{SHARED_RULES}")
}

/// The first user message, rendered from the session's original request.
pub fn request_message(kind: AgentKind, request: &Value) -> String {
    let field = |name: &str| {
        request
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let mut out = match kind {
        AgentKind::Commit => "Write a commit message for the current changes.".to_string(),
        AgentKind::Review => match field("base") {
            Some(base) => format!("Review the changes between `{base}` and HEAD."),
            None => "Review the uncommitted changes in the working tree.".to_string(),
        },
        AgentKind::Debug => format!(
            "Investigate this issue:\n\n{}",
            field("issue").unwrap_or("(no description given)")
        ),
        AgentKind::Report => format!(
            "Write a report on:\n\n{}",
            field("topic").unwrap_or("(no topic given)")
        ),
    };
    if let Some(notes) = field("notes") {
        out.push_str(&format!("\n\nAdditional notes:\n{notes}"));
    }
    out
}

/// Appended when a non-mandatory flavor replies without calling a tool.
pub fn nudge_message(kind: AgentKind, terminal_tool: &str) -> String {
    match kind {
        AgentKind::Debug => format!(
            "Continue the investigation with tools. When the root cause is established, call {terminal_tool}."
        ),
        _ => format!("Continue using tools. When you are done, call {terminal_tool} with the result."),
    }
}

pub fn phase_list() -> String {
    Phase::ALL
        .iter()
        .map(Phase::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_flavor_prompt_names_its_terminal_tool() {
        assert!(system_prompt(AgentKind::Commit).contains("submit_commit"));
        assert!(system_prompt(AgentKind::Review).contains("submit_review"));
        assert!(system_prompt(AgentKind::Debug).contains("submit_report"));
        assert!(system_prompt(AgentKind::Report).contains("submit_report"));
        assert!(system_prompt(AgentKind::Debug).contains("## RULES"));
    }

    #[test]
    fn debug_prompt_lists_every_phase() {
        let prompt = system_prompt(AgentKind::Debug);
        for phase in Phase::ALL {
            assert!(prompt.contains(phase.as_str()), "missing {phase}");
        }
    }

    #[test]
    fn request_message_uses_request_fields() {
        assert_eq!(
            request_message(AgentKind::Review, &json!({"base": "main"})),
            "Review the changes between `main` and HEAD."
        );
        assert_eq!(
            request_message(AgentKind::Review, &json!({})),
            "Review the uncommitted changes in the working tree."
        );
        let debug = request_message(
            AgentKind::Debug,
            &json!({"issue": "add() returns wrong sum", "notes": "seen in CI"}),
        );
        assert_eq!(
            debug,
            "Investigate this issue:\n\nadd() returns wrong sum\n\nAdditional notes:\nseen in CI"
        );
    }

    #[test]
    fn phase_list_is_ordered() {
        assert!(phase_list().starts_with("problem_definition, impact_analysis"));
        assert!(phase_list().ends_with("reporting"));
    }
}
