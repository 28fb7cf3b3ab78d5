//! Per-flavor configuration: which tools are offered, which end the run,
//! and what happens when the model stops calling tools.

use crate::dispatcher::{self, ASK_USER, PLAN_TOOLS};
use crate::fallback::parse_commit_text;
use crate::payloads::{SUBMIT_COMMIT, SUBMIT_REPORT, SUBMIT_REVIEW, TerminalPayload};
use crate::prompts;
use devpilot_core::{AgentKind, ToolDefinition};
use devpilot_tools::{
    GIT_DIFF, GIT_LOG, GIT_SHOW, GIT_STATUS, LIST_DIRECTORY, READ_FILE, SEARCH_PATTERN, ToolHost,
};

const ALL_WORKSPACE_TOOLS: [&str; 7] = [
    READ_FILE,
    LIST_DIRECTORY,
    SEARCH_PATTERN,
    GIT_STATUS,
    GIT_DIFF,
    GIT_LOG,
    GIT_SHOW,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentFlavor {
    pub kind: AgentKind,
    /// Terminal tools in precedence order: when one response holds several
    /// successful terminal calls, the earliest entry here wins.
    pub terminal_tools: Vec<&'static str>,
    pub workspace_tools: Vec<&'static str>,
    pub plan_tools: bool,
    pub feedback_tool: bool,
    /// A reply without tool calls is a protocol violation unless the text
    /// fallback recovers a result.
    pub tool_mandatory: bool,
    pub text_fallback: bool,
}

impl AgentFlavor {
    pub fn for_kind(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Commit => Self {
                kind,
                terminal_tools: vec![SUBMIT_COMMIT],
                workspace_tools: vec![GIT_STATUS, GIT_DIFF, GIT_LOG, READ_FILE, SEARCH_PATTERN],
                plan_tools: false,
                feedback_tool: false,
                tool_mandatory: true,
                text_fallback: true,
            },
            AgentKind::Review => Self {
                kind,
                terminal_tools: vec![SUBMIT_REVIEW],
                workspace_tools: ALL_WORKSPACE_TOOLS.to_vec(),
                plan_tools: false,
                feedback_tool: false,
                tool_mandatory: true,
                text_fallback: false,
            },
            AgentKind::Debug => Self {
                kind,
                terminal_tools: vec![SUBMIT_REPORT],
                workspace_tools: ALL_WORKSPACE_TOOLS.to_vec(),
                plan_tools: true,
                feedback_tool: true,
                tool_mandatory: false,
                text_fallback: false,
            },
            AgentKind::Report => Self {
                kind,
                terminal_tools: vec![SUBMIT_REPORT],
                workspace_tools: ALL_WORKSPACE_TOOLS.to_vec(),
                plan_tools: false,
                feedback_tool: true,
                tool_mandatory: false,
                text_fallback: false,
            },
        }
    }

    pub fn system_prompt(&self) -> String {
        prompts::system_prompt(self.kind)
    }

    pub fn primary_terminal(&self) -> &'static str {
        self.terminal_tools.first().copied().unwrap_or(SUBMIT_REPORT)
    }

    pub fn nudge(&self) -> String {
        prompts::nudge_message(self.kind, self.primary_terminal())
    }

    pub fn terminal_rank(&self, name: &str) -> Option<usize> {
        self.terminal_tools.iter().position(|tool| *tool == name)
    }

    /// Whether `name` is declared for this flavor.
    pub fn allows(&self, name: &str) -> bool {
        self.workspace_tools.contains(&name)
            || self.terminal_rank(name).is_some()
            || (self.plan_tools && PLAN_TOOLS.contains(&name))
            || (self.feedback_tool && name == ASK_USER)
    }

    /// Try to recover a terminal result from a reply that made no tool call.
    pub fn fallback(&self, text: &str) -> Option<TerminalPayload> {
        if !self.text_fallback {
            return None;
        }
        match self.kind {
            AgentKind::Commit => parse_commit_text(text).map(TerminalPayload::Commit),
            _ => None,
        }
    }

    /// Definitions offered to the model: the host's workspace tools this
    /// flavor allows, then the plan, feedback, and terminal tools.
    pub fn tool_definitions(&self, host: &dyn ToolHost) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = host
            .definitions()
            .into_iter()
            .filter(|def| self.workspace_tools.contains(&def.function.name.as_str()))
            .collect();
        if self.plan_tools {
            defs.extend(dispatcher::plan_tool_definitions());
        }
        if self.feedback_tool {
            defs.push(dispatcher::ask_user_definition());
        }
        defs.extend(
            self.terminal_tools
                .iter()
                .filter_map(|name| dispatcher::terminal_definition(name)),
        );
        defs
    }
}
