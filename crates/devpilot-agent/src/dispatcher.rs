//! Maps a model tool call to a decode step and an execute step.
//!
//! Decoding is total over tool names: every name resolves to a [`ToolArgs`]
//! variant or to [`ToolDecodeError`]. Nothing the model sends is fatal; each
//! failure comes back as an `Error: ...` tool result so the loop can carry on.

use crate::flavors::AgentFlavor;
use crate::payloads::{
    CommitMessage, ReportPayload, ReviewReport, SUBMIT_COMMIT, SUBMIT_REPORT, SUBMIT_REVIEW,
    TerminalPayload,
};
use crate::plan_tracker::PhasePlanTracker;
use devpilot_core::{
    FunctionDefinition, ParamSpec, Phase, TaskStatus, ToolCall, ToolDefinition, ToolSchema,
};
use devpilot_tools::{ToolHost, ToolInput, parse_args};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

pub const ADD_TASK: &str = "add_task";
pub const UPDATE_TASK: &str = "update_task";
pub const REMOVE_TASK: &str = "remove_task";
pub const TRANSITION_PHASE: &str = "transition_phase";
pub const ASK_USER: &str = "ask_user";

pub const PLAN_TOOLS: [&str; 4] = [ADD_TASK, UPDATE_TASK, REMOVE_TASK, TRANSITION_PHASE];

/// Answers an `ask_user` question. `None` means no answer is available.
pub type FeedbackCallback = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolDecodeError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("{tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct AddTaskArgs {
    id: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct UpdateTaskArgs {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RemoveTaskArgs {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TransitionPhaseArgs {
    phase: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct AskUserArgs {
    question: String,
}

/// Decoded parameters, one variant per tool name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolArgs {
    Workspace(ToolInput),
    AddTask { id: String, description: String },
    UpdateTask { id: String, status: TaskStatus },
    RemoveTask { id: String },
    TransitionPhase { phase: Phase, reason: String },
    AskUser { question: String },
    Submit(TerminalPayload),
}

impl ToolArgs {
    pub fn decode(name: &str, raw: &str) -> Result<ToolArgs, ToolDecodeError> {
        let invalid = |reason: String| ToolDecodeError::InvalidArguments {
            tool: name.to_string(),
            reason,
        };
        if let Some(decoded) = ToolInput::decode(name, raw) {
            return decoded
                .map(ToolArgs::Workspace)
                .map_err(|err| invalid(err.to_string()));
        }
        let args = match name {
            ADD_TASK => parse_args::<AddTaskArgs>(raw).map(|a| {
                if a.id.trim().is_empty() {
                    Err("task id must not be empty".to_string())
                } else {
                    Ok(ToolArgs::AddTask {
                        id: a.id.trim().to_string(),
                        description: a.description,
                    })
                }
            }),
            UPDATE_TASK => parse_args::<UpdateTaskArgs>(raw).map(|a| {
                a.status
                    .parse::<TaskStatus>()
                    .map(|status| ToolArgs::UpdateTask { id: a.id, status })
                    .map_err(|err| err.to_string())
            }),
            REMOVE_TASK => parse_args::<RemoveTaskArgs>(raw).map(|a| Ok(ToolArgs::RemoveTask { id: a.id })),
            TRANSITION_PHASE => parse_args::<TransitionPhaseArgs>(raw).map(|a| {
                a.phase
                    .parse::<Phase>()
                    .map(|phase| ToolArgs::TransitionPhase {
                        phase,
                        reason: a.reason,
                    })
                    .map_err(|err| err.to_string())
            }),
            ASK_USER => parse_args::<AskUserArgs>(raw).map(|a| {
                if a.question.trim().is_empty() {
                    Err("question must not be empty".to_string())
                } else {
                    Ok(ToolArgs::AskUser {
                        question: a.question,
                    })
                }
            }),
            SUBMIT_COMMIT => parse_args::<CommitMessage>(raw).map(|m| submit(TerminalPayload::Commit(m))),
            SUBMIT_REVIEW => parse_args::<ReviewReport>(raw).map(|r| submit(TerminalPayload::Review(r))),
            SUBMIT_REPORT => parse_args::<ReportPayload>(raw).map(|r| submit(TerminalPayload::Report(r))),
            _ => return Err(ToolDecodeError::Unknown(name.to_string())),
        };
        match args {
            Ok(Ok(args)) => Ok(args),
            Ok(Err(reason)) => Err(invalid(reason)),
            Err(err) => Err(invalid(err.to_string())),
        }
    }
}

fn submit(payload: TerminalPayload) -> Result<ToolArgs, String> {
    match payload.validate() {
        Ok(()) => Ok(ToolArgs::Submit(payload)),
        Err(err) => Err(err.to_string()),
    }
}

/// Result of dispatching one call: the text answered to the model, the
/// decoded payload when the call was a successful terminal, and the error
/// message when the call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub content: String,
    pub terminal: Option<TerminalPayload>,
    pub error: Option<String>,
}

impl DispatchOutcome {
    fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            terminal: None,
            error: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            content: format!("Error: {reason}"),
            terminal: None,
            error: Some(reason),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub struct ToolDispatcher {
    host: Arc<dyn ToolHost + Send + Sync>,
    feedback: Option<FeedbackCallback>,
}

impl ToolDispatcher {
    pub fn new(host: Arc<dyn ToolHost + Send + Sync>) -> Self {
        Self {
            host,
            feedback: None,
        }
    }

    pub fn with_feedback(mut self, feedback: FeedbackCallback) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn dispatch(
        &self,
        call: &ToolCall,
        flavor: &AgentFlavor,
        plan: &mut PhasePlanTracker,
    ) -> DispatchOutcome {
        if !flavor.allows(&call.name) {
            return DispatchOutcome::failed(ToolDecodeError::Unknown(call.name.clone()).to_string());
        }
        let args = match ToolArgs::decode(&call.name, &call.arguments) {
            Ok(args) => args,
            Err(err) => return DispatchOutcome::failed(err.to_string()),
        };
        match args {
            ToolArgs::Workspace(input) => match self.host.execute(&input) {
                Ok(output) => DispatchOutcome::ok(output),
                Err(err) => DispatchOutcome::failed(format!("{err:#}")),
            },
            ToolArgs::AddTask { id, description } => {
                if plan.add_task(&id, &description) {
                    DispatchOutcome::ok(format!("Added task {id}.\n{}", plan.to_compact_summary()))
                } else {
                    DispatchOutcome::failed(format!("task {id} already exists"))
                }
            }
            ToolArgs::UpdateTask { id, status } => {
                if plan.task(&id).is_none() {
                    DispatchOutcome::failed(format!("no task with id {id}"))
                } else if plan.update_task(&id, status) {
                    DispatchOutcome::ok(format!("Task {id} is now {status}."))
                } else {
                    DispatchOutcome::ok(format!("Task {id} was already {status}."))
                }
            }
            ToolArgs::RemoveTask { id } => {
                if plan.remove_task(&id) {
                    DispatchOutcome::ok(format!("Removed task {id}."))
                } else {
                    DispatchOutcome::failed(format!("no task with id {id}"))
                }
            }
            ToolArgs::TransitionPhase { phase, reason } => {
                if plan.transition(phase, &reason) {
                    DispatchOutcome::ok(format!(
                        "Moved to phase {}/{}: {phase}.",
                        phase.position(),
                        Phase::ALL.len()
                    ))
                } else {
                    DispatchOutcome::ok(format!("Already in phase {phase}."))
                }
            }
            ToolArgs::AskUser { question } => {
                let answer = self.feedback.as_ref().and_then(|ask| ask(&question));
                match answer {
                    Some(answer) if !answer.trim().is_empty() => {
                        DispatchOutcome::ok(format!("User answered: {}", answer.trim()))
                    }
                    _ => DispatchOutcome::ok(
                        "No answer is available. Continue with the information you have.",
                    ),
                }
            }
            ToolArgs::Submit(payload) => DispatchOutcome {
                content: format!("{} accepted.", payload.tool_name()),
                terminal: Some(payload),
                error: None,
            },
        }
    }
}

pub fn plan_tool_schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: ADD_TASK,
            description: "Add a pending task to the investigation plan.",
            parameters: vec![
                ParamSpec::required("id", "string", "Short unique task id, e.g. t1"),
                ParamSpec::required("description", "string", "What the task is"),
            ],
        },
        ToolSchema {
            name: UPDATE_TASK,
            description: "Change a task's status: pending, in_progress, completed, or skipped.",
            parameters: vec![
                ParamSpec::required("id", "string", "Task id"),
                ParamSpec::required("status", "string", "New status"),
            ],
        },
        ToolSchema {
            name: REMOVE_TASK,
            description: "Remove a task from the plan.",
            parameters: vec![ParamSpec::required("id", "string", "Task id")],
        },
        ToolSchema {
            name: TRANSITION_PHASE,
            description: "Move the investigation to another phase.",
            parameters: vec![
                ParamSpec::required("phase", "string", "Target phase name"),
                ParamSpec::optional("reason", "string", "Why the phase changes now"),
            ],
        },
    ]
}

pub fn plan_tool_definitions() -> Vec<ToolDefinition> {
    plan_tool_schemas()
        .iter()
        .map(ToolSchema::to_definition)
        .collect()
}

pub fn ask_user_definition() -> ToolDefinition {
    ToolSchema {
        name: ASK_USER,
        description: "Ask the user a question the repository cannot answer.",
        parameters: vec![ParamSpec::required("question", "string", "The question")],
    }
    .to_definition()
}

/// Hand-built schemas for the terminal tools, which need enums and arrays.
pub fn terminal_definition(name: &str) -> Option<ToolDefinition> {
    let (description, parameters) = match name {
        SUBMIT_COMMIT => (
            "Submit the final Conventional Commits message.",
            json!({
                "type": "object",
                "properties": {
                    "type": {
                        "type": "string",
                        "enum": crate::payloads::COMMIT_TYPES,
                        "description": "Commit type"
                    },
                    "scope": {"type": "string", "description": "Optional single-word scope"},
                    "subject": {"type": "string", "description": "Imperative summary line"},
                    "body": {"type": "string", "description": "Optional longer explanation"},
                    "breaking": {"type": "boolean", "description": "Marks a breaking change"}
                },
                "required": ["type", "subject"]
            }),
        ),
        SUBMIT_REVIEW => (
            "Submit the final code review.",
            json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string", "description": "Overall assessment"},
                    "verdict": {
                        "type": "string",
                        "enum": ["approve", "request_changes", "comment"]
                    },
                    "findings": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "file": {"type": "string"},
                                "line": {"type": "integer"},
                                "severity": {
                                    "type": "string",
                                    "enum": ["info", "minor", "major", "critical"]
                                },
                                "message": {"type": "string"}
                            },
                            "required": ["file", "severity", "message"]
                        }
                    }
                },
                "required": ["summary", "verdict"]
            }),
        ),
        SUBMIT_REPORT => (
            "Submit the final report.",
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "summary": {"type": "string"},
                    "root_cause": {"type": "string", "description": "Established root cause, if any"},
                    "evidence": {"type": "array", "items": {"type": "string"}},
                    "recommendations": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["title", "summary"]
            }),
        ),
        _ => return None,
    };
    Some(ToolDefinition {
        tool_type: "function".to_string(),
        function: FunctionDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        },
    })
}
