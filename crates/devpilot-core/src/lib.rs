use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

mod config;
mod plan;

pub use config::{
    AgentLoopConfig, AppConfig, DEFAULT_ENDPOINT, DEFAULT_MAX_SESSION_BYTES, DEFAULT_MODEL,
    LlmConfig, ObserveConfig, SessionConfig, ToolsConfig,
};
pub use plan::{Phase, PhaseTransition, Plan, Task, TaskStatus};

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".devpilot")
}

/// The agent flavors a session can be started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Commit,
    Review,
    Debug,
    Report,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [
        AgentKind::Commit,
        AgentKind::Review,
        AgentKind::Debug,
        AgentKind::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Commit => "commit",
            AgentKind::Review => "review",
            AgentKind::Debug => "debug",
            AgentKind::Report => "report",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        AgentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| anyhow::anyhow!("unknown agent kind: {s}"))
    }
}

/// A fully accumulated tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments exactly as streamed by the model.
    pub arguments: String,
}

/// One incremental piece of a tool call inside a stream chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub args_chunk: Option<String>,
}

/// A message in a multi-turn conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<ToolCall>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }

    /// Text content of the message, empty for content-less assistant turns.
    pub fn text(&self) -> &str {
        match self {
            ChatMessage::System { content }
            | ChatMessage::User { content }
            | ChatMessage::Tool { content, .. } => content.as_str(),
            ChatMessage::Assistant { content, .. } => content.as_deref().unwrap_or_default(),
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            ChatMessage::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, ChatMessage::Tool { .. })
    }
}

/// Token counters reported by the completion endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }
}

/// A single chunk of a streaming chat completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallFragment>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

impl StreamChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn fragment(fragment: ToolCallFragment) -> Self {
        Self {
            tool_calls: vec![fragment],
            ..Self::default()
        }
    }

    pub fn usage(usage: TokenUsage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }
}

/// Callback invoked for every streamed chunk (used for live display).
pub type StreamCallback = Arc<dyn Fn(&StreamChunk) + Send + Sync>;

/// One declared parameter of a tool schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub param_type: &'static str,
    pub description: &'static str,
    pub required: bool,
}

impl ParamSpec {
    pub const fn required(
        name: &'static str,
        param_type: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            param_type,
            description,
            required: true,
        }
    }

    pub const fn optional(
        name: &'static str,
        param_type: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            param_type,
            description,
            required: false,
        }
    }
}

/// Declared schema of one tool: name, description and parameter map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Vec<ParamSpec>,
}

impl ToolSchema {
    pub fn to_definition(&self) -> ToolDefinition {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            properties.insert(
                param.name.to_string(),
                serde_json::json!({
                    "type": param.param_type,
                    "description": param.description,
                }),
            );
            if param.required {
                required.push(serde_json::Value::String(param.name.to_string()));
            }
        }
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: self.name.to_string(),
                description: self.description.to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }),
            },
        }
    }
}

/// A tool (function) definition sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

/// The function schema within a tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Controls how the model picks tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// "none", "auto", or "required"
    Mode(String),
}

impl ToolChoice {
    pub fn auto() -> Self {
        Self::Mode("auto".to_string())
    }

    pub fn none() -> Self {
        Self::Mode("none".to_string())
    }

    pub fn required() -> Self {
        Self::Mode("required".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature: Option<f32>,
}

/// A thread-safe cancellation token.
/// Set by the CLI (e.g. on Ctrl+C), polled by the agent loop and the stream reader.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The shared flag, for registration with signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Full resumable agent state, persisted as one JSON file per id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_kind: AgentKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Opaque request payload the session was started with.
    #[serde(default)]
    pub original_request: serde_json::Value,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub iteration_count: u64,
    pub max_iterations: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

pub const SESSION_STATUS_KEY: &str = "status";

impl Session {
    pub fn new(
        agent_kind: AgentKind,
        original_request: serde_json::Value,
        max_iterations: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            agent_kind,
            created_at: now,
            updated_at: now,
            original_request,
            messages: Vec::new(),
            plan: None,
            token_usage: TokenUsage::default(),
            iteration_count: 0,
            max_iterations,
            metadata: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> Option<&str> {
        self.metadata.get(SESSION_STATUS_KEY).map(String::as_str)
    }

    pub fn set_status(&mut self, status: &str) {
        self.metadata
            .insert(SESSION_STATUS_KEY.to_string(), status.to_string());
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            agent_kind: self.agent_kind,
            created_at: self.created_at,
            updated_at: self.updated_at,
            iteration_count: self.iteration_count,
            message_count: self.messages.len(),
            status: self.status().map(ToString::to_string),
        }
    }
}

/// Lightweight listing entry for a stored session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub agent_kind: AgentKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub iteration_count: u64,
    pub message_count: usize,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub at: DateTime<Utc>,
    pub session_id: String,
    pub kind: EventKind,
}

impl EventEnvelope {
    pub fn now(session_id: &str, kind: EventKind) -> Self {
        Self {
            at: Utc::now(),
            session_id: session_id.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    IterationStarted {
        iteration: u64,
    },
    ModelRetry {
        attempt: u8,
        error: String,
        delay_ms: u64,
    },
    ToolDispatched {
        name: String,
        is_error: bool,
        terminal: bool,
    },
    PlanChanged {
        changes: Vec<String>,
    },
    HistoryCompressed {
        before: usize,
        after: usize,
        strategy: String,
    },
    LoopFinished {
        outcome: String,
        iterations: u64,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::IterationStarted { .. } => "iteration_started",
            EventKind::ModelRetry { .. } => "model_retry",
            EventKind::ToolDispatched { .. } => "tool_dispatched",
            EventKind::PlanChanged { .. } => "plan_changed",
            EventKind::HistoryCompressed { .. } => "history_compressed",
            EventKind::LoopFinished { .. } => "loop_finished",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_serializes_with_role_tag() {
        let msg = ChatMessage::Assistant {
            content: None,
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: "read_file".to_string(),
                arguments: r#"{"path":"a.rs"}"#.to_string(),
            }],
        };
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["role"], "assistant");
        assert!(value.get("content").is_none());
        assert_eq!(value["tool_calls"][0]["name"], "read_file");

        let back: ChatMessage = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, msg);
    }

    #[test]
    fn agent_kind_parses_case_insensitively() {
        assert_eq!("Debug".parse::<AgentKind>().expect("parse"), AgentKind::Debug);
        assert!("deploy".parse::<AgentKind>().is_err());
    }

    #[test]
    fn unknown_agent_kind_fails_to_deserialize() {
        let err = serde_json::from_str::<AgentKind>(r#""deploy""#);
        assert!(err.is_err());
    }

    #[test]
    fn tool_schema_renders_required_parameters() {
        let schema = ToolSchema {
            name: "read_file",
            description: "Read a file",
            parameters: vec![
                ParamSpec::required("path", "string", "Workspace-relative path"),
                ParamSpec::optional("start_line", "integer", "First line"),
            ],
        };
        let def = schema.to_definition();
        assert_eq!(def.tool_type, "function");
        assert_eq!(def.function.name, "read_file");
        assert_eq!(def.function.parameters["required"], serde_json::json!(["path"]));
        assert_eq!(
            def.function.parameters["properties"]["start_line"]["type"],
            "integer"
        );
    }

    #[test]
    fn token_usage_add_saturates() {
        let mut total = TokenUsage {
            prompt_tokens: u64::MAX,
            completion_tokens: 1,
            total_tokens: 2,
        };
        total.add(&TokenUsage {
            prompt_tokens: 5,
            completion_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(total.prompt_tokens, u64::MAX);
        assert_eq!(total.completion_tokens, 3);
        assert_eq!(total.total_tokens, 5);
    }

    #[test]
    fn cancellation_token_is_shared_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(token.flag().load(Ordering::SeqCst));
    }

    #[test]
    fn session_summary_reflects_status_metadata() {
        let mut session = Session::new(AgentKind::Review, serde_json::json!({"base":"main"}), 10);
        session.messages.push(ChatMessage::user("review"));
        session.set_status("success");
        let summary = session.summary();
        assert_eq!(summary.message_count, 1);
        assert_eq!(summary.status.as_deref(), Some("success"));
        assert_eq!(summary.agent_kind, AgentKind::Review);
    }
}
