//! Scripted collaborators for exercising the agent loop without a network
//! or a real repository.

use anyhow::{Result, anyhow};
use devpilot_core::{
    CancellationToken, ChatRequest, StreamChunk, TokenUsage, ToolCallFragment, ToolDefinition,
    ToolSchema,
};
use devpilot_llm::{ChatClient, ChunkStream, LlmError, Summarizer};
use devpilot_tools::{ToolHost, ToolInput, workspace_tool_schemas};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One scripted model turn.
pub enum Step {
    /// A stream that yields every chunk and ends normally.
    Reply(Vec<StreamChunk>),
    /// `stream_chat` itself fails.
    Fail(LlmError),
    /// The stream yields the chunks, then breaks with the error.
    BreakAfter(Vec<StreamChunk>, LlmError),
}

/// A [`ChatClient`] that replays scripted steps and records every request.
pub struct ScriptedClient {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(VecDeque::from(steps)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(replies: Vec<Vec<StreamChunk>>) -> Self {
        Self::new(replies.into_iter().map(Step::Reply).collect())
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().map(|s| s.len()).unwrap_or_default()
    }
}

impl ChatClient for ScriptedClient {
    fn stream_chat(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(req.clone());
        }
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let step = self
            .steps
            .lock()
            .ok()
            .and_then(|mut steps| steps.pop_front());
        match step {
            Some(Step::Reply(chunks)) => Ok(Box::new(chunks.into_iter().map(Ok))),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::BreakAfter(chunks, err)) => Ok(Box::new(
                chunks
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(err))),
            )),
            None => Err(LlmError::Status {
                status: 400,
                message: "no more scripted responses".to_string(),
                retry_after: None,
            }),
        }
    }
}

/// Usage counters reported by every scripted reply.
pub const SCRIPTED_USAGE: TokenUsage = TokenUsage {
    prompt_tokens: 100,
    completion_tokens: 20,
    total_tokens: 120,
};

/// A plain-text reply split into two content chunks plus a usage chunk.
pub fn text_reply(text: &str) -> Vec<StreamChunk> {
    let mid = text
        .char_indices()
        .nth(text.chars().count() / 2)
        .map_or(text.len(), |(i, _)| i);
    let (head, tail) = text.split_at(mid);
    let mut chunks = vec![StreamChunk::content(head)];
    if !tail.is_empty() {
        chunks.push(StreamChunk::content(tail));
    }
    chunks.push(StreamChunk {
        finish_reason: Some("stop".to_string()),
        ..StreamChunk::usage(SCRIPTED_USAGE)
    });
    chunks
}

/// A reply carrying tool calls. Each call's name arrives in its own fragment
/// and the arguments are split across two further fragments.
pub fn tool_call_reply(calls: &[(&str, &str, &str)]) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    for (index, (id, name, args)) in calls.iter().enumerate() {
        chunks.push(StreamChunk::fragment(ToolCallFragment {
            index,
            id: Some((*id).to_string()),
            name: Some((*name).to_string()),
            args_chunk: None,
        }));
        let mid = args
            .char_indices()
            .nth(args.chars().count() / 2)
            .map_or(args.len(), |(i, _)| i);
        let (head, tail) = args.split_at(mid);
        for part in [head, tail] {
            chunks.push(StreamChunk::fragment(ToolCallFragment {
                index,
                id: None,
                name: Some(String::new()),
                args_chunk: Some(part.to_string()),
            }));
        }
    }
    chunks.push(StreamChunk {
        finish_reason: Some("tool_calls".to_string()),
        ..StreamChunk::usage(SCRIPTED_USAGE)
    });
    chunks
}

/// Shorthand for a single-call [`tool_call_reply`].
pub fn single_call(id: &str, name: &str, args: serde_json::Value) -> Vec<StreamChunk> {
    tool_call_reply(&[(id, name, &args.to_string())])
}

/// Summarizer returning a fixed text and counting invocations.
pub struct FixedSummarizer {
    text: String,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl FixedSummarizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Summarizer for FixedSummarizer {
    fn summarize(&self, _cancel: &CancellationToken, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        Ok(self.text.clone())
    }
}

/// Summarizer that always fails, forcing the heuristic fallback.
#[derive(Default)]
pub struct FailingSummarizer {
    calls: AtomicUsize,
}

impl FailingSummarizer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Summarizer for FailingSummarizer {
    fn summarize(&self, _cancel: &CancellationToken, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("summarizer unavailable"))
    }
}

/// Tool host with canned results per tool name. Unscripted tools answer
/// `ok: <name>`.
#[derive(Default)]
pub struct MockToolHost {
    results: HashMap<&'static str, std::result::Result<String, String>>,
    executed: Mutex<Vec<ToolInput>>,
}

impl MockToolHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, tool: &'static str, output: impl Into<String>) -> Self {
        self.results.insert(tool, Ok(output.into()));
        self
    }

    pub fn with_error(mut self, tool: &'static str, message: impl Into<String>) -> Self {
        self.results.insert(tool, Err(message.into()));
        self
    }

    pub fn executed(&self) -> Vec<ToolInput> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ToolHost for MockToolHost {
    fn definitions(&self) -> Vec<ToolDefinition> {
        workspace_tool_schemas()
            .iter()
            .map(ToolSchema::to_definition)
            .collect()
    }

    fn execute(&self, input: &ToolInput) -> Result<String> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(input.clone());
        }
        match self.results.get(input.name()) {
            Some(Ok(output)) => Ok(output.clone()),
            Some(Err(message)) => Err(anyhow!("{message}")),
            None => Ok(format!("ok: {}", input.name())),
        }
    }
}

/// A throwaway workspace seeded with a tiny source tree.
pub fn temp_workspace() -> Result<tempfile::TempDir> {
    let dir = tempfile::tempdir()?;
    seed_workspace(dir.path())?;
    Ok(dir)
}

fn seed_workspace(root: &Path) -> Result<()> {
    std::fs::create_dir_all(root.join("src"))?;
    std::fs::write(
        root.join("src/lib.rs"),
        "pub fn add(a: i32, b: i32) -> i32 {\n    a - b\n}\n",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpilot_core::ChatMessage;
    use devpilot_llm::StreamAggregator;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "scripted".to_string(),
            messages: vec![ChatMessage::user("hi")],
            tools: Vec::new(),
            tool_choice: devpilot_core::ToolChoice::auto(),
            max_tokens: 64,
            temperature: None,
        }
    }

    #[test]
    fn tool_call_reply_aggregates_back_to_calls() {
        let client = ScriptedClient::replies(vec![tool_call_reply(&[
            ("call_1", "read_file", r#"{"path":"src/lib.rs"}"#),
            ("call_2", "git_status", "{}"),
        ])]);
        let stream = client
            .stream_chat(&request(), &CancellationToken::new())
            .expect("stream");
        let out = StreamAggregator::new()
            .consume(stream, None)
            .expect("aggregate");
        assert_eq!(out.tool_calls().len(), 2);
        assert_eq!(out.tool_calls()[0].arguments, r#"{"path":"src/lib.rs"}"#);
        assert_eq!(out.tool_calls()[1].name, "git_status");
        assert_eq!(out.usage, SCRIPTED_USAGE);
        assert_eq!(client.call_count(), 1);
    }

    #[test]
    fn exhausted_script_fails_without_retry() {
        let client = ScriptedClient::new(Vec::new());
        let err = client
            .stream_chat(&request(), &CancellationToken::new())
            .err()
            .expect("exhausted");
        assert!(!err.is_retryable());
    }

    #[test]
    fn mock_host_records_inputs() {
        let host = MockToolHost::new().with_error("git_diff", "not a repository");
        assert_eq!(
            host.execute(&ToolInput::GitStatus).expect("status"),
            "ok: git_status"
        );
        let diff = ToolInput::decode("git_diff", "{}").expect("known").expect("decode");
        assert!(host.execute(&diff).is_err());
        assert_eq!(host.executed().len(), 2);
    }
}
