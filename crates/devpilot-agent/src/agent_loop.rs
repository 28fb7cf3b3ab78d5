//! The iteration driver: stream a model response, dispatch its tool calls,
//! compress history when it grows, and stop on a terminal result,
//! cancellation, or an exhausted iteration budget.

use crate::compression::{CompressionStrategy, HistoryCompressor};
use crate::dispatcher::{FeedbackCallback, ToolDispatcher};
use crate::flavors::AgentFlavor;
use crate::payloads::TerminalPayload;
use crate::plan_tracker::PhasePlanTracker;
use crate::prompts;
use crate::transforms::{
    TransformPipeline, drop_consecutive_duplicates, inject_progress_context,
    truncate_tool_results,
};
use devpilot_core::{
    AgentKind, AgentLoopConfig, CancellationToken, ChatMessage, ChatRequest, EventKind, LlmConfig,
    Session, StreamCallback, ToolCall, ToolChoice, ToolDefinition,
};
use devpilot_llm::{AggregatedResponse, ChatClient, LlmError, RetryPolicy, StreamAggregator, Summarizer};
use devpilot_observe::Observer;
use devpilot_store::SessionStore;
use devpilot_tools::ToolHost;
use std::sync::Arc;
use thiserror::Error;

/// Asked once the iteration budget is spent, with the iterations used so
/// far. Returning true grants another `extension_iterations`.
pub type ExtendCallback = Arc<dyn Fn(u64) -> bool + Send + Sync>;

pub const RESULT_METADATA_KEY: &str = "result";
pub const ERROR_METADATA_KEY: &str = "error";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model call failed: {0}")]
    Model(#[from] LlmError),
    #[error("the {kind} agent must answer with a tool call, but replied with text only")]
    ProtocolViolation { kind: AgentKind },
    #[error("agent loop has already terminated")]
    AlreadyTerminated,
    #[error("session {0} has no history to resume")]
    NothingToResume(String),
    #[error("session is for the {session} agent, but this loop runs the {flavor} agent")]
    KindMismatch { session: AgentKind, flavor: AgentKind },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Success(TerminalPayload),
    Cancelled,
    IterationExceeded { iterations: u64 },
}

impl LoopOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            LoopOutcome::Success(_) => "success",
            LoopOutcome::Cancelled => "cancelled",
            LoopOutcome::IterationExceeded { .. } => "iteration_exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Error,
    Cancelled,
    IterationExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    AwaitingStream,
    DispatchingTools,
    Compressing,
    /// Absorbing: a terminated loop never runs again.
    Terminated(Termination),
}

pub struct AgentLoop<'a> {
    llm: &'a (dyn ChatClient + Send + Sync),
    dispatcher: ToolDispatcher,
    flavor: AgentFlavor,
    tools: Vec<ToolDefinition>,
    cfg: AgentLoopConfig,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    retry: RetryPolicy,
    summarizer: Option<&'a (dyn Summarizer + Send + Sync)>,
    observer: Option<&'a Observer>,
    store: Option<&'a SessionStore>,
    cancel: CancellationToken,
    stream_cb: Option<StreamCallback>,
    extend_cb: Option<ExtendCallback>,
    plan: PhasePlanTracker,
    state: LoopState,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        llm: &'a (dyn ChatClient + Send + Sync),
        tool_host: Arc<dyn ToolHost + Send + Sync>,
        kind: AgentKind,
        llm_cfg: &LlmConfig,
        cfg: AgentLoopConfig,
    ) -> Self {
        let flavor = AgentFlavor::for_kind(kind);
        let tools = flavor.tool_definitions(tool_host.as_ref());
        Self {
            llm,
            dispatcher: ToolDispatcher::new(tool_host),
            flavor,
            tools,
            cfg,
            model: llm_cfg.model.clone(),
            max_tokens: llm_cfg.max_tokens,
            temperature: llm_cfg.temperature,
            retry: RetryPolicy::from_config(llm_cfg),
            summarizer: None,
            observer: None,
            store: None,
            cancel: CancellationToken::new(),
            stream_cb: None,
            extend_cb: None,
            plan: PhasePlanTracker::new(),
            state: LoopState::Running,
        }
    }

    /// Enables semantic compression (unless disabled in config).
    pub fn with_summarizer(mut self, summarizer: &'a (dyn Summarizer + Send + Sync)) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_observer(mut self, observer: &'a Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Persist the session at every terminal state.
    pub fn with_store(mut self, store: &'a SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn on_chunk(mut self, cb: StreamCallback) -> Self {
        self.stream_cb = Some(cb);
        self
    }

    pub fn on_extend(mut self, cb: ExtendCallback) -> Self {
        self.extend_cb = Some(cb);
        self
    }

    pub fn on_feedback(mut self, cb: FeedbackCallback) -> Self {
        self.dispatcher = self.dispatcher.with_feedback(cb);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Drive `session` to a terminal state. A fresh session gets the system
    /// prompt and request message; a session with history continues from it.
    pub fn run(&mut self, session: &mut Session) -> Result<LoopOutcome, AgentError> {
        if matches!(self.state, LoopState::Terminated(_)) {
            return Err(AgentError::AlreadyTerminated);
        }
        if session.agent_kind != self.flavor.kind {
            return Err(AgentError::KindMismatch {
                session: session.agent_kind,
                flavor: self.flavor.kind,
            });
        }
        if session.messages.is_empty() {
            session.messages.push(ChatMessage::system(self.flavor.system_prompt()));
            session.messages.push(ChatMessage::user(prompts::request_message(
                session.agent_kind,
                &session.original_request,
            )));
        }
        self.plan = PhasePlanTracker::from_snapshot(session.plan.clone().unwrap_or_default());
        session.set_status("running");
        session.metadata.remove(ERROR_METADATA_KEY);

        let result = self.drive(session);
        self.finalize(session, &result);
        result
    }

    /// Continue a loaded session. A session that stopped on its iteration
    /// budget is granted one extension first.
    pub fn resume(&mut self, session: &mut Session) -> Result<LoopOutcome, AgentError> {
        if session.messages.is_empty() {
            return Err(AgentError::NothingToResume(session.id.clone()));
        }
        if session.status() == Some("success") {
            return Err(AgentError::AlreadyTerminated);
        }
        if session.iteration_count >= session.max_iterations {
            session.max_iterations = session.iteration_count + self.cfg.extension_iterations.max(1);
        }
        self.verbose(&format!(
            "resuming session {} at iteration {}/{}",
            session.id, session.iteration_count, session.max_iterations
        ));
        self.run(session)
    }

    fn drive(&mut self, session: &mut Session) -> Result<LoopOutcome, AgentError> {
        loop {
            self.state = LoopState::Running;
            if self.cancel.is_cancelled() {
                return Ok(LoopOutcome::Cancelled);
            }
            if session.iteration_count >= session.max_iterations && !self.offer_extension(session) {
                return Ok(LoopOutcome::IterationExceeded {
                    iterations: session.iteration_count,
                });
            }
            self.emit(
                &session.id,
                EventKind::IterationStarted {
                    iteration: session.iteration_count + 1,
                },
            );

            self.state = LoopState::AwaitingStream;
            let response = match self.call_model(session) {
                Ok(response) => response,
                Err(err) if err.is_cancelled() => return Ok(LoopOutcome::Cancelled),
                Err(err) => return Err(AgentError::Model(err)),
            };
            session.token_usage.add(&response.usage);
            let calls: Vec<ToolCall> = response.tool_calls().to_vec();
            let text = response.text().to_string();
            session.messages.push(response.message);
            session.iteration_count += 1;

            if calls.is_empty() {
                if self.flavor.tool_mandatory {
                    if let Some(payload) = self.flavor.fallback(&text) {
                        self.verbose("recovered a result from the plain-text reply");
                        return Ok(LoopOutcome::Success(payload));
                    }
                    return Err(AgentError::ProtocolViolation {
                        kind: self.flavor.kind,
                    });
                }
                session.messages.push(ChatMessage::user(self.flavor.nudge()));
            } else {
                self.state = LoopState::DispatchingTools;
                if let Some(payload) = self.dispatch_all(session, &calls) {
                    return Ok(LoopOutcome::Success(payload));
                }
            }
            self.sync_plan(session);

            if session.messages.len() > self.cfg.compress_threshold {
                self.state = LoopState::Compressing;
                self.compress(session);
            }
        }
    }

    fn offer_extension(&self, session: &mut Session) -> bool {
        let granted = self
            .extend_cb
            .as_ref()
            .is_some_and(|ask| ask(session.iteration_count));
        if granted {
            session.max_iterations += self.cfg.extension_iterations.max(1);
            self.verbose(&format!(
                "iteration budget extended to {}",
                session.max_iterations
            ));
        }
        granted
    }

    fn build_request(&self, session: &Session) -> ChatRequest {
        let mut context = format!(
            "Iteration {}/{}",
            session.iteration_count + 1,
            session.max_iterations
        );
        if self.flavor.plan_tools {
            context.push('\n');
            context.push_str(&self.plan.to_compact_summary());
        }
        let pipeline = TransformPipeline::new()
            .then("progress_context", inject_progress_context(context))
            .then(
                "truncate_tool_results",
                truncate_tool_results(self.cfg.max_tool_result_chars),
            )
            .then("drop_consecutive_duplicates", drop_consecutive_duplicates());
        ChatRequest {
            model: self.model.clone(),
            messages: pipeline.apply(&session.messages),
            tools: self.tools.clone(),
            tool_choice: ToolChoice::auto(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    fn call_model(&self, session: &Session) -> Result<AggregatedResponse, LlmError> {
        let request = self.build_request(session);
        self.retry.run(
            &self.cancel,
            |_attempt| {
                let stream = self.llm.stream_chat(&request, &self.cancel)?;
                StreamAggregator::new().consume(stream, self.stream_cb.as_ref())
            },
            |attempt, err, delay| {
                self.emit(
                    &session.id,
                    EventKind::ModelRetry {
                        attempt: attempt.saturating_add(1),
                        error: err.to_string(),
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    },
                );
            },
        )
    }

    /// Dispatch every call in order and answer each one. Returns the
    /// winning terminal payload, if any call produced one.
    fn dispatch_all(&mut self, session: &mut Session, calls: &[ToolCall]) -> Option<TerminalPayload> {
        let before = self.plan.clone();
        let mut winner: Option<(usize, TerminalPayload)> = None;
        for call in calls {
            let outcome = self.dispatcher.dispatch(call, &self.flavor, &mut self.plan);
            self.emit(
                &session.id,
                EventKind::ToolDispatched {
                    name: call.name.clone(),
                    is_error: outcome.is_error(),
                    terminal: outcome.is_terminal(),
                },
            );
            if let Some(err) = &outcome.error {
                self.verbose(&format!("tool {} failed: {err}", call.name));
            }
            session
                .messages
                .push(ChatMessage::tool_result(call.id.clone(), outcome.content));
            if let Some(payload) = outcome.terminal {
                let rank = self.flavor.terminal_rank(&call.name).unwrap_or(usize::MAX);
                if winner.as_ref().is_none_or(|(best, _)| rank < *best) {
                    winner = Some((rank, payload));
                }
            }
        }

        let changes = self.plan.diff(&before);
        if !changes.is_empty() {
            self.emit(
                &session.id,
                EventKind::PlanChanged {
                    changes: changes.iter().map(ToString::to_string).collect(),
                },
            );
        }
        winner.map(|(_, payload)| payload)
    }

    fn compress(&self, session: &mut Session) {
        let summarizer = self.summarizer.filter(|_| self.cfg.semantic_compression);
        let before = session.messages.len();
        let compression = HistoryCompressor::new(summarizer).compress(
            &session.messages,
            self.cfg.keep_recent,
            &self.cancel,
        );
        if compression.strategy == CompressionStrategy::Skipped {
            return;
        }
        session.messages = compression.messages;
        self.emit(
            &session.id,
            EventKind::HistoryCompressed {
                before,
                after: session.messages.len(),
                strategy: compression.strategy.as_str().to_string(),
            },
        );
    }

    fn sync_plan(&self, session: &mut Session) {
        if self.flavor.plan_tools || !self.plan.is_empty() {
            session.plan = Some(self.plan.snapshot());
        }
    }

    fn finalize(&mut self, session: &mut Session, result: &Result<LoopOutcome, AgentError>) {
        self.sync_plan(session);
        let (status, termination) = match result {
            Ok(LoopOutcome::Success(payload)) => {
                if let Ok(json) = serde_json::to_string(payload) {
                    session.metadata.insert(RESULT_METADATA_KEY.to_string(), json);
                }
                ("success", Termination::Success)
            }
            Ok(LoopOutcome::Cancelled) => ("cancelled", Termination::Cancelled),
            Ok(LoopOutcome::IterationExceeded { .. }) => {
                ("iteration_exceeded", Termination::IterationExceeded)
            }
            Err(err) => {
                session
                    .metadata
                    .insert(ERROR_METADATA_KEY.to_string(), err.to_string());
                ("error", Termination::Error)
            }
        };
        session.set_status(status);
        self.state = LoopState::Terminated(termination);
        self.emit(
            &session.id,
            EventKind::LoopFinished {
                outcome: status.to_string(),
                iterations: session.iteration_count,
            },
        );

        if let Some(store) = self.store
            && let Err(err) = store.save(session)
        {
            self.warn(&format!("failed to persist session {}: {err}", session.id));
        }
    }

    fn emit(&self, session_id: &str, kind: EventKind) {
        let Some(observer) = self.observer else {
            return;
        };
        if let Err(err) = observer.record(session_id, kind) {
            observer.warn_log(&format!("failed to record event: {err}"));
        }
    }

    fn verbose(&self, msg: &str) {
        if let Some(observer) = self.observer {
            observer.verbose_log(msg);
        }
    }

    fn warn(&self, msg: &str) {
        if let Some(observer) = self.observer {
            observer.warn_log(msg);
        }
    }
}
