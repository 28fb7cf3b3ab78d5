use crate::context::RunContext;
use crate::output::{outcome_json, print_json, unfinished_text};
use crate::util::{git_commit, install_interrupt_handler, prompt_line, prompt_yes_no};
use anyhow::{Result, anyhow};
use devpilot_agent::{AgentLoop, LoopOutcome, TerminalPayload};
use devpilot_core::{AgentKind, CancellationToken, Session, StreamChunk};
use devpilot_llm::{ChatSummarizer, OpenAiCompatClient, RetryPolicy};
use devpilot_observe::Observer;
use devpilot_store::SessionStore;
use devpilot_tools::{LocalToolHost, ToolHost};
use serde_json::{Value, json};
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

const EXIT_ITERATIONS_EXCEEDED: u8 = 3;
const EXIT_CANCELLED: u8 = 130;

pub(crate) fn run_agent(
    ctx: &RunContext,
    kind: AgentKind,
    request: Value,
    apply: bool,
) -> Result<ExitCode> {
    let session = Session::new(kind, request, ctx.cfg.agent_loop.max_iterations);
    drive(ctx, session, false, apply)
}

pub(crate) fn run_resume(ctx: &RunContext, id: &str) -> Result<ExitCode> {
    let store = open_store(ctx)?;
    let session = store.load(id)?;
    drive(ctx, session, true, false)
}

pub(crate) fn open_store(ctx: &RunContext) -> Result<SessionStore> {
    Ok(SessionStore::new(&ctx.workspace)?.with_max_bytes(ctx.cfg.sessions.max_session_bytes))
}

fn drive(ctx: &RunContext, mut session: Session, resume: bool, apply: bool) -> Result<ExitCode> {
    let observer = Observer::new(&ctx.workspace, &ctx.cfg.observe)?;
    let store = open_store(ctx)?;
    let client = OpenAiCompatClient::new(ctx.cfg.llm.clone())?;
    let summarizer = ChatSummarizer::new(
        &client,
        ctx.cfg.llm.summary_model(),
        ctx.cfg.llm.max_tokens,
    )
    .with_retry(RetryPolicy::from_config(&ctx.cfg.llm));
    let host: Arc<dyn ToolHost + Send + Sync> =
        Arc::new(LocalToolHost::new(&ctx.workspace, &ctx.cfg.tools));

    let cancel = CancellationToken::new();
    install_interrupt_handler(&cancel)?;

    let mut agent = AgentLoop::new(
        &client,
        host,
        session.agent_kind,
        &ctx.cfg.llm,
        ctx.cfg.agent_loop.clone(),
    )
    .with_summarizer(&summarizer)
    .with_observer(&observer)
    .with_store(&store)
    .with_cancel(cancel);

    if observer.is_verbose() && !ctx.json {
        agent = agent.on_chunk(Arc::new(|chunk: &StreamChunk| {
            if let Some(text) = &chunk.content {
                eprint!("{text}");
                let _ = std::io::stderr().flush();
            }
        }));
    }
    if ctx.interactive {
        agent = agent
            .on_extend(Arc::new(|used: u64| {
                prompt_yes_no(&format!(
                    "The agent has used {used} iterations without finishing. Continue?"
                ))
                .unwrap_or(false)
            }))
            .on_feedback(Arc::new(|question: &str| {
                prompt_line(&format!("\nThe agent asks: {question}\n> "))
                    .ok()
                    .filter(|answer| !answer.is_empty())
            }));
    }

    observer.verbose_log(&format!(
        "{} session {} ({})",
        if resume { "resuming" } else { "starting" },
        session.id,
        session.agent_kind
    ));
    let result = if resume {
        agent.resume(&mut session)
    } else {
        agent.run(&mut session)
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            if ctx.json {
                print_json(&json!({
                    "session_id": session.id,
                    "outcome": "error",
                    "error": err.to_string(),
                }))?;
                return Ok(ExitCode::FAILURE);
            }
            return Err(anyhow!("{err} (session {})", session.id));
        }
    };

    let committed = match (&outcome, apply) {
        (LoopOutcome::Success(TerminalPayload::Commit(msg)), true) => Some(git_commit(
            &ctx.workspace,
            &msg.render(),
            Duration::from_secs(ctx.cfg.tools.git_timeout_seconds),
        )?),
        _ => None,
    };

    if ctx.json {
        let mut value = outcome_json(&session, &outcome);
        if let Some(out) = &committed {
            value["committed"] = json!(out);
        }
        print_json(&value)?;
    } else if let Some(text) = unfinished_text(&session, &outcome) {
        eprintln!("{text}");
    } else if let LoopOutcome::Success(payload) = &outcome {
        println!("{payload}");
        if let Some(out) = committed {
            eprintln!("\n{out}");
        }
    }

    Ok(match outcome {
        LoopOutcome::Success(_) => ExitCode::SUCCESS,
        LoopOutcome::Cancelled => ExitCode::from(EXIT_CANCELLED),
        LoopOutcome::IterationExceeded { .. } => ExitCode::from(EXIT_ITERATIONS_EXCEEDED),
    })
}
