use crate::commands::agent::open_store;
use crate::context::RunContext;
use crate::output::{print_json, session_table};
use anyhow::Result;
use clap::Subcommand;
use devpilot_agent::{ERROR_METADATA_KEY, PhasePlanTracker, RESULT_METADATA_KEY, TerminalPayload};
use devpilot_observe::{EventTally, Observer};
use serde_json::json;

#[derive(Subcommand)]
pub enum SessionsCmd {
    /// List stored sessions, most recent first
    List,
    /// Show one session
    Show {
        id: String,
    },
    /// Delete one session
    Delete {
        id: String,
    },
    /// Delete the oldest sessions, keeping the most recent ones
    Cleanup {
        /// Sessions to keep (defaults to sessions.max_keep)
        #[arg(long)]
        keep: Option<usize>,
    },
}

pub(crate) fn run_sessions(ctx: &RunContext, command: SessionsCmd) -> Result<()> {
    let store = open_store(ctx)?;
    match command {
        SessionsCmd::List => {
            let sessions = store.list()?;
            if ctx.json {
                print_json(&sessions)?;
            } else if sessions.is_empty() {
                println!("No sessions found.");
            } else {
                println!("{}", session_table(&sessions));
            }
        }
        SessionsCmd::Show { id } => {
            let session = store.load(&id)?;
            if ctx.json {
                print_json(&session)?;
                return Ok(());
            }
            let summary = session.summary();
            println!("Session:    {}", summary.id);
            println!("Agent:      {}", summary.agent_kind);
            println!("Status:     {}", summary.status.as_deref().unwrap_or("-"));
            println!(
                "Iterations: {}/{}",
                session.iteration_count, session.max_iterations
            );
            println!("Messages:   {}", summary.message_count);
            println!(
                "Tokens:     {} prompt, {} completion",
                session.token_usage.prompt_tokens, session.token_usage.completion_tokens
            );
            println!("Created:    {}", session.created_at.to_rfc3339());
            println!("Updated:    {}", session.updated_at.to_rfc3339());
            let events = Observer::new(&ctx.workspace, &ctx.cfg.observe)?.session_events(&id)?;
            if !events.is_empty() {
                println!("Activity:   {}", EventTally::from_events(&events).render());
            }
            if let Some(plan) = &session.plan {
                println!(
                    "\n{}",
                    PhasePlanTracker::from_snapshot(plan.clone()).to_compact_summary()
                );
            }
            if let Some(err) = session.metadata.get(ERROR_METADATA_KEY) {
                println!("\nError: {err}");
            }
            if let Some(result) = session
                .metadata
                .get(RESULT_METADATA_KEY)
                .and_then(|raw| serde_json::from_str::<TerminalPayload>(raw).ok())
            {
                println!("\n{result}");
            }
        }
        SessionsCmd::Delete { id } => {
            store.delete(&id)?;
            if ctx.json {
                print_json(&json!({"deleted": id}))?;
            } else {
                println!("Deleted session {id}.");
            }
        }
        SessionsCmd::Cleanup { keep } => {
            let keep = keep.unwrap_or(ctx.cfg.sessions.max_keep);
            let deleted = store.cleanup_old(keep)?;
            if ctx.json {
                print_json(&json!({"deleted": deleted, "kept": keep}))?;
            } else {
                println!("Deleted {deleted} old session(s); keeping at most {keep}.");
            }
        }
    }
    Ok(())
}
