use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use devpilot_core::AgentKind;
use serde_json::json;
use std::process::ExitCode;

mod commands;
mod context;
mod output;
mod util;

use commands::agent::{run_agent, run_resume};
use commands::sessions::{SessionsCmd, run_sessions};
use context::RunContext;

#[derive(Parser)]
#[command(name = "devpilot")]
#[command(
    about = "Repository agent: commit messages, code review, debugging and reports",
    long_about = None
)]
struct Cli {
    /// Emit machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Log agent activity to stderr
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Override llm.model for this run
    #[arg(long, global = true)]
    model: Option<String>,

    /// Override agent_loop.max_iterations for this run
    #[arg(long = "max-iterations", global = true)]
    max_iterations: Option<u64>,

    /// Never prompt: no iteration extensions, no answers to ask_user
    #[arg(long = "no-input", global = true)]
    no_input: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a Conventional Commits message for the current changes
    Commit(CommitArgs),
    /// Review the working tree or a branch against a base ref
    Review(ReviewArgs),
    /// Investigate a defect and report its root cause
    Debug(DebugArgs),
    /// Write a technical report on a topic
    Report(ReportArgs),
    /// Continue a stored session
    Resume {
        /// Session id (see `devpilot sessions list`)
        id: String,
    },
    /// Inspect and prune stored sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCmd,
    },
}

#[derive(Args)]
struct CommitArgs {
    /// Run `git commit` with the generated message
    #[arg(long)]
    apply: bool,
    /// Extra context for the message
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Args)]
struct ReviewArgs {
    /// Base ref to diff against; defaults to the uncommitted changes
    #[arg(long)]
    base: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Args)]
struct DebugArgs {
    /// Description of the problem
    issue: String,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Args)]
struct ReportArgs {
    /// What the report should cover
    topic: String,
    #[arg(long)]
    notes: Option<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;
    let ctx = RunContext::load(
        &cwd,
        context::Overrides {
            json: cli.json,
            verbose: cli.verbose,
            model: cli.model,
            max_iterations: cli.max_iterations,
            no_input: cli.no_input,
        },
    )?;

    match cli.command {
        Commands::Commit(args) => run_agent(
            &ctx,
            AgentKind::Commit,
            json!({"notes": args.notes}),
            args.apply,
        ),
        Commands::Review(args) => run_agent(
            &ctx,
            AgentKind::Review,
            json!({"base": args.base, "notes": args.notes}),
            false,
        ),
        Commands::Debug(args) => run_agent(
            &ctx,
            AgentKind::Debug,
            json!({"issue": args.issue, "notes": args.notes}),
            false,
        ),
        Commands::Report(args) => run_agent(
            &ctx,
            AgentKind::Report,
            json!({"topic": args.topic, "notes": args.notes}),
            false,
        ),
        Commands::Resume { id } => run_resume(&ctx, &id),
        Commands::Sessions { command } => run_sessions(&ctx, command).map(|()| ExitCode::SUCCESS),
    }
}
