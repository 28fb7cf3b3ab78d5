//! Agent orchestration: the iteration loop and the pieces it drives.

pub mod agent_loop;
pub mod compression;
pub mod dispatcher;
pub mod fallback;
pub mod flavors;
pub mod payloads;
pub mod plan_tracker;
pub mod prompts;
pub mod transforms;

pub use agent_loop::{
    AgentError, AgentLoop, ERROR_METADATA_KEY, ExtendCallback, LoopOutcome, LoopState,
    RESULT_METADATA_KEY, Termination,
};
pub use compression::{Compression, CompressionStrategy, HistoryCompressor};
pub use dispatcher::{DispatchOutcome, FeedbackCallback, ToolArgs, ToolDecodeError, ToolDispatcher};
pub use flavors::AgentFlavor;
pub use payloads::{
    CommitMessage, Finding, ReportPayload, ReviewReport, Severity, TerminalPayload, Verdict,
};
pub use plan_tracker::{PhasePlanTracker, PlanChange};
