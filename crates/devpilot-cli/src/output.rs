use anyhow::Result;
use devpilot_agent::LoopOutcome;
use devpilot_core::{Session, SessionSummary};
use serde::Serialize;
use serde_json::{Value, json};

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub(crate) fn outcome_json(session: &Session, outcome: &LoopOutcome) -> Value {
    let result = match outcome {
        LoopOutcome::Success(payload) => serde_json::to_value(payload).unwrap_or(Value::Null),
        _ => Value::Null,
    };
    json!({
        "session_id": session.id,
        "agent": session.agent_kind,
        "outcome": outcome.name(),
        "iterations": session.iteration_count,
        "usage": session.token_usage,
        "result": result,
    })
}

/// Human-readable epilogue for runs that did not produce a result.
pub(crate) fn unfinished_text(session: &Session, outcome: &LoopOutcome) -> Option<String> {
    match outcome {
        LoopOutcome::Success(_) => None,
        LoopOutcome::Cancelled => Some(format!(
            "Cancelled after {} iterations. Resume with: devpilot resume {}",
            session.iteration_count, session.id
        )),
        LoopOutcome::IterationExceeded { iterations } => Some(format!(
            "Stopped after {iterations} iterations without a result. Resume with: devpilot resume {}",
            session.id
        )),
    }
}

pub(crate) fn session_table(sessions: &[SessionSummary]) -> String {
    let mut out = format!(
        "{:<36}  {:<7}  {:<18}  {:>5}  {}",
        "SESSION ID", "AGENT", "STATUS", "ITERS", "UPDATED"
    );
    for s in sessions {
        out.push_str(&format!(
            "\n{:<36}  {:<7}  {:<18}  {:>5}  {}",
            s.id,
            s.agent_kind.as_str(),
            s.status.as_deref().unwrap_or("-"),
            s.iteration_count,
            s.updated_at.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpilot_agent::{ReportPayload, TerminalPayload};
    use devpilot_core::AgentKind;

    #[test]
    fn success_json_carries_payload() {
        let session = Session::new(AgentKind::Report, json!({"topic": "x"}), 5);
        let outcome = LoopOutcome::Success(TerminalPayload::Report(ReportPayload {
            title: "T".to_string(),
            summary: "S".to_string(),
            root_cause: None,
            evidence: Vec::new(),
            recommendations: Vec::new(),
        }));
        let value = outcome_json(&session, &outcome);
        assert_eq!(value["outcome"], "success");
        assert_eq!(value["agent"], "report");
        assert_eq!(value["result"]["kind"], "report");
        assert_eq!(value["result"]["title"], "T");
        assert!(unfinished_text(&session, &outcome).is_none());
    }

    #[test]
    fn unfinished_runs_point_at_resume() {
        let session = Session::new(AgentKind::Debug, json!({}), 5);
        let text = unfinished_text(&session, &LoopOutcome::IterationExceeded { iterations: 5 })
            .expect("text");
        assert!(text.contains(&format!("devpilot resume {}", session.id)));
    }

    #[test]
    fn table_has_header_and_rows() {
        let session = Session::new(AgentKind::Commit, json!({}), 5);
        let table = session_table(&[session.summary()]);
        assert!(table.starts_with("SESSION ID"));
        assert_eq!(table.lines().count(), 2);
        assert!(table.contains("commit"));
    }
}
