use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed, ordered phases of a debugging session.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    ProblemDefinition,
    ImpactAnalysis,
    RootCauseHypothesis,
    InvestigationPlan,
    Execution,
    Verification,
    Reporting,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::ProblemDefinition,
        Phase::ImpactAnalysis,
        Phase::RootCauseHypothesis,
        Phase::InvestigationPlan,
        Phase::Execution,
        Phase::Verification,
        Phase::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::ProblemDefinition => "problem_definition",
            Phase::ImpactAnalysis => "impact_analysis",
            Phase::RootCauseHypothesis => "root_cause_hypothesis",
            Phase::InvestigationPlan => "investigation_plan",
            Phase::Execution => "execution",
            Phase::Verification => "verification",
            Phase::Reporting => "reporting",
        }
    }

    /// 1-based position in the phase sequence.
    pub fn position(&self) -> usize {
        Phase::ALL
            .iter()
            .position(|phase| phase == self)
            .map_or(0, |idx| idx + 1)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == wanted)
            .ok_or_else(|| anyhow::anyhow!("unknown phase: {s}"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Skipped => "skipped",
        }
    }

    /// Completed and skipped tasks carry a `completed_at` stamp.
    pub fn is_closed(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" | "done" => Ok(TaskStatus::Completed),
            "skipped" => Ok(TaskStatus::Skipped),
            _ => Err(anyhow::anyhow!("unknown task status: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Persisted form of a task list plus phase state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub current_phase: Phase,
    #[serde(default)]
    pub phase_history: Vec<PhaseTransition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_order_is_fixed() {
        assert!(Phase::ProblemDefinition < Phase::Reporting);
        assert_eq!(Phase::ProblemDefinition.position(), 1);
        assert_eq!(Phase::Reporting.position(), 7);
        assert_eq!(
            "root cause hypothesis".parse::<Phase>().expect("parse"),
            Phase::RootCauseHypothesis
        );
    }

    #[test]
    fn task_status_parses_aliases() {
        assert_eq!("done".parse::<TaskStatus>().expect("parse"), TaskStatus::Completed);
        assert_eq!(
            "in-progress".parse::<TaskStatus>().expect("parse"),
            TaskStatus::InProgress
        );
        assert!("blocked".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Skipped.is_closed());
        assert!(!TaskStatus::InProgress.is_closed());
    }
}
