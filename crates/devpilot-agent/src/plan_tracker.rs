//! Explicit task list plus the seven-phase investigation state machine.
//!
//! The tracker is a plain value owned by one agent run. Tools mutate it
//! only through the methods below, and the loop snapshots it (deep copy)
//! before each round of dispatch so [`PhasePlanTracker::diff`] can report
//! what changed.

use chrono::Utc;
use devpilot_core::{Phase, PhaseTransition, Plan, Task, TaskStatus};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhasePlanTracker {
    plan: Plan,
}

/// One observed difference between two tracker states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanChange {
    TaskAdded { id: String },
    TaskRemoved { id: String },
    StatusChanged {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    PhaseChanged { from: Phase, to: Phase },
}

impl fmt::Display for PlanChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanChange::TaskAdded { id } => write!(f, "task added: {id}"),
            PlanChange::TaskRemoved { id } => write!(f, "task removed: {id}"),
            PlanChange::StatusChanged { id, from, to } => {
                write!(f, "task {id}: {from} -> {to}")
            }
            PlanChange::PhaseChanged { from, to } => write!(f, "phase: {from} -> {to}"),
        }
    }
}

impl PhasePlanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(plan: Plan) -> Self {
        Self { plan }
    }

    pub fn snapshot(&self) -> Plan {
        self.plan.clone()
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn current_phase(&self) -> Phase {
        self.plan.current_phase
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.plan.tasks.iter().find(|task| task.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.plan.tasks.is_empty() && self.plan.phase_history.is_empty()
    }

    /// Append a pending task. Returns false, leaving the plan untouched,
    /// when `id` is already taken.
    pub fn add_task(&mut self, id: &str, description: &str) -> bool {
        if self.task(id).is_some() {
            return false;
        }
        self.plan.tasks.push(Task {
            id: id.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        });
        true
    }

    /// Returns whether the status changed. `completed_at` is stamped when the
    /// task closes and cleared if it is reopened.
    pub fn update_task(&mut self, id: &str, status: TaskStatus) -> bool {
        let Some(task) = self.plan.tasks.iter_mut().find(|task| task.id == id) else {
            return false;
        };
        if task.status == status {
            return false;
        }
        task.status = status;
        task.completed_at = status.is_closed().then(Utc::now);
        true
    }

    pub fn remove_task(&mut self, id: &str) -> bool {
        let before = self.plan.tasks.len();
        self.plan.tasks.retain(|task| task.id != id);
        self.plan.tasks.len() != before
    }

    /// Move to `phase`, recording the transition. Transitioning to the
    /// current phase is a no-op and returns false.
    pub fn transition(&mut self, phase: Phase, reason: &str) -> bool {
        if phase == self.plan.current_phase {
            return false;
        }
        self.plan.phase_history.push(PhaseTransition {
            from: self.plan.current_phase,
            to: phase,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        self.plan.current_phase = phase;
        true
    }

    pub fn diff(&self, old: &PhasePlanTracker) -> Vec<PlanChange> {
        let mut changes = Vec::new();
        for task in &self.plan.tasks {
            match old.task(&task.id) {
                None => changes.push(PlanChange::TaskAdded {
                    id: task.id.clone(),
                }),
                Some(previous) if previous.status != task.status => {
                    changes.push(PlanChange::StatusChanged {
                        id: task.id.clone(),
                        from: previous.status,
                        to: task.status,
                    });
                }
                Some(_) => {}
            }
        }
        for task in &old.plan.tasks {
            if self.task(&task.id).is_none() {
                changes.push(PlanChange::TaskRemoved {
                    id: task.id.clone(),
                });
            }
        }
        if old.plan.current_phase != self.plan.current_phase {
            changes.push(PlanChange::PhaseChanged {
                from: old.plan.current_phase,
                to: self.plan.current_phase,
            });
        }
        changes
    }

    /// Phase header plus a checklist, suitable for a progress-context message.
    pub fn to_compact_summary(&self) -> String {
        let mut out = format!(
            "Phase {}/{}: {}",
            self.plan.current_phase.position(),
            Phase::ALL.len(),
            self.plan.current_phase
        );
        if self.plan.tasks.is_empty() {
            out.push_str("\nTasks: none yet");
            return out;
        }
        let closed = self
            .plan
            .tasks
            .iter()
            .filter(|task| task.status.is_closed())
            .count();
        out.push_str(&format!("\nTasks ({closed}/{} closed):", self.plan.tasks.len()));
        for task in &self.plan.tasks {
            let mark = match task.status {
                TaskStatus::Pending => "[ ]",
                TaskStatus::InProgress => "[~]",
                TaskStatus::Completed => "[x]",
                TaskStatus::Skipped => "[-]",
            };
            out.push_str(&format!("\n{mark} {}: {}", task.id, task.description));
        }
        out
    }
}
