//! Typed results carried by the terminal tools.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SUBMIT_COMMIT: &str = "submit_commit";
pub const SUBMIT_REVIEW: &str = "submit_review";
pub const SUBMIT_REPORT: &str = "submit_report";

pub const COMMIT_TYPES: [&str; 11] = [
    "feat", "fix", "docs", "style", "refactor", "perf", "test", "build", "ci", "chore", "revert",
];

const MAX_SUBJECT_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMessage {
    #[serde(rename = "type")]
    pub commit_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub breaking: bool,
}

impl CommitMessage {
    pub fn validate(&self) -> Result<()> {
        if !COMMIT_TYPES.contains(&self.commit_type.as_str()) {
            return Err(anyhow!(
                "commit type '{}' must be one of: {}",
                self.commit_type,
                COMMIT_TYPES.join(", ")
            ));
        }
        let subject = self.subject.trim();
        if subject.is_empty() {
            return Err(anyhow!("commit subject must not be empty"));
        }
        if subject.contains('\n') {
            return Err(anyhow!("commit subject must be a single line"));
        }
        if subject.chars().count() > MAX_SUBJECT_CHARS {
            return Err(anyhow!(
                "commit subject exceeds {MAX_SUBJECT_CHARS} characters"
            ));
        }
        if let Some(scope) = &self.scope
            && (scope.trim().is_empty() || scope.contains(char::is_whitespace))
        {
            return Err(anyhow!("commit scope must be a single word"));
        }
        Ok(())
    }

    pub fn header(&self) -> String {
        let scope = self
            .scope
            .as_deref()
            .map(|s| format!("({s})"))
            .unwrap_or_default();
        let bang = if self.breaking { "!" } else { "" };
        format!("{}{scope}{bang}: {}", self.commit_type, self.subject.trim())
    }

    /// Full message as passed to `git commit -m`.
    pub fn render(&self) -> String {
        match self.body.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            Some(body) => format!("{}\n\n{body}", self.header()),
            None => self.header(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    RequestChanges,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewReport {
    pub summary: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl ReviewReport {
    pub fn validate(&self) -> Result<()> {
        if self.summary.trim().is_empty() {
            return Err(anyhow!("review summary must not be empty"));
        }
        for (idx, finding) in self.findings.iter().enumerate() {
            if finding.file.trim().is_empty() || finding.message.trim().is_empty() {
                return Err(anyhow!("finding {} needs a file and a message", idx + 1));
            }
        }
        if self.verdict == Verdict::RequestChanges && self.findings.is_empty() {
            return Err(anyhow!("request_changes requires at least one finding"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPayload {
    pub title: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl ReportPayload {
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(anyhow!("report title must not be empty"));
        }
        if self.summary.trim().is_empty() {
            return Err(anyhow!("report summary must not be empty"));
        }
        Ok(())
    }
}

/// Decoded, validated result of a terminal tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalPayload {
    Commit(CommitMessage),
    Review(ReviewReport),
    Report(ReportPayload),
}

impl TerminalPayload {
    pub fn tool_name(&self) -> &'static str {
        match self {
            TerminalPayload::Commit(_) => SUBMIT_COMMIT,
            TerminalPayload::Review(_) => SUBMIT_REVIEW,
            TerminalPayload::Report(_) => SUBMIT_REPORT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            TerminalPayload::Commit(msg) => msg.validate(),
            TerminalPayload::Review(review) => review.validate(),
            TerminalPayload::Report(report) => report.validate(),
        }
    }
}

impl fmt::Display for TerminalPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalPayload::Commit(msg) => f.write_str(&msg.render()),
            TerminalPayload::Review(review) => {
                let verdict = match review.verdict {
                    Verdict::Approve => "approve",
                    Verdict::RequestChanges => "request changes",
                    Verdict::Comment => "comment",
                };
                writeln!(f, "Verdict: {verdict}")?;
                writeln!(f)?;
                write!(f, "{}", review.summary.trim())?;
                if !review.findings.is_empty() {
                    writeln!(f)?;
                    writeln!(f)?;
                    write!(f, "Findings:")?;
                    for finding in &review.findings {
                        let location = match finding.line {
                            Some(line) => format!("{}:{line}", finding.file),
                            None => finding.file.clone(),
                        };
                        let severity = serde_json::to_value(finding.severity)
                            .ok()
                            .and_then(|v| v.as_str().map(ToString::to_string))
                            .unwrap_or_default();
                        write!(f, "\n- [{severity}] {location}: {}", finding.message)?;
                    }
                }
                Ok(())
            }
            TerminalPayload::Report(report) => {
                write!(f, "# {}\n\n{}", report.title.trim(), report.summary.trim())?;
                if let Some(cause) = report.root_cause.as_deref().filter(|c| !c.trim().is_empty()) {
                    write!(f, "\n\n## Root cause\n{}", cause.trim())?;
                }
                for (title, items) in [
                    ("Evidence", &report.evidence),
                    ("Recommendations", &report.recommendations),
                ] {
                    if items.is_empty() {
                        continue;
                    }
                    write!(f, "\n\n## {title}")?;
                    for item in items {
                        write!(f, "\n- {item}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(commit_type: &str, subject: &str) -> CommitMessage {
        CommitMessage {
            commit_type: commit_type.to_string(),
            scope: None,
            subject: subject.to_string(),
            body: None,
            breaking: false,
        }
    }

    #[test]
    fn commit_renders_header_and_body() {
        let msg = CommitMessage {
            scope: Some("core".to_string()),
            body: Some("Explain the change.".to_string()),
            breaking: true,
            ..commit("feat", "add session store")
        };
        assert!(msg.validate().is_ok());
        assert_eq!(
            msg.render(),
            "feat(core)!: add session store\n\nExplain the change."
        );
    }

    #[test]
    fn commit_validation_rejects_bad_fields() {
        assert!(commit("feature", "x").validate().is_err());
        assert!(commit("fix", "  ").validate().is_err());
        assert!(commit("fix", &"a".repeat(101)).validate().is_err());
        let scoped = CommitMessage {
            scope: Some("two words".to_string()),
            ..commit("fix", "ok")
        };
        assert!(scoped.validate().is_err());
    }

    #[test]
    fn review_requires_findings_for_request_changes() {
        let review = ReviewReport {
            summary: "Looks risky".to_string(),
            verdict: Verdict::RequestChanges,
            findings: Vec::new(),
        };
        assert!(review.validate().is_err());
    }

    #[test]
    fn review_display_lists_findings() {
        let payload = TerminalPayload::Review(ReviewReport {
            summary: "One bug".to_string(),
            verdict: Verdict::RequestChanges,
            findings: vec![Finding {
                file: "src/lib.rs".to_string(),
                line: Some(2),
                severity: Severity::Major,
                message: "subtracts instead of adding".to_string(),
            }],
        });
        assert_eq!(
            payload.to_string(),
            "Verdict: request changes\n\nOne bug\n\nFindings:\n- [major] src/lib.rs:2: subtracts instead of adding"
        );
    }

    #[test]
    fn report_display_includes_sections() {
        let payload = TerminalPayload::Report(ReportPayload {
            title: "add() is wrong".to_string(),
            summary: "Returns a - b.".to_string(),
            root_cause: Some("Typo in operator".to_string()),
            evidence: vec!["src/lib.rs:2".to_string()],
            recommendations: Vec::new(),
        });
        assert_eq!(
            payload.to_string(),
            "# add() is wrong\n\nReturns a - b.\n\n## Root cause\nTypo in operator\n\n## Evidence\n- src/lib.rs:2"
        );
        assert_eq!(payload.tool_name(), SUBMIT_REPORT);
    }
}
