//! Recovers a commit message from a plain-text reply when the model
//! answered without calling `submit_commit`.

use crate::payloads::CommitMessage;
use regex::Regex;
use std::sync::LazyLock;

static CONVENTIONAL_HEADER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^(feat|fix|docs|style|refactor|perf|test|build|ci|chore|revert)(\(([\w./-]+)\))?(!)?: (.+)$",
    )
    .ok()
});

/// Find the first conventional-commit header line in `text`. Everything
/// after it (minus code fences) becomes the body.
pub fn parse_commit_text(text: &str) -> Option<CommitMessage> {
    let re = CONVENTIONAL_HEADER.as_ref()?;
    let lines: Vec<&str> = text.lines().collect();
    for (idx, raw) in lines.iter().enumerate() {
        let line = strip_decoration(raw);
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let subject = caps.get(5).map(|m| m.as_str().trim()).unwrap_or_default();
        if subject.is_empty() {
            continue;
        }
        let body = lines[idx + 1..]
            .iter()
            .filter(|l| !l.trim_start().starts_with("```"))
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        let body = body.trim();
        let msg = CommitMessage {
            commit_type: caps[1].to_string(),
            scope: caps.get(3).map(|m| m.as_str().to_string()),
            subject: subject.to_string(),
            body: (!body.is_empty()).then(|| body.to_string()),
            breaking: caps.get(4).is_some(),
        };
        if msg.validate().is_ok() {
            return Some(msg);
        }
    }
    None
}

fn strip_decoration(line: &str) -> &str {
    line.trim()
        .trim_matches(|c| c == '`' || c == '"' || c == '\'')
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_header_inside_prose() {
        let msg = parse_commit_text("Here is the message:\n\nfeat(core): add x\n").expect("parsed");
        assert_eq!(msg.commit_type, "feat");
        assert_eq!(msg.scope.as_deref(), Some("core"));
        assert_eq!(msg.subject, "add x");
        assert_eq!(msg.body, None);
        assert!(!msg.breaking);
    }

    #[test]
    fn keeps_body_and_breaking_marker() {
        let text = "```\nfix!: drop legacy flag\n\nThe flag was removed upstream.\n```";
        let msg = parse_commit_text(text).expect("parsed");
        assert!(msg.breaking);
        assert_eq!(msg.scope, None);
        assert_eq!(msg.body.as_deref(), Some("The flag was removed upstream."));
        assert_eq!(
            msg.render(),
            "fix!: drop legacy flag\n\nThe flag was removed upstream."
        );
    }

    #[test]
    fn quoted_header_is_accepted() {
        let msg = parse_commit_text("`chore(deps): bump regex`").expect("parsed");
        assert_eq!(msg.header(), "chore(deps): bump regex");
    }

    #[test]
    fn plain_prose_yields_nothing() {
        assert!(parse_commit_text("I could not find any staged changes.").is_none());
        assert!(parse_commit_text("feature: not a real type").is_none());
    }
}
