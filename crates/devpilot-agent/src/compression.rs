//! History compression: anchors plus a recency window survive, the middle
//! collapses into one summary message.

use anyhow::{Result, anyhow};
use devpilot_core::{CancellationToken, ChatMessage};
use devpilot_llm::Summarizer;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Prefix marking the synthetic summary message.
pub const SUMMARY_MARKER: &str = "[history summary]";

/// Leading messages that are never compressed: system prompt and request.
pub const ANCHOR_COUNT: usize = 2;

const SUMMARY_TEMPLATE: &str = "Summarize this excerpt of a coding-agent session so the agent \
can continue without it. Be precise and factual: include file paths, function names, error \
messages and commands. Output ONLY these sections, 2-5 bullets each:\n\n\
## Findings\n(What was discovered, with evidence)\n\n\
## Decisions\n(Conclusions reached and hypotheses ruled in or out)\n\n\
## Evidence\n(Key tool output lines, paths and commits)\n\n\
## Open questions\n(What still needs checking)";

/// Transcripts shorter than this are not worth a model call.
const MIN_TRANSCRIPT_CHARS: usize = 200;
/// Model summaries shorter than this are treated as failures.
const MIN_SUMMARY_CHARS: usize = 50;

const MAX_EXAMPLES_PER_TOOL: usize = 3;
const MAX_PATHS: usize = 20;
const MAX_LINES_PER_RESULT: usize = 3;
const MAX_INTERESTING_LINES: usize = 40;
const MAX_ANALYSIS_NOTES: usize = 5;
const MAX_TOOL_NAMES: usize = 20;
/// Budget for free-text earlier summaries carried into a new digest.
const MAX_CARRIED_CHARS: usize = 1500;

const DIGEST_HEADER_PREFIX: &str = "Compressed ";
const DIGEST_HEADER_SUFFIX: &str = " earlier messages (heuristic digest).";

static INTERESTING_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(error|errors|failed|failure|panic|panicked|exception|traceback|fatal|assertion)\b|^\s*(pub(\([a-z]+\))?\s+)?(async\s+)?(fn|struct|enum|trait|impl|class|def|func|interface|type)\s+\w",
    )
    .ok()
});

static ANALYSIS_KEYWORDS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(root cause|because|caused by|likely|suspect|hypothesis|conclude|concluded|the bug|the issue|regression|found that)\b",
    )
    .ok()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStrategy {
    Semantic,
    Heuristic,
    /// Nothing compressible between the anchors and the recency window.
    Skipped,
}

impl CompressionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionStrategy::Semantic => "semantic",
            CompressionStrategy::Heuristic => "heuristic",
            CompressionStrategy::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Compression {
    pub messages: Vec<ChatMessage>,
    pub summary: String,
    pub strategy: CompressionStrategy,
}

pub struct HistoryCompressor<'a> {
    summarizer: Option<&'a (dyn Summarizer + Send + Sync)>,
}

impl<'a> HistoryCompressor<'a> {
    /// `None` selects the heuristic strategy unconditionally.
    pub fn new(summarizer: Option<&'a (dyn Summarizer + Send + Sync)>) -> Self {
        Self { summarizer }
    }

    pub fn heuristic() -> Self {
        Self { summarizer: None }
    }

    pub fn compress(
        &self,
        history: &[ChatMessage],
        keep_recent: usize,
        cancel: &CancellationToken,
    ) -> Compression {
        let start = recent_window_start(history, keep_recent);
        if start < ANCHOR_COUNT + 2 {
            return Compression {
                messages: history.to_vec(),
                summary: String::new(),
                strategy: CompressionStrategy::Skipped,
            };
        }
        let middle = &history[ANCHOR_COUNT..start];

        let (body, strategy) = match self
            .summarizer
            .map(|summarizer| semantic_summary(summarizer, middle, cancel))
        {
            Some(Ok(text)) => (text, CompressionStrategy::Semantic),
            _ => (heuristic_digest(middle), CompressionStrategy::Heuristic),
        };
        let summary = format!("{SUMMARY_MARKER}\n{body}");

        let mut messages = Vec::with_capacity(ANCHOR_COUNT + 1 + history.len() - start);
        messages.extend_from_slice(&history[..ANCHOR_COUNT]);
        messages.push(ChatMessage::user(summary.clone()));
        messages.extend_from_slice(&history[start..]);
        Compression {
            messages,
            summary,
            strategy,
        }
    }
}

/// Index where the kept tail begins. The tail holds at least `keep_recent`
/// messages and never opens with a tool result whose call would be cut off.
pub fn recent_window_start(history: &[ChatMessage], keep_recent: usize) -> usize {
    if history.len() <= ANCHOR_COUNT {
        return history.len();
    }
    let mut start = history.len().saturating_sub(keep_recent).max(ANCHOR_COUNT);
    while start > ANCHOR_COUNT && matches!(history.get(start), Some(ChatMessage::Tool { .. })) {
        start -= 1;
    }
    start
}

pub fn is_summary_message(msg: &ChatMessage) -> bool {
    matches!(msg, ChatMessage::User { content } if content.starts_with(SUMMARY_MARKER))
}

fn semantic_summary(
    summarizer: &(dyn Summarizer + Send + Sync),
    middle: &[ChatMessage],
    cancel: &CancellationToken,
) -> Result<String> {
    let transcript = render_transcript(middle);
    if transcript.len() < MIN_TRANSCRIPT_CHARS {
        return Err(anyhow!("excerpt too short for semantic compression"));
    }
    let text = summarizer
        .summarize(cancel, &format!("{SUMMARY_TEMPLATE}\n\n---\n{transcript}"))?
        .trim()
        .to_string();
    if text.chars().count() < MIN_SUMMARY_CHARS {
        return Err(anyhow!("semantic summary too short"));
    }
    Ok(text)
}

fn render_transcript(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        match msg {
            ChatMessage::System { content } => {
                out.push_str(&format!("SYSTEM: {}\n", truncate_line(content, 200)));
            }
            ChatMessage::User { content } if is_summary_message(msg) => {
                out.push_str(&format!("EARLIER SUMMARY:\n{content}\n"));
            }
            ChatMessage::User { content } => {
                out.push_str(&format!("USER: {}\n", truncate_line(content, 500)));
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                if let Some(text) = content {
                    out.push_str(&format!("ASSISTANT: {}\n", truncate_line(text, 500)));
                }
                for call in tool_calls {
                    out.push_str(&format!(
                        "TOOL_CALL: {}({})\n",
                        call.name,
                        truncate_line(&call.arguments, 200)
                    ));
                }
            }
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => {
                out.push_str(&format!(
                    "TOOL_RESULT[{tool_call_id}]: {}\n",
                    truncate_block(content, 300)
                ));
            }
        }
    }
    out
}

#[derive(Default)]
struct ToolUsage {
    count: usize,
    examples: Vec<String>,
}

/// Accumulated digest state. Earlier digests are parsed back into it, so
/// repeated compression merges counts and lists instead of nesting text.
#[derive(Default)]
struct Digest {
    compressed: usize,
    carried: Vec<String>,
    tools: BTreeMap<String, ToolUsage>,
    paths: Vec<String>,
    interesting: Vec<String>,
    notes: Vec<String>,
}

#[derive(Clone, Copy)]
enum Section {
    None,
    Carried,
    Tools,
    Paths,
    Lines,
    Notes,
}

impl Section {
    fn from_title(line: &str) -> Option<Self> {
        match line {
            "Earlier summary:" => Some(Section::Carried),
            "Tools used:" | "Tools used: none" => Some(Section::Tools),
            "Paths referenced:" => Some(Section::Paths),
            "Notable tool output:" => Some(Section::Lines),
            "Analysis notes:" => Some(Section::Notes),
            _ => None,
        }
    }
}

impl Digest {
    fn record_call(&mut self, name: &str, count: usize, examples: impl IntoIterator<Item = String>) {
        if !self.tools.contains_key(name) && self.tools.len() >= MAX_TOOL_NAMES {
            return;
        }
        let usage = self.tools.entry(name.to_string()).or_default();
        usage.count = usage.count.saturating_add(count);
        for example in examples {
            if usage.examples.len() < MAX_EXAMPLES_PER_TOOL && !usage.examples.contains(&example) {
                usage.examples.push(example);
            }
        }
    }

    fn add_path(&mut self, path: String) {
        if self.paths.len() < MAX_PATHS && !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    fn add_line(&mut self, line: String) {
        if self.interesting.len() < MAX_INTERESTING_LINES {
            self.interesting.push(line);
        }
    }

    fn add_note(&mut self, note: String) {
        if self.notes.len() < MAX_ANALYSIS_NOTES {
            self.notes.push(note);
        }
    }

    fn carry(&mut self, text: &str) {
        let text = text.trim();
        if !text.is_empty() {
            self.carried.push(text.to_string());
        }
    }

    /// Merge an earlier summary body. A heuristic digest is parsed section by
    /// section; its lists contribute at most half of each cap so newer
    /// evidence keeps room. Any other text is carried under a size budget.
    fn fold_earlier(&mut self, body: &str) {
        let mut lines = body.lines();
        let Some(count) = lines.next().and_then(parse_digest_header) else {
            self.carry(body);
            return;
        };
        self.compressed = self.compressed.saturating_add(count);

        let mut section = Section::None;
        let mut carried = Vec::new();
        let mut paths = Vec::new();
        let mut interesting = Vec::new();
        let mut notes = Vec::new();
        for line in lines {
            if let Some(next) = Section::from_title(line) {
                section = next;
                continue;
            }
            if let Section::Carried = section {
                carried.push(line);
                continue;
            }
            let Some(item) = line.strip_prefix("- ") else {
                continue;
            };
            match section {
                Section::Tools => self.fold_tool_line(item),
                Section::Paths => paths.push(item.to_string()),
                Section::Lines => interesting.push(item.to_string()),
                Section::Notes => notes.push(item.to_string()),
                Section::None | Section::Carried => {}
            }
        }

        self.carry(&carried.join("\n"));
        for path in keep_tail(paths, MAX_PATHS / 2) {
            self.add_path(path);
        }
        for line in keep_tail(interesting, MAX_INTERESTING_LINES / 2) {
            self.add_line(line);
        }
        for note in keep_tail(notes, MAX_ANALYSIS_NOTES / 2) {
            self.add_note(note);
        }
    }

    /// Parse `name\u{00d7}count: example; example`.
    fn fold_tool_line(&mut self, item: &str) {
        let Some((name, rest)) = item.split_once('\u{00d7}') else {
            return;
        };
        let (count, examples) = rest.split_once(": ").unwrap_or((rest, ""));
        let Ok(count) = count.trim().parse::<usize>() else {
            return;
        };
        self.record_call(
            name,
            count,
            examples
                .split("; ")
                .filter(|example| !example.is_empty())
                .map(ToString::to_string),
        );
    }

    fn render(&self) -> String {
        let mut out = format!(
            "{DIGEST_HEADER_PREFIX}{}{DIGEST_HEADER_SUFFIX}",
            self.compressed
        );
        if !self.carried.is_empty() {
            out.push_str("\nEarlier summary:\n");
            out.push_str(&truncate_block(&self.carried.join("\n"), MAX_CARRIED_CHARS));
        }
        if self.tools.is_empty() {
            out.push_str("\nTools used: none");
        } else {
            out.push_str("\nTools used:");
            for (name, usage) in &self.tools {
                out.push_str(&format!(
                    "\n- {name}\u{00d7}{}: {}",
                    usage.count,
                    usage.examples.join("; ")
                ));
            }
        }
        push_section(&mut out, "Paths referenced", &self.paths);
        push_section(&mut out, "Notable tool output", &self.interesting);
        push_section(&mut out, "Analysis notes", &self.notes);
        out
    }
}

fn parse_digest_header(line: &str) -> Option<usize> {
    line.strip_prefix(DIGEST_HEADER_PREFIX)?
        .strip_suffix(DIGEST_HEADER_SUFFIX)?
        .parse()
        .ok()
}

fn keep_tail(items: Vec<String>, n: usize) -> impl Iterator<Item = String> {
    let skip = items.len().saturating_sub(n);
    items.into_iter().skip(skip)
}

/// Deterministic digest of `middle`. Pure and infallible. The output size is
/// bounded no matter how many earlier digests it folds in.
pub fn heuristic_digest(middle: &[ChatMessage]) -> String {
    let mut digest = Digest::default();
    for msg in middle {
        if is_summary_message(msg) {
            digest.fold_earlier(msg.text()[SUMMARY_MARKER.len()..].trim());
            continue;
        }
        digest.compressed += 1;
        match msg {
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                for call in tool_calls {
                    let args = serde_json::from_str::<serde_json::Value>(&call.arguments)
                        .unwrap_or(serde_json::Value::Null);
                    digest.record_call(
                        &call.name,
                        1,
                        [format!("{}({})", call.name, summarize_args(&args))],
                    );
                    for path in referenced_paths(&args) {
                        digest.add_path(path);
                    }
                }
                if let Some(text) = content
                    && ANALYSIS_KEYWORDS
                        .as_ref()
                        .is_some_and(|re| re.is_match(text))
                {
                    digest.add_note(truncate_line(text, 200));
                }
            }
            ChatMessage::Tool { content, .. } => {
                let Some(re) = INTERESTING_LINE.as_ref() else {
                    continue;
                };
                for line in content
                    .lines()
                    .filter(|line| re.is_match(line))
                    .take(MAX_LINES_PER_RESULT)
                {
                    digest.add_line(truncate_line(line.trim(), 160));
                }
            }
            _ => {}
        }
    }
    digest.render()
}

fn push_section(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n{title}:"));
    for item in items {
        out.push_str(&format!("\n- {item}"));
    }
}

fn referenced_paths(args: &serde_json::Value) -> Vec<String> {
    let Some(map) = args.as_object() else {
        return Vec::new();
    };
    ["path", "file_path", "dir", "directory"]
        .iter()
        .filter_map(|key| map.get(*key).and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|path| !path.is_empty() && *path != ".")
        .map(ToString::to_string)
        .collect()
}

/// Compact `key=value` rendering of tool arguments.
fn summarize_args(args: &serde_json::Value) -> String {
    let Some(map) = args.as_object() else {
        return String::new();
    };
    map.iter()
        .map(|(key, val)| match val {
            serde_json::Value::String(s) => format!("{key}=\"{}\"", truncate_line(s, 60)),
            serde_json::Value::Number(n) => format!("{key}={n}"),
            serde_json::Value::Bool(b) => format!("{key}={b}"),
            _ => format!("{key}=..."),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// First line of `text`, cut at `max_len` bytes on a char boundary.
pub(crate) fn truncate_line(text: &str, max_len: usize) -> String {
    let first_line = text.lines().next().unwrap_or(text);
    if first_line.len() <= max_len {
        first_line.to_string()
    } else {
        let safe_end = first_line.floor_char_boundary(max_len);
        format!("{}...", &first_line[..safe_end])
    }
}

fn truncate_block(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        text.to_string()
    } else {
        let safe_end = text.floor_char_boundary(max_len);
        format!("{}...", &text[..safe_end])
    }
}
