mod process;

use anyhow::{Result, anyhow};
use devpilot_core::{ParamSpec, ToolDefinition, ToolSchema, ToolsConfig};
use ignore::WalkBuilder;
pub use process::{ProcessOutput, run_process};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

pub const READ_FILE: &str = "read_file";
pub const LIST_DIRECTORY: &str = "list_directory";
pub const SEARCH_PATTERN: &str = "search_pattern";
pub const GIT_STATUS: &str = "git_status";
pub const GIT_DIFF: &str = "git_diff";
pub const GIT_LOG: &str = "git_log";
pub const GIT_SHOW: &str = "git_show";

/// Executes decoded workspace tool inputs and declares their schemas.
pub trait ToolHost {
    fn definitions(&self) -> Vec<ToolDefinition>;
    fn execute(&self, input: &ToolInput) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadFileArgs {
    pub path: String,
    #[serde(default)]
    pub start_line: Option<usize>,
    #[serde(default)]
    pub end_line: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListDirectoryArgs {
    #[serde(default = "default_dir")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchPatternArgs {
    pub pattern: String,
    #[serde(default)]
    pub glob: Option<String>,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    #[serde(default)]
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GitDiffArgs {
    #[serde(default)]
    pub staged: bool,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GitLogArgs {
    #[serde(default = "default_log_count")]
    pub max_count: usize,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GitShowArgs {
    pub revision: String,
}

fn default_dir() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_count() -> usize {
    10
}

/// Decoded arguments for one workspace tool, keyed by tool name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInput {
    ReadFile(ReadFileArgs),
    ListDirectory(ListDirectoryArgs),
    SearchPattern(SearchPatternArgs),
    GitStatus,
    GitDiff(GitDiffArgs),
    GitLog(GitLogArgs),
    GitShow(GitShowArgs),
}

impl ToolInput {
    /// Decode raw JSON arguments for `name`. Returns `None` when `name` is
    /// not a workspace tool.
    pub fn decode(name: &str, raw: &str) -> Option<Result<ToolInput>> {
        let decoded = match name {
            READ_FILE => parse_args(raw).map(ToolInput::ReadFile),
            LIST_DIRECTORY => parse_args(raw).map(ToolInput::ListDirectory),
            SEARCH_PATTERN => parse_args(raw).map(ToolInput::SearchPattern),
            GIT_STATUS => Ok(ToolInput::GitStatus),
            GIT_DIFF => parse_args(raw).map(ToolInput::GitDiff),
            GIT_LOG => parse_args(raw).map(ToolInput::GitLog),
            GIT_SHOW => parse_args(raw).map(ToolInput::GitShow),
            _ => return None,
        };
        Some(decoded)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolInput::ReadFile(_) => READ_FILE,
            ToolInput::ListDirectory(_) => LIST_DIRECTORY,
            ToolInput::SearchPattern(_) => SEARCH_PATTERN,
            ToolInput::GitStatus => GIT_STATUS,
            ToolInput::GitDiff(_) => GIT_DIFF,
            ToolInput::GitLog(_) => GIT_LOG,
            ToolInput::GitShow(_) => GIT_SHOW,
        }
    }
}

/// Parse a tool-call argument string; blank input is treated as `{}`.
pub fn parse_args<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid arguments: {err}"))
}

pub fn workspace_tool_schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: READ_FILE,
            description: "Read a workspace file, optionally limited to a 1-based line range.",
            parameters: vec![
                ParamSpec::required("path", "string", "Workspace-relative file path"),
                ParamSpec::optional("start_line", "integer", "First line to include"),
                ParamSpec::optional("end_line", "integer", "Last line to include"),
            ],
        },
        ToolSchema {
            name: LIST_DIRECTORY,
            description: "List the entries of a workspace directory.",
            parameters: vec![ParamSpec::optional(
                "path",
                "string",
                "Workspace-relative directory (default '.')",
            )],
        },
        ToolSchema {
            name: SEARCH_PATTERN,
            description: "Search workspace files for a regular expression, honouring .gitignore.",
            parameters: vec![
                ParamSpec::required("pattern", "string", "Regular expression"),
                ParamSpec::optional("glob", "string", "Only search paths matching this glob"),
                ParamSpec::optional("case_sensitive", "boolean", "Defaults to true"),
                ParamSpec::optional("max_results", "integer", "Maximum matches to return"),
            ],
        },
        ToolSchema {
            name: GIT_STATUS,
            description: "Show `git status --short` for the workspace.",
            parameters: Vec::new(),
        },
        ToolSchema {
            name: GIT_DIFF,
            description: "Show a git diff of the working tree, the index, or against a base ref.",
            parameters: vec![
                ParamSpec::optional("staged", "boolean", "Diff the index instead of the working tree"),
                ParamSpec::optional("base", "string", "Diff against this ref (e.g. main)"),
                ParamSpec::optional("path", "string", "Limit the diff to one path"),
            ],
        },
        ToolSchema {
            name: GIT_LOG,
            description: "Show recent commits, one line each.",
            parameters: vec![
                ParamSpec::optional("max_count", "integer", "Number of commits (default 10)"),
                ParamSpec::optional("path", "string", "Limit history to one path"),
            ],
        },
        ToolSchema {
            name: GIT_SHOW,
            description: "Show one commit with its patch.",
            parameters: vec![ParamSpec::required("revision", "string", "Commit-ish to show")],
        },
    ]
}

/// Filesystem and git tools rooted at one workspace directory.
pub struct LocalToolHost {
    workspace: PathBuf,
    cfg: ToolsConfig,
}

impl LocalToolHost {
    pub fn new(workspace: &Path, cfg: &ToolsConfig) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            cfg: cfg.clone(),
        }
    }

    fn read_file(&self, args: &ReadFileArgs) -> Result<String> {
        let full = resolve_workspace_path(&self.workspace, &args.path)?;
        if !full.is_file() {
            return Err(anyhow!("not a file: {}", args.path));
        }
        let bytes = fs::read(&full)?;
        if is_binary(&bytes) {
            return Ok(format!("{} is a binary file ({} bytes)", args.path, bytes.len()));
        }
        let truncated = bytes.len() > self.cfg.read_max_bytes;
        let slice = &bytes[..bytes.len().min(self.cfg.read_max_bytes)];
        let content = String::from_utf8_lossy(slice);

        let start = args.start_line.unwrap_or(1).max(1);
        let end = args.end_line.unwrap_or(usize::MAX).max(start);
        let mut out = String::new();
        let mut total = 0usize;
        for (idx, line) in content.lines().enumerate() {
            total = idx + 1;
            if total < start || total > end {
                continue;
            }
            out.push_str(&format!("{total:>5} | {line}\n"));
        }
        if out.is_empty() {
            out.push_str(&format!("(no lines in range {start}-{end}; file has {total} lines)\n"));
        }
        if truncated {
            out.push_str(&format!(
                "[truncated: file is {} bytes, read limit is {}]\n",
                bytes.len(),
                self.cfg.read_max_bytes
            ));
        }
        Ok(out)
    }

    fn list_directory(&self, args: &ListDirectoryArgs) -> Result<String> {
        let full = resolve_workspace_path(&self.workspace, &args.path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&full)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() {
                entries.push(format!("{name}/"));
            } else {
                entries.push(name);
            }
        }
        entries.sort();
        if entries.is_empty() {
            return Ok(format!("{} is empty", args.path));
        }
        Ok(entries.join("\n"))
    }

    fn search_pattern(&self, args: &SearchPatternArgs) -> Result<String> {
        let regex = regex::RegexBuilder::new(&args.pattern)
            .case_insensitive(!args.case_sensitive)
            .build()
            .map_err(|err| anyhow!("invalid pattern '{}': {err}", args.pattern))?;
        let glob = args
            .glob
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|err| anyhow!("invalid glob pattern: {err}"))?;
        let limit = args
            .max_results
            .unwrap_or(self.cfg.search_max_results)
            .clamp(1, self.cfg.search_max_results.max(1));
        let deadline = Instant::now() + Duration::from_millis(self.cfg.search_budget_ms);

        let mut matches = Vec::new();
        let mut budget_hit = false;
        'files: for path in walk_files(&self.workspace) {
            if Instant::now() >= deadline {
                budget_hit = true;
                break;
            }
            let Ok(rel_path) = path.strip_prefix(&self.workspace) else {
                continue;
            };
            let rel = normalize_rel_path(rel_path);
            if let Some(glob) = &glob
                && !glob.matches(&rel)
            {
                continue;
            }
            let Ok(bytes) = fs::read(&path) else {
                continue;
            };
            if is_binary(&bytes) {
                continue;
            }
            let Ok(content) = String::from_utf8(bytes) else {
                continue;
            };
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{rel}:{}: {}", idx + 1, line.trim_end()));
                    if matches.len() >= limit {
                        break 'files;
                    }
                }
            }
        }

        let mut out = if matches.is_empty() {
            format!("no matches for '{}'", args.pattern)
        } else {
            matches.join("\n")
        };
        if matches.len() >= limit {
            out.push_str(&format!("\n[result limit of {limit} reached]"));
        }
        if budget_hit {
            out.push_str("\n[search time budget exhausted; results may be incomplete]");
        }
        Ok(out)
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let out = run_process(
            "git",
            args,
            &self.workspace,
            Duration::from_secs(self.cfg.git_timeout_seconds),
        )?;
        if out.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.first().copied().unwrap_or_default(),
                self.cfg.git_timeout_seconds
            ));
        }
        if !out.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                out.stderr.trim()
            ));
        }
        let stdout = out.stdout.trim_end();
        if stdout.is_empty() {
            return Ok("(no output)".to_string());
        }
        Ok(truncate_output(stdout, self.cfg.max_output_chars))
    }

    fn git_diff(&self, args: &GitDiffArgs) -> Result<String> {
        let mut cmd = vec!["diff"];
        if args.staged {
            cmd.push("--cached");
        }
        if let Some(base) = &args.base {
            cmd.push(validate_revision(base)?);
        }
        if let Some(path) = &args.path {
            resolve_workspace_path(&self.workspace, path)?;
            cmd.push("--");
            cmd.push(path);
        }
        self.git(&cmd)
    }

    fn git_log(&self, args: &GitLogArgs) -> Result<String> {
        let count = format!("-n{}", args.max_count.clamp(1, 200));
        let mut cmd = vec!["log", "--oneline", "--no-decorate", count.as_str()];
        if let Some(path) = &args.path {
            resolve_workspace_path(&self.workspace, path)?;
            cmd.push("--");
            cmd.push(path);
        }
        self.git(&cmd)
    }
}

impl ToolHost for LocalToolHost {
    fn definitions(&self) -> Vec<ToolDefinition> {
        workspace_tool_schemas()
            .iter()
            .map(ToolSchema::to_definition)
            .collect()
    }

    fn execute(&self, input: &ToolInput) -> Result<String> {
        match input {
            ToolInput::ReadFile(args) => self.read_file(args),
            ToolInput::ListDirectory(args) => self.list_directory(args),
            ToolInput::SearchPattern(args) => self.search_pattern(args),
            ToolInput::GitStatus => self.git(&["status", "--short", "--branch"]),
            ToolInput::GitDiff(args) => self.git_diff(args),
            ToolInput::GitLog(args) => self.git_log(args),
            ToolInput::GitShow(args) => {
                self.git(&["show", "--stat", "--patch", validate_revision(&args.revision)?])
            }
        }
    }
}

/// Join a workspace-relative path, rejecting absolute paths and `..`.
pub fn resolve_workspace_path(workspace: &Path, rel: &str) -> Result<PathBuf> {
    let rel = rel.trim();
    let candidate = Path::new(if rel.is_empty() { "." } else { rel });
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(anyhow!("path escapes the workspace: {rel}"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("absolute paths are not allowed: {rel}"));
            }
        }
    }
    Ok(workspace.join(candidate))
}

fn validate_revision(rev: &str) -> Result<&str> {
    let rev = rev.trim();
    if rev.is_empty() || rev.starts_with('-') || rev.chars().any(char::is_whitespace) {
        return Err(anyhow!("invalid revision: '{rev}'"));
    }
    Ok(rev)
}

fn should_skip_rel_path(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str() == ".git" || c.as_os_str() == ".devpilot" || c.as_os_str() == "target"
    })
}

fn walk_files(root: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    let mut builder = WalkBuilder::new(root);
    builder.hidden(false);
    builder.follow_links(false);
    builder.require_git(false);
    builder.sort_by_file_path(|a, b| a.cmp(b));
    builder
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .map(|entry| entry.into_path())
        .filter(move |path| {
            path.strip_prefix(root)
                .map(|rel| !should_skip_rel_path(rel))
                .unwrap_or(false)
        })
}

fn normalize_rel_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn is_binary(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    if bytes.iter().take(8192).any(|b| *b == 0) {
        return true;
    }
    let non_text = bytes
        .iter()
        .take(8192)
        .filter(|b| !(b.is_ascii() || **b == b'\n' || **b == b'\r' || **b == b'\t'))
        .count();
    non_text > 64 && std::str::from_utf8(&bytes[..bytes.len().min(8192)]).is_err()
}

/// Cap `text` at `max_chars` characters, appending a truncation note.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n[truncated {} of {total} chars]", total - max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> (tempfile::TempDir, LocalToolHost) {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        fs::write(
            dir.path().join("src/lib.rs"),
            "pub fn parse() {}\nfn helper() {\n    panic!(\"boom\");\n}\n",
        )
        .expect("seed lib");
        fs::write(dir.path().join("README.md"), "# Demo\nParse things.\n").expect("seed readme");
        let host = LocalToolHost::new(dir.path(), &ToolsConfig::default());
        (dir, host)
    }

    fn run(host: &LocalToolHost, name: &str, args: &str) -> Result<String> {
        let input = ToolInput::decode(name, args).expect("known tool")?;
        host.execute(&input)
    }

    #[test]
    fn decode_rejects_unknown_tools_and_bad_args() {
        assert!(ToolInput::decode("foo_bar", "{}").is_none());
        let err = ToolInput::decode(READ_FILE, "{\"start_line\":2}")
            .expect("known")
            .expect_err("path required");
        assert!(err.to_string().contains("invalid arguments"));
        assert_eq!(
            ToolInput::decode(GIT_STATUS, "").expect("known").expect("decode"),
            ToolInput::GitStatus
        );
    }

    #[test]
    fn read_file_honours_line_range() {
        let (_dir, host) = host();
        let out = run(&host, READ_FILE, r#"{"path":"src/lib.rs","start_line":2,"end_line":3}"#)
            .expect("read");
        assert!(out.contains("    2 | fn helper() {"));
        assert!(out.contains("panic!"));
        assert!(!out.contains("pub fn parse"));
    }

    #[test]
    fn read_file_reports_truncation() {
        let (dir, _) = host();
        let host = LocalToolHost::new(
            dir.path(),
            &ToolsConfig {
                read_max_bytes: 10,
                ..ToolsConfig::default()
            },
        );
        let out = run(&host, READ_FILE, r#"{"path":"README.md"}"#).expect("read");
        assert!(out.contains("[truncated"));
    }

    #[test]
    fn paths_outside_workspace_are_rejected() {
        let (_dir, host) = host();
        let escape = run(&host, READ_FILE, r#"{"path":"../etc/passwd"}"#).expect_err("escape");
        assert!(escape.to_string().contains("escapes"));
        let absolute = run(&host, LIST_DIRECTORY, r#"{"path":"/etc"}"#).expect_err("absolute");
        assert!(absolute.to_string().contains("absolute"));
    }

    #[test]
    fn list_directory_marks_subdirectories() {
        let (_dir, host) = host();
        let out = run(&host, LIST_DIRECTORY, "{}").expect("list");
        assert_eq!(out, "README.md\nsrc/");
    }

    #[test]
    fn search_pattern_filters_by_glob_and_case() {
        let (_dir, host) = host();
        let out = run(&host, SEARCH_PATTERN, r#"{"pattern":"parse","glob":"src/**"}"#)
            .expect("search");
        assert_eq!(out, "src/lib.rs:1: pub fn parse() {}");

        let insensitive = run(
            &host,
            SEARCH_PATTERN,
            r#"{"pattern":"PARSE","case_sensitive":false}"#,
        )
        .expect("search");
        assert!(insensitive.contains("README.md:2: Parse things."));
        assert!(insensitive.contains("src/lib.rs:1:"));
    }

    #[test]
    fn search_pattern_respects_result_cap() {
        let (_dir, host) = host();
        let out = run(&host, SEARCH_PATTERN, r#"{"pattern":".","max_results":1}"#)
            .expect("search");
        assert!(out.contains("[result limit of 1 reached]"));
    }

    #[test]
    fn invalid_revision_is_rejected_before_spawning_git() {
        let (_dir, host) = host();
        let err = run(&host, GIT_SHOW, r#"{"revision":"--output=/tmp/x"}"#).expect_err("flag");
        assert!(err.to_string().contains("invalid revision"));
    }

    #[test]
    fn definitions_cover_every_workspace_tool() {
        let (_dir, host) = host();
        let names: Vec<String> = host
            .definitions()
            .into_iter()
            .map(|d| d.function.name)
            .collect();
        assert_eq!(
            names,
            vec![READ_FILE, LIST_DIRECTORY, SEARCH_PATTERN, GIT_STATUS, GIT_DIFF, GIT_LOG, GIT_SHOW]
        );
    }

    #[test]
    fn truncate_output_keeps_prefix() {
        assert_eq!(truncate_output("abc", 5), "abc");
        assert_eq!(truncate_output("abcdef", 3), "abc\n[truncated 3 of 6 chars]");
    }
}
