//! Runtime log for agent sessions. Agent-loop events are appended to
//! `.devpilot/observe.log` as `EVENT` JSON lines, echoed to stderr in
//! readable form when verbose, and optionally posted to a telemetry endpoint.

use anyhow::Result;
use chrono::Utc;
use devpilot_core::{EventEnvelope, EventKind, ObserveConfig, runtime_dir};
use reqwest::blocking::Client;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const EVENT_TAG: &str = " EVENT ";

pub struct Observer {
    log_path: PathBuf,
    telemetry: Option<TelemetrySink>,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path, cfg: &ObserveConfig) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            telemetry: TelemetrySink::from_config(cfg)?,
            verbose: cfg.verbose,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Record one agent-loop event for `session_id`.
    pub fn record(&self, session_id: &str, kind: EventKind) -> Result<()> {
        let envelope = EventEnvelope::now(session_id, kind);
        self.verbose_log(&describe(&envelope.kind));
        append_line(
            &self.log_path,
            &format!(
                "{}{EVENT_TAG}{}",
                envelope.at.to_rfc3339(),
                serde_json::to_string(&envelope)?
            ),
        )?;
        if let Some(sink) = &self.telemetry {
            sink.send(&envelope, &self.log_path);
        }
        Ok(())
    }

    /// Events recorded for `session_id`, oldest first. Unparseable lines are
    /// skipped; a missing log yields no events.
    pub fn session_events(&self, session_id: &str) -> Result<Vec<EventEnvelope>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.log_path)?;
        Ok(raw
            .lines()
            .filter_map(|line| line.split_once(EVENT_TAG))
            .filter_map(|(_, body)| serde_json::from_str::<EventEnvelope>(body).ok())
            .filter(|event| event.session_id == session_id)
            .collect())
    }

    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[devpilot] {msg}");
        }
    }

    /// Always shown, and kept in the log file.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[devpilot WARN] {msg}");
        let _ = append_line(
            &self.log_path,
            &format!("{} WARN {msg}", Utc::now().to_rfc3339()),
        );
    }
}

/// Readable one-line form of an event.
pub fn describe(kind: &EventKind) -> String {
    match kind {
        EventKind::IterationStarted { iteration } => format!("iteration {iteration} started"),
        EventKind::ModelRetry {
            attempt,
            error,
            delay_ms,
        } => format!("model call failed ({error}); retry {attempt} in {delay_ms}ms"),
        EventKind::ToolDispatched {
            name,
            is_error,
            terminal,
        } => {
            let result = if *is_error {
                "failed"
            } else if *terminal {
                "accepted result"
            } else {
                "ok"
            };
            format!("tool {name}: {result}")
        }
        EventKind::PlanChanged { changes } => format!("plan: {}", changes.join("; ")),
        EventKind::HistoryCompressed {
            before,
            after,
            strategy,
        } => format!("history compressed {before} -> {after} messages ({strategy})"),
        EventKind::LoopFinished {
            outcome,
            iterations,
        } => format!("finished: {outcome} after {iterations} iterations"),
    }
}

/// Activity counts for one session, derived from its recorded events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTally {
    /// Highest iteration started; resumed runs continue the numbering.
    pub iterations: u64,
    pub retries: usize,
    pub tool_calls: usize,
    pub tool_errors: usize,
    pub plan_changes: usize,
    pub compressions: usize,
    pub last_outcome: Option<String>,
}

impl EventTally {
    pub fn from_events(events: &[EventEnvelope]) -> Self {
        let mut tally = Self::default();
        for event in events {
            match &event.kind {
                EventKind::IterationStarted { iteration } => {
                    tally.iterations = tally.iterations.max(*iteration);
                }
                EventKind::ModelRetry { .. } => tally.retries += 1,
                EventKind::ToolDispatched { is_error, .. } => {
                    tally.tool_calls += 1;
                    if *is_error {
                        tally.tool_errors += 1;
                    }
                }
                EventKind::PlanChanged { changes } => tally.plan_changes += changes.len(),
                EventKind::HistoryCompressed { .. } => tally.compressions += 1,
                EventKind::LoopFinished { outcome, .. } => {
                    tally.last_outcome = Some(outcome.clone());
                }
            }
        }
        tally
    }

    pub fn render(&self) -> String {
        format!(
            "{} iterations, {} tool calls ({} failed), {} model retries, {} plan changes, {} compressions",
            self.iterations,
            self.tool_calls,
            self.tool_errors,
            self.retries,
            self.plan_changes,
            self.compressions
        )
    }
}

struct TelemetrySink {
    endpoint: String,
    client: Client,
}

impl TelemetrySink {
    fn from_config(cfg: &ObserveConfig) -> Result<Option<Self>> {
        if !cfg.telemetry_enabled {
            return Ok(None);
        }
        let Some(endpoint) = cfg.telemetry_endpoint.clone() else {
            return Ok(None);
        };
        let client = Client::builder().timeout(Duration::from_secs(3)).build()?;
        Ok(Some(Self { endpoint, client }))
    }

    /// Posts from a background thread; failures only land in the log.
    fn send(&self, envelope: &EventEnvelope, log_path: &Path) {
        let body = json!({
            "name": format!("devpilot.{}", envelope.kind.name()),
            "at": envelope.at.to_rfc3339(),
            "session_id": envelope.session_id,
            "event": envelope.kind,
        });
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let log_path = log_path.to_path_buf();
        std::thread::spawn(move || {
            if let Err(err) = client.post(&endpoint).json(&body).send() {
                let _ = append_line(
                    &log_path,
                    &format!("{} TELEMETRY_ERROR error={err}", Utc::now().to_rfc3339()),
                );
            }
        });
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{line}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    fn dispatched(name: &str, is_error: bool) -> EventKind {
        EventKind::ToolDispatched {
            name: name.to_string(),
            is_error,
            terminal: false,
        }
    }

    fn quiet(workspace: &Path) -> Observer {
        Observer::new(workspace, &ObserveConfig::default()).expect("observer")
    }

    #[test]
    fn record_appends_event_lines() {
        let workspace = tempfile::tempdir().expect("workspace");
        let observer = quiet(workspace.path());
        observer.record("s1", dispatched("read_file", false)).expect("record 1");
        observer
            .record("s1", EventKind::IterationStarted { iteration: 2 })
            .expect("record 2");

        let log = fs::read_to_string(observer.log_path()).expect("read log");
        let lines: Vec<&str> = log.lines().filter(|l| l.contains(EVENT_TAG)).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"type\":\"tool_dispatched\""));
        assert!(lines[1].contains("\"session_id\":\"s1\""));
    }

    #[test]
    fn session_events_filter_by_session_and_skip_noise() {
        let workspace = tempfile::tempdir().expect("workspace");
        let observer = quiet(workspace.path());
        assert!(observer.session_events("s1").expect("empty").is_empty());

        observer.record("s1", dispatched("git_diff", false)).expect("record");
        observer.warn_log("session save failed");
        observer.record("s2", dispatched("git_log", false)).expect("record");
        append_line(observer.log_path(), "2026-01-01T00:00:00Z EVENT {not json").expect("noise");
        observer
            .record(
                "s1",
                EventKind::LoopFinished {
                    outcome: "success".to_string(),
                    iterations: 1,
                },
            )
            .expect("record");

        let events = observer.session_events("s1").expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, dispatched("git_diff", false));
        assert_eq!(events[1].kind.name(), "loop_finished");
    }

    #[test]
    fn tally_counts_session_activity() {
        let kinds = vec![
            EventKind::IterationStarted { iteration: 1 },
            EventKind::ModelRetry {
                attempt: 1,
                error: "transport error: reset".to_string(),
                delay_ms: 400,
            },
            dispatched("read_file", false),
            dispatched("foo_bar", true),
            EventKind::IterationStarted { iteration: 2 },
            EventKind::PlanChanged {
                changes: vec!["task added: t1".to_string(), "phase: a -> b".to_string()],
            },
            EventKind::HistoryCompressed {
                before: 41,
                after: 13,
                strategy: "heuristic".to_string(),
            },
            EventKind::LoopFinished {
                outcome: "cancelled".to_string(),
                iterations: 2,
            },
        ];
        let events: Vec<EventEnvelope> = kinds
            .into_iter()
            .map(|kind| EventEnvelope::now("s1", kind))
            .collect();

        let tally = EventTally::from_events(&events);
        assert_eq!(
            tally,
            EventTally {
                iterations: 2,
                retries: 1,
                tool_calls: 2,
                tool_errors: 1,
                plan_changes: 2,
                compressions: 1,
                last_outcome: Some("cancelled".to_string()),
            }
        );
        assert!(tally.render().starts_with("2 iterations, 2 tool calls (1 failed)"));
    }

    #[test]
    fn describe_renders_each_event_kind() {
        assert_eq!(describe(&dispatched("foo_bar", true)), "tool foo_bar: failed");
        assert_eq!(
            describe(&EventKind::ToolDispatched {
                name: "submit_commit".to_string(),
                is_error: false,
                terminal: true,
            }),
            "tool submit_commit: accepted result"
        );
        assert_eq!(
            describe(&EventKind::HistoryCompressed {
                before: 41,
                after: 13,
                strategy: "semantic".to_string(),
            }),
            "history compressed 41 -> 13 messages (semantic)"
        );
        assert_eq!(
            describe(&EventKind::LoopFinished {
                outcome: "iteration_exceeded".to_string(),
                iterations: 5,
            }),
            "finished: iteration_exceeded after 5 iterations"
        );
    }

    #[test]
    fn warn_log_writes_to_log_file() {
        let workspace = tempfile::tempdir().expect("workspace");
        let observer = quiet(workspace.path());
        observer.warn_log("session save failed");

        let log = fs::read_to_string(observer.log_path()).expect("read log");
        assert!(log.contains(" WARN session save failed"));
    }

    #[test]
    fn telemetry_requires_endpoint_when_enabled() {
        let sink = TelemetrySink::from_config(&ObserveConfig {
            telemetry_enabled: true,
            telemetry_endpoint: None,
            verbose: false,
        })
        .expect("sink");
        assert!(sink.is_none());
    }

    #[test]
    fn telemetry_posts_event_name() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = vec![0_u8; 8192];
            let n = stream.read(&mut buf).expect("read request");
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
            request
        });

        let workspace = tempfile::tempdir().expect("workspace");
        let observer = Observer::new(
            workspace.path(),
            &ObserveConfig {
                verbose: false,
                telemetry_enabled: true,
                telemetry_endpoint: Some(format!("http://{addr}/collect")),
            },
        )
        .expect("observer");
        observer
            .record("s1", EventKind::IterationStarted { iteration: 1 })
            .expect("record");
        let request = server.join().expect("join server");
        assert!(request.contains("POST /collect"));
    }
}
