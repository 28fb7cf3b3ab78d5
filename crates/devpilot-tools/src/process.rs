use anyhow::{Result, anyhow};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }
}

/// Run `program args..` in `cwd` without a shell, killing it after `timeout`.
pub fn run_process(program: &str, args: &[&str], cwd: &Path, timeout: Duration) -> Result<ProcessOutput> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| anyhow!("failed to spawn {program} in '{}': {err}", cwd.display()))?;

    // Drain pipes on helper threads so large outputs never block the child.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let timed_out = match child.wait_timeout(timeout)? {
        Some(_) => false,
        None => {
            child.kill()?;
            true
        }
    };
    let status = child.wait()?;

    Ok(ProcessOutput {
        status: status.code(),
        stdout: join_drain(stdout),
        stderr: join_drain(stderr),
        timed_out,
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    })
}

fn join_drain(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
