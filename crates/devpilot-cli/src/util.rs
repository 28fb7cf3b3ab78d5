use anyhow::{Result, anyhow};
use devpilot_core::CancellationToken;
use devpilot_tools::run_process;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Exit status for a second Ctrl-C, matching the cancelled-run exit code.
pub(crate) const EXIT_INTERRUPTED: i32 = 130;

/// Route Ctrl-C to `cancel`. The loop notices it between chunks, during
/// retry backoff, and at the next iteration boundary. A second Ctrl-C, once
/// the token is already set, exits the process even if a read is blocked.
pub(crate) fn install_interrupt_handler(cancel: &CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::SIGINT;
        // Registered first so it checks the flag before this signal sets it.
        signal_hook::flag::register_conditional_shutdown(SIGINT, EXIT_INTERRUPTED, cancel.flag())?;
        signal_hook::flag::register(SIGINT, cancel.flag())?;
    }
    #[cfg(not(unix))]
    {
        let _ = cancel;
    }
    Ok(())
}

/// Prompt on stderr. Returns true for y/yes; empty input means no.
pub(crate) fn prompt_yes_no(prompt: &str) -> Result<bool> {
    let answer = prompt_line(&format!("{prompt} [y/N] "))?;
    Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
}

pub(crate) fn prompt_line(prompt: &str) -> Result<String> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

pub(crate) fn git_commit(workspace: &Path, message: &str, timeout: Duration) -> Result<String> {
    let output = run_process("git", &["commit", "-m", message], workspace, timeout)?;
    if output.timed_out {
        return Err(anyhow!("git commit timed out after {}s", timeout.as_secs()));
    }
    if !output.success() {
        return Err(anyhow!(
            "git commit failed: {}",
            output.stderr.trim().lines().last().unwrap_or("unknown error")
        ));
    }
    Ok(output.stdout.trim().to_string())
}
