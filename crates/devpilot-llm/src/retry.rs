use crate::LlmError;
use devpilot_core::{CancellationToken, LlmConfig};
use std::thread;
use std::time::{Duration, Instant};

/// Base delay for network/transport error retries (1s, 2s, 4s exponential backoff).
pub const NETWORK_RETRY_BASE_MS: u64 = 1000;

const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Bounded retry with exponential backoff around one model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u8,
    /// Base delay for retryable HTTP statuses.
    pub base_ms: u64,
    /// Base delay for transport failures.
    pub network_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_ms: 400,
            network_base_ms: NETWORK_RETRY_BASE_MS,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_ms: cfg.retry_base_ms,
            network_base_ms: cfg.network_retry_base_ms,
        }
    }

    pub fn delay_for(&self, attempt: u8, err: &LlmError) -> Duration {
        match err {
            LlmError::Transport(_) => retry_delay(self.network_base_ms, attempt, None),
            LlmError::Status { retry_after, .. } => retry_delay(self.base_ms, attempt, *retry_after),
            _ => retry_delay(self.base_ms, attempt, None),
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. `on_retry` sees each retried error and the
    /// delay about to be slept. Cancellation is checked before every attempt
    /// and while sleeping.
    pub fn run<T>(
        &self,
        cancel: &CancellationToken,
        mut op: impl FnMut(u8) -> Result<T, LlmError>,
        mut on_retry: impl FnMut(u8, &LlmError, Duration),
    ) -> Result<T, LlmError> {
        let mut attempt: u8 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt, &err);
                    on_retry(attempt, &err, delay);
                    sleep_unless_cancelled(delay, cancel)?;
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub(crate) fn retry_delay(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponent = u32::from(attempt);
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> Result<(), LlmError> {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}
