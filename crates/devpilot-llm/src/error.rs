use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("API error (HTTP {status}): {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<u64>,
    },

    #[error("missing API key: set {0} or configure llm.api_key in settings")]
    MissingApiKey(String),

    #[error("request cancelled")]
    Cancelled,
}

impl LlmError {
    /// Transport failures, rate limits and server errors are retried;
    /// auth and cancellation errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transport(_) => true,
            LlmError::Status { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            LlmError::Auth { .. }
            | LlmError::MissingApiKey(_)
            | LlmError::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LlmError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(LlmError::Transport("reset".to_string()).is_retryable());
        for status in [429, 500, 502, 503, 504] {
            let err = LlmError::Status {
                status,
                message: String::new(),
                retry_after: None,
            };
            assert!(err.is_retryable(), "{status} should retry");
        }
        let bad_request = LlmError::Status {
            status: 400,
            message: "bad".to_string(),
            retry_after: None,
        };
        assert!(!bad_request.is_retryable());
        assert!(
            !LlmError::Auth {
                status: 401,
                message: "invalid key".to_string()
            }
            .is_retryable()
        );
        assert!(!LlmError::Cancelled.is_retryable());
        assert!(LlmError::Cancelled.is_cancelled());
    }
}
