use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures talking to the completion endpoint.
///
/// Every variant is recovered by the caller (the analyzer or synthesizer
/// degrades the batch to an empty contribution); none of them aborts a cycle.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport failure: {reason}")]
    Transport { reason: String },

    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The endpoint rejected the prompt as larger than its context window.
    /// Never retried.
    #[error("prompt exceeds the model context window: {detail}")]
    ContextLengthExceeded { detail: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl LlmError {
    /// Returns `true` if another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transport { .. } | LlmError::Timeout { .. } => true,
            LlmError::Status { status, .. } => matches!(status, 408 | 429 | 500 | 502 | 503 | 504),
            LlmError::ContextLengthExceeded { .. } | LlmError::InvalidResponse { .. } => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Transport {
            reason: e.to_string(),
        }
    }
}

/// Fatal setup errors. These abort the run before any model call is made.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no conversation export files found in {}", dir.display())]
    NoExportFiles { dir: PathBuf },

    #[error("conversation produced no interaction blocks")]
    NoInteractions,

    #[error("two personas are required, found {found}")]
    MissingPersonas { found: usize },

    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_overflow_is_not_retryable() {
        let err = LlmError::ContextLengthExceeded {
            detail: "8192 tokens".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        for status in [429, 500, 503] {
            let err = LlmError::Status {
                status,
                body: String::new(),
            };
            assert!(err.is_retryable(), "status {status}");
        }
        let err = LlmError::Status {
            status: 401,
            body: String::new(),
        };
        assert!(!err.is_retryable());
    }
}
