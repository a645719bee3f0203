use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("Deadline exceeded after {secs}s")]
    Timeout { secs: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Retry budget exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl BackendError {
    /// Transient errors are worth retrying within the budget; anything else
    /// (4xx misconfiguration, parse failures, cancellation) is not.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            BackendError::Api { status, .. } => *status >= 500 || *status == 429,
            BackendError::Timeout { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
