use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParlanceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Conversation not found: {id}")]
    ConversationNotFound { id: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ParlanceError {
    /// Stable error code string carried in outbound Error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ParlanceError::Config(_) => "config-error",
            ParlanceError::Protocol(_) => "protocol-invalid",
            ParlanceError::ConversationNotFound { .. } => "not-found",
            ParlanceError::Storage(_) => "store-failed",
            ParlanceError::Backend(_) => "backend-failed",
            ParlanceError::Transport(_) => "transport-failed",
            ParlanceError::Serialization(_) => "serialization-error",
            ParlanceError::Io(_) => "io-error",
            ParlanceError::Internal(_) => "internal-error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ParlanceError>;
