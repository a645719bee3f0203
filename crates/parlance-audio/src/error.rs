use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    /// The frame sink was closed mid-stream (transport went away).
    #[error("audio sink closed")]
    SinkClosed,

    #[error("unsupported audio format: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;
