use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("actor inbox full for room {room}")]
    InboxFull { room: String },

    #[error("no actor for room {room}")]
    NoActor { room: String },

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}
