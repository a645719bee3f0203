use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// The bytes are not a well-formed envelope at all (framing level).
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The envelope frame parsed but the body does not match the shape
    /// declared by its type code.
    #[error("invalid body for type {type_code}: {reason}")]
    InvalidBody { type_code: u16, reason: String },
}

pub type Result<T> = std::result::Result<T, CodecError>;
