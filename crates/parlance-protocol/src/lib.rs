pub mod codec;
pub mod envelope;
pub mod error;
pub mod replay;
pub mod sequence;

pub use codec::{decode, encode};
pub use envelope::{Body, Envelope};
pub use error::{CodecError, Result};
pub use replay::{ReplayBuffer, ReplayEntry};
pub use sequence::{Admission, StanzaLedger};
