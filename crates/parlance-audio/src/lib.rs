pub mod error;
pub mod format;
pub mod inbound;
pub mod outbound;

pub use error::AudioError;
pub use format::{AudioFormat, AudioFrame};
pub use inbound::InboundWindow;
pub use outbound::{FramePacer, PacedStats};
