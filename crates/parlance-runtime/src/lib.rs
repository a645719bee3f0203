pub mod actor;
pub mod dispatch;
pub mod error;
pub mod transport;

pub use actor::{ActorEvent, ActorHandle, RuntimeConfig};
pub use dispatch::Dispatcher;
pub use error::RuntimeError;
pub use transport::{MemoryTransport, RoomTransport, TransportError};
