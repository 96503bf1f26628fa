//! Task lifetime, heartbeat, and pub/sub cancellation.

pub mod bus;
pub mod context;

pub use bus::MessageBus;
pub use context::{MessageType, TaskContext};
