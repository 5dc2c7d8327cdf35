//! Command handlers
//!
//! Implementations of [`Handler`](crate::server::command::Handler) that the
//! dispatcher can drive:
//! - [`EmptyHandler`]: rejects everything
//! - [`MemoryHandler`]: canned in-memory answers
//! - [`ForwardingHandler`]: relays each command to the real database

pub mod empty;
pub mod forward;
pub mod memory;

pub use empty::EmptyHandler;
pub use forward::ForwardingHandler;
pub use memory::{Call, MemoryHandler};
