//! Relay sessions
//!
//! A [`Session`] pairs one authenticated client leg with one backend leg and
//! copies bytes between them; [`DisconnectReason`] records how it ended.

pub mod relay;

pub use relay::{DisconnectReason, Session};
