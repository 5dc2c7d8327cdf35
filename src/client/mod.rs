//! The proxy acting as a MySQL client toward the real database
//!
//! - [`connect`]: dial, TLS upgrade, login with the secret credential
//! - [`req`]: command packet writers
//! - [`resp`]: readers for complete backend responses

pub mod connect;
pub mod req;
pub mod resp;

pub use connect::{BackendConnector, Mirror};
