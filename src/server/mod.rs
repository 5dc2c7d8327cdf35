//! Client-facing half of the proxy
//!
//! This module contains:
//! - TCP listener and per-client pipeline
//! - Server-side handshake against the fake identity
//! - Command dispatcher and handlers (inspect mode)
//! - Raw relay sessions
//! - Network stream abstraction (TCP/TLS)

pub mod command;
pub mod connection;
pub mod credential;
pub mod handlers;
pub mod handshake;
pub mod listener;
pub mod resultset;
pub mod session;
pub mod stream;

pub use command::{Handler, PreparedStatement, ServerConn, Value};
pub use connection::{ClientConnection, ProxyContext};
pub use credential::{CredentialProvider, InMemoryProvider};
pub use handshake::ServerHandshake;
pub use listener::{Listener, ListenerStats};
pub use resultset::{QueryResult, ResultSet, RowFormat};
pub use session::{DisconnectReason, Session};
pub use stream::NetworkStream;
