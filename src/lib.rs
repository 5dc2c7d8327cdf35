//! mysql-credential-proxy - MySQL protocol proxy that hides real credentials
//!
//! Clients log in with a fixed fake identity. The proxy logs in to the real
//! database with secret credentials of its own and then relays traffic:
//! - [`server`]: client-facing handshake, command dispatch, relay, listener
//! - [`client`]: backend login with capability mirroring
//! - [`protocol`]: packet framing and MySQL wire codecs
//! - [`config`]: YAML configuration and secret sources
//! - [`tls`]: rustls on either leg
//! - [`buffer_pool`]: pooled relay buffers

#[macro_use]
mod logging;

pub mod buffer_pool;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tls;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use config::{Config, SecretSource};
pub use error::{ProxyError, Result};
pub use server::{InMemoryProvider, Listener, NetworkStream, ProxyContext};
pub use tls::{TlsAcceptor, TlsClientConfig, TlsConnector, TlsError, TlsServerConfig};
