//! TLS for both legs of a proxied session
//!
//! ```text
//! ┌──────────┐   SSLRequest + TLS   ┌───────────┐   SSLRequest + TLS   ┌──────────┐
//! │  Client  │ ──────────────────── │   Proxy   │ ──────────────────── │  MySQL   │
//! └──────────┘   (TlsAcceptor)      └───────────┘   (TlsConnector)     └──────────┘
//! ```
//!
//! MySQL negotiates TLS in-band: the side that wants encryption sends a
//! 32-byte SSLRequest after the greeting, and the TLS handshake starts on
//! the same socket right after it. Both halves are rustls with the ring
//! provider.

mod acceptor;
mod config;
mod connector;
mod error;

pub use acceptor::TlsAcceptor;
pub use config::{TlsClientConfig, TlsServerConfig};
pub use connector::TlsConnector;
pub use error::TlsError;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Every certificate in a PEM file, in file order.
pub(crate) fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))
}

/// The first private key (RSA, PKCS8 or EC) in a PEM file.
pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}
