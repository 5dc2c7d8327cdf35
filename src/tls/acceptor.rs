//! Server-side TLS: upgrades a client socket after an SSLRequest

use std::sync::Arc;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;

use crate::tls::{load_certificates, load_private_key, TlsError, TlsServerConfig};

/// Cheap to clone; one instance is shared by every accepted connection.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Load the certificate chain and key named by `config`.
    pub fn new(config: &TlsServerConfig) -> Result<Self, TlsError> {
        config.validate().map_err(TlsError::config)?;

        let cert_path = config
            .cert_path
            .as_ref()
            .ok_or_else(|| TlsError::config("cert_path is required"))?;
        let key_path = config
            .key_path
            .as_ref()
            .ok_or_else(|| TlsError::config("key_path is required"))?;

        let certs = load_certificates(cert_path)?;
        if certs.is_empty() {
            return Err(TlsError::cert_load(cert_path, "no certificates found in file"));
        }
        let key = load_private_key(key_path)?;

        let provider = rustls::crypto::ring::default_provider();
        let server_config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::config(format!("Failed to build TLS config: {}", e)))?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Run the TLS handshake over `stream`.
    pub async fn accept<S>(&self, stream: S) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::handshake(e.to_string()))
    }
}
