//! Client-side TLS toward the real database

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;

use crate::tls::{load_certificates, load_private_key, TlsClientConfig, TlsError};

#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Build a connector from `confidential.tls`.
    ///
    /// `insecure_skip_verify` swaps in a verifier that accepts every
    /// certificate; otherwise the CA bundle (or the webpki roots) is used.
    pub fn new(config: &TlsClientConfig) -> Result<Self, TlsError> {
        config.validate().map_err(TlsError::config)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?;

        let builder = if config.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        } else {
            builder.with_root_certificates(build_root_store(config)?)
        };

        let client_config = match (&config.cert_path, &config.key_path) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certificates(cert_path)?;
                if certs.is_empty() {
                    return Err(TlsError::cert_load(cert_path, "no certificates found in file"));
                }
                let key = load_private_key(key_path)?;
                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    TlsError::config(format!("Failed to build client TLS config: {}", e))
                })?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Accept-anything connector, for tests and self-signed lab databases.
    pub fn new_insecure() -> Result<Self, TlsError> {
        Self::new(&TlsClientConfig {
            enabled: true,
            insecure_skip_verify: true,
            ..Default::default()
        })
    }

    /// Run the TLS handshake over `stream`, verifying against `server_name`.
    pub async fn connect<S>(&self, stream: S, server_name: &str) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::config(format!("Invalid server name: {}", server_name)))?;

        self.inner
            .connect(name, stream)
            .await
            .map_err(|e| TlsError::handshake(e.to_string()))
    }
}

fn build_root_store(config: &TlsClientConfig) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    match &config.ca_path {
        Some(ca_path) => {
            for cert in load_certificates(ca_path)? {
                root_store
                    .add(cert)
                    .map_err(|e| TlsError::cert_load(ca_path, e.to_string()))?;
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(root_store)
}

#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
