//! TLS failures: certificate/key loading, handshakes, bad settings

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to load certificate from {path}: {reason}")]
    CertificateLoad { path: PathBuf, reason: String },

    #[error("Failed to load private key from {path}: {reason}")]
    PrivateKeyLoad { path: PathBuf, reason: String },

    /// The peer went away or sent garbage during the TLS handshake
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error("TLS I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TlsError {
    pub fn cert_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TlsError::CertificateLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn key_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TlsError::PrivateKeyLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        TlsError::Handshake(reason.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        TlsError::Config(reason.into())
    }
}
