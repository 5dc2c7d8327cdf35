//! TLS configuration for both legs of a session
//!
//! - `TlsServerConfig`: what the proxy presents to MySQL clients that send
//!   an SSLRequest.
//! - `TlsClientConfig`: how the proxy upgrades its connection to the real
//!   database when that database advertises CLIENT_SSL.

use serde::Deserialize;
use std::path::PathBuf;

/// Client-facing TLS (`server.tls`)
///
/// ```yaml
/// server:
///   addr: "0.0.0.0:3307"
///   tls:
///     enabled: true
///     cert_path: "/etc/credproxy/server.crt"
///     key_path: "/etc/credproxy/server.key"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsServerConfig {
    /// When set, the greeting advertises CLIENT_SSL.
    #[serde(default)]
    pub enabled: bool,

    /// PEM certificate chain presented to clients
    pub cert_path: Option<PathBuf>,

    /// PEM private key for `cert_path`
    pub key_path: Option<PathBuf>,
}

/// Backend-facing TLS (`confidential.tls`)
///
/// ```yaml
/// confidential:
///   tls:
///     enabled: true
///     ca_path: "/etc/credproxy/ca.pem"
///     cert_path: "/etc/credproxy/client.crt"
///     key_path: "/etc/credproxy/client.key"
///     server_name: "db.internal"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsClientConfig {
    #[serde(default)]
    pub enabled: bool,

    /// CA bundle used to verify the database certificate. Falls back to the
    /// webpki roots when absent.
    pub ca_path: Option<PathBuf>,

    /// Client certificate for mutual TLS. Requires `key_path`.
    pub cert_path: Option<PathBuf>,

    pub key_path: Option<PathBuf>,

    /// Accept any backend certificate. Development only.
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Name checked against the backend certificate; defaults to the
    /// backend host.
    pub server_name: Option<String>,
}

impl TlsServerConfig {
    /// An enabled config needs both the certificate and the key.
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled {
            if self.cert_path.is_none() {
                return Err("TLS enabled but cert_path not specified".to_string());
            }
            if self.key_path.is_none() {
                return Err("TLS enabled but key_path not specified".to_string());
            }
        }
        Ok(())
    }
}

impl TlsClientConfig {
    /// Client certificate and key come as a pair.
    pub fn validate(&self) -> Result<(), String> {
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err("cert_path and key_path must both be specified or both omitted".to_string());
        }
        if let Some(name) = &self.server_name {
            if name.is_empty() {
                return Err("server_name must not be empty".to_string());
            }
        }
        Ok(())
    }

    /// Name used for SNI and certificate verification.
    pub fn server_name_or<'a>(&'a self, host: &'a str) -> &'a str {
        self.server_name.as_deref().unwrap_or(host)
    }
}
