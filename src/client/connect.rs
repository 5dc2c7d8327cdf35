//! Opening the backend leg
//!
//! The proxy logs in to the real database with the secret credential while
//! the client only ever saw the fake identity. A few capability flags and
//! the collation the client negotiated are mirrored onto this login so the
//! backend behaves the way the client expects.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::RemoteMysql;
use crate::error::{ProxyError, Result};
use crate::protocol::mysql::{
    build_handshake_response41, build_ssl_request, compute_auth_for_plugin, is_err_packet,
    parse_auth_switch_request, parse_handshake_v10, Connection, HandshakeResponse41,
    AUTH_MORE_DATA_HEADER, AUTH_NATIVE_PASSWORD, CACHE_SHA2_FAST_AUTH, CACHE_SHA2_FULL_AUTH,
    CLIENT_CONNECT_WITH_DB, CLIENT_SSL, DEFAULT_CLIENT_CAPABILITIES, DEFAULT_COLLATION_ID,
    EOF_HEADER, MAX_PACKET_SIZE, MIRRORED_CAPABILITIES, OK_HEADER,
};
use crate::server::stream::{NetworkStream, TlsUpgrade};
use crate::tls::TlsConnector;

use super::resp::server_error;

/// Client-session properties copied onto the backend login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mirror {
    pub capability: u32,
    pub collation: u8,
}

impl Mirror {
    /// Take the mirrored subset from an authenticated client connection.
    pub fn from_connection<S>(conn: &Connection<S>) -> Self {
        Self {
            capability: conn.capability() & MIRRORED_CAPABILITIES,
            collation: conn.collation(),
        }
    }
}

/// Opens authenticated backend connections for one configured database.
#[derive(Clone)]
pub struct BackendConnector {
    remote: Arc<RemoteMysql>,
    tls: Option<Arc<TlsConnector>>,
    server_name: String,
    connect_timeout: Duration,
}

impl BackendConnector {
    pub fn new(remote: RemoteMysql, connect_timeout: Duration) -> Self {
        let server_name = remote.host.clone();
        Self {
            remote: Arc::new(remote),
            tls: None,
            server_name,
            connect_timeout,
        }
    }

    /// Use TLS when the backend offers it; `server_name` overrides the
    /// configured host for certificate verification.
    pub fn with_tls(mut self, connector: Arc<TlsConnector>, server_name: Option<&str>) -> Self {
        if let Some(name) = server_name.filter(|n| !n.is_empty()) {
            self.server_name = name.to_string();
        }
        self.tls = Some(connector);
        self
    }

    pub fn remote(&self) -> &RemoteMysql {
        &self.remote
    }

    /// Dial the backend and log in. Connect and login share one timeout.
    pub async fn connect(&self, mirror: Mirror) -> Result<Connection<NetworkStream>> {
        let addr = self.remote.addr();
        debug!(backend = %addr, "Connecting to backend");

        let establish = async {
            let stream = TcpStream::connect(&addr).await.map_err(|e| {
                ProxyError::Connection(format!("Failed to connect to {}: {}", addr, e))
            })?;
            // Nagle would delay single-packet commands
            let _ = stream.set_nodelay(true);
            self.handshake(Connection::new(NetworkStream::tcp(stream)), mirror)
                .await
        };

        let conn = timeout(self.connect_timeout, establish)
            .await
            .map_err(|_| ProxyError::Timeout(format!("Connecting to {}", addr)))??;

        debug!(
            backend = %addr,
            encrypted = conn.get_ref().is_encrypted(),
            tls_version = conn.get_ref().tls_version().unwrap_or("none"),
            "Backend session established"
        );
        Ok(conn)
    }

    /// Run the client side of the connection phase on `conn`.
    ///
    /// Returns the connection ready for its first command, with the
    /// negotiated capabilities and mirrored collation recorded on it.
    pub async fn handshake<S: TlsUpgrade>(
        &self,
        mut conn: Connection<S>,
        mirror: Mirror,
    ) -> Result<Connection<S>> {
        let greeting = conn.read_packet().await?;
        if is_err_packet(&greeting) {
            return Err(server_error(&greeting, 0));
        }
        let greeting = parse_handshake_v10(&greeting)?;
        let server_caps = greeting.capability_flags();

        let mut capability = DEFAULT_CLIENT_CAPABILITIES | (mirror.capability & MIRRORED_CAPABILITIES);
        let database = self.remote.database().map(str::to_string);
        if database.is_some() {
            capability |= CLIENT_CONNECT_WITH_DB;
        }
        let collation = if mirror.collation > 0 {
            mirror.collation
        } else {
            DEFAULT_COLLATION_ID
        };

        let mut encrypted = false;
        if let Some(connector) = &self.tls {
            if server_caps & CLIENT_SSL != 0 {
                capability |= CLIENT_SSL;
                conn.write_packet(&build_ssl_request(capability, MAX_PACKET_SIZE, collation))
                    .await?;
                let server_name = self.server_name.as_str();
                conn = conn
                    .upgrade(|stream| stream.connect_tls(connector, server_name))
                    .await?;
                encrypted = true;
            } else {
                warn!(
                    backend = %self.remote.addr(),
                    "Backend does not offer SSL, continuing without TLS"
                );
            }
        }

        let mut plugin = if greeting.auth_plugin_name.is_empty() {
            AUTH_NATIVE_PASSWORD.to_string()
        } else {
            greeting.auth_plugin_name.clone()
        };
        let password = self.remote.password.as_str();
        let response = HandshakeResponse41 {
            capability_flags: capability,
            max_packet_size: MAX_PACKET_SIZE,
            character_set: collation,
            username: self.remote.username.clone(),
            auth_response: compute_auth_for_plugin(&plugin, password, &greeting.get_scramble()),
            database,
            auth_plugin_name: Some(plugin.clone()),
        };
        trace!(
            user = %response.username,
            capability = format_args!("0x{:08X}", capability),
            plugin = %plugin,
            "Sending backend handshake response"
        );
        conn.write_packet(&build_handshake_response41(&response))
            .await?;

        loop {
            let payload = conn.read_packet().await?;
            match payload.first().copied() {
                Some(OK_HEADER) => break,
                Some(EOF_HEADER) => {
                    let (switch_plugin, scramble) = parse_auth_switch_request(&payload)?;
                    debug!(plugin = %switch_plugin, "Backend requested auth switch");
                    plugin = switch_plugin;
                    conn.write_packet(&compute_auth_for_plugin(&plugin, password, &scramble))
                        .await?;
                }
                Some(AUTH_MORE_DATA_HEADER) => match payload.get(1).copied() {
                    Some(CACHE_SHA2_FAST_AUTH) => trace!("caching_sha2_password fast auth"),
                    Some(CACHE_SHA2_FULL_AUTH) if encrypted => {
                        let mut cleartext = Vec::with_capacity(password.len() + 1);
                        cleartext.extend_from_slice(password.as_bytes());
                        cleartext.push(0);
                        conn.write_packet(&cleartext).await?;
                    }
                    Some(CACHE_SHA2_FULL_AUTH) => {
                        return Err(ProxyError::Connection(
                            "caching_sha2_password full authentication requires TLS to the backend"
                                .into(),
                        ))
                    }
                    _ => {
                        return Err(ProxyError::Protocol(format!(
                            "unexpected auth data from backend for plugin {}",
                            plugin
                        )))
                    }
                },
                _ if is_err_packet(&payload) => {
                    let err = server_error(&payload, capability);
                    warn!(backend = %self.remote.addr(), error = %err, "Backend rejected login");
                    return Err(err);
                }
                _ => {
                    return Err(ProxyError::Protocol(
                        "unexpected packet during backend authentication".into(),
                    ))
                }
            }
        }

        conn.set_capabilities(capability & (server_caps | CLIENT_SSL));
        conn.set_collation(collation);
        conn.reset_sequence();
        Ok(conn)
    }
}

impl std::fmt::Debug for BackendConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnector")
            .field("remote", &self.remote)
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
