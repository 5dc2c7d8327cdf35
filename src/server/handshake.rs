//! Server side of the connection phase
//!
//! The proxy plays MySQL server toward its clients and authenticates them
//! against the fake identity held by a [`CredentialProvider`]:
//!
//! ```text
//! Idle ──greeting──▶ GreetingSent ──response──▶ AuthDataReceived ──┬─▶ Authenticated
//!                                                                  └─▶ Rejected
//! ```
//!
//! [`ServerHandshake::accept`] stops at `Authenticated` without writing the
//! final OK. The caller opens the backend leg first and then reports the
//! outcome with [`ServerHandshake::finish`], so a client is never told it is
//! connected to a database the proxy could not reach.

use crate::error::{ProxyError, Result};
use crate::protocol::mysql::{
    build_auth_switch_request, build_err_packet, build_handshake_v10, build_ok_packet,
    check_native_password, generate_scramble, read_length_encoded_string, take, Connection,
    HandshakeV10, OkPacket, AUTH_NATIVE_PASSWORD, CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH,
    CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION,
    CLIENT_SSL, DEFAULT_SERVER_CAPABILITIES,
};
use crate::server::credential::CredentialProvider;
use crate::server::stream::TlsUpgrade;
use crate::tls::TlsAcceptor;

/// Capabilities (4) + max packet size (4) + charset (1) + reserved (23)
const SSL_REQUEST_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    GreetingSent,
    AuthDataReceived,
    Authenticated,
    Rejected,
    Closed,
}

/// Per-client connection-phase state.
#[derive(Debug)]
pub struct ServerHandshake {
    state: HandshakeState,
    connection_id: u32,
    scramble: [u8; 20],
    server_capability: u32,
    /// Flags sent by the client until authentication succeeds, the
    /// negotiated set afterwards.
    capability: u32,
    charset: u8,
    user: String,
    database: Option<String>,
    auth_plugin: String,
    peer: String,
}

impl ServerHandshake {
    /// `peer` appears in access-denied messages.
    pub fn new(connection_id: u32, peer: impl Into<String>) -> Self {
        Self {
            state: HandshakeState::Idle,
            connection_id,
            scramble: generate_scramble(),
            server_capability: DEFAULT_SERVER_CAPABILITIES,
            capability: 0,
            charset: 0,
            user: String::new(),
            database: None,
            auth_plugin: AUTH_NATIVE_PASSWORD.to_string(),
            peer: peer.into(),
        }
    }

    /// Advertise CLIENT_SSL in the greeting.
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.server_capability |= CLIENT_SSL;
        } else {
            self.server_capability &= !CLIENT_SSL;
        }
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn capability(&self) -> u32 {
        self.capability
    }

    pub fn charset(&self) -> u8 {
        self.charset
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn scramble(&self) -> &[u8; 20] {
        &self.scramble
    }

    /// HandshakeV10 payload carrying this session's challenge.
    pub fn greeting(&self) -> Vec<u8> {
        let greeting =
            HandshakeV10::with_scramble(&self.scramble, self.server_capability, self.connection_id);
        build_handshake_v10(&greeting)
    }

    /// Fixed-size head of a HandshakeResponse41 (or an SSLRequest).
    ///
    /// Records the client's capability flags and charset and returns the
    /// offset of the username.
    pub fn decode_first_part(&mut self, data: &[u8]) -> Result<usize> {
        let head = take(data, 0, 9).map_err(|_| ProxyError::BadHandshake)?;
        let capability = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        if capability & CLIENT_PROTOCOL_41 == 0 {
            return Err(ProxyError::Protocol(
                "CLIENT_PROTOCOL_41 compatible client is required".into(),
            ));
        }
        self.capability = capability;
        // max packet size is ignored
        self.charset = head[8];
        Ok(4 + 4 + 1 + 23)
    }

    /// An SSLRequest is the fixed head alone with CLIENT_SSL set.
    pub fn is_ssl_request(&self, data: &[u8]) -> bool {
        data.len() == SSL_REQUEST_LEN && self.capability & CLIENT_SSL != 0
    }

    /// NUL-terminated username at `pos`; returns the offset past the NUL.
    pub fn read_username(&mut self, data: &[u8], pos: usize) -> Result<usize> {
        let (user, next) = read_cstr(data, pos)?;
        self.user = user;
        Ok(next)
    }

    /// Auth response at `pos`, encoded per the client's flags.
    ///
    /// Returns `(auth, auth_len, pos)`: the response bytes, the number of
    /// bytes the field occupies after `pos`, and `pos` advanced past any
    /// 1-byte length prefix. Callers continue at `pos + auth_len`.
    pub fn read_auth_data(&self, data: &[u8], pos: usize) -> Result<(Vec<u8>, usize, usize)> {
        if self.capability & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            let rest = data.get(pos..).ok_or(ProxyError::BadHandshake)?;
            let (auth, read) =
                read_length_encoded_string(rest).map_err(|_| ProxyError::BadHandshake)?;
            // a NULL auth field is invalid auth data
            let auth = auth.ok_or_else(|| self.access_denied(true))?;
            Ok((auth.to_vec(), read, pos))
        } else if self.capability & CLIENT_SECURE_CONNECTION != 0 {
            let len = take(data, pos, 1).map_err(|_| ProxyError::BadHandshake)?[0] as usize;
            let mut pos = pos + 1;
            let auth = take(data, pos, len)
                .map_err(|_| ProxyError::BadHandshake)?
                .to_vec();
            if len == 0 {
                // an empty password is followed by a stray NUL
                pos += 1;
            }
            Ok((auth, len, pos))
        } else {
            let (_, next) = read_cstr(data, pos)?;
            let auth = data[pos..next - 1].to_vec();
            Ok((auth, next - pos, pos))
        }
    }

    /// Database name when CLIENT_CONNECT_WITH_DB is set and bytes remain.
    pub fn read_db(&mut self, data: &[u8], pos: usize) -> Result<usize> {
        if self.capability & CLIENT_CONNECT_WITH_DB == 0 || pos >= data.len() {
            return Ok(pos);
        }
        let (db, next) = read_cstr(data, pos)?;
        if !db.is_empty() {
            self.database = Some(db);
        }
        Ok(next)
    }

    /// Client auth plugin. Absent means mysql_native_password; an
    /// unterminated name runs to the end of the packet.
    pub fn read_plugin_name(&mut self, data: &[u8], pos: usize) -> usize {
        if self.capability & CLIENT_PLUGIN_AUTH == 0 || pos >= data.len() {
            return pos;
        }
        match read_cstr(data, pos) {
            Ok((name, next)) => {
                if !name.is_empty() {
                    self.auth_plugin = name;
                }
                next
            }
            Err(_) => {
                self.auth_plugin = String::from_utf8_lossy(&data[pos..]).into_owned();
                data.len()
            }
        }
    }

    /// Decode a complete HandshakeResponse41; returns the auth response.
    pub fn decode_response(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let pos = self.decode_first_part(data)?;
        let pos = self.read_username(data, pos)?;
        let (auth, auth_len, pos) = self.read_auth_data(data, pos)?;
        let pos = self.read_db(data, pos + auth_len)?;
        self.read_plugin_name(data, pos);
        // connection attributes, if any, are not used
        self.state = HandshakeState::AuthDataReceived;
        Ok(auth)
    }

    /// Whether the client answered with a plugin other than the one the
    /// greeting announced.
    pub fn needs_auth_switch(&self) -> bool {
        self.auth_plugin != AUTH_NATIVE_PASSWORD
    }

    /// Check a mysql_native_password response against the provider.
    ///
    /// Unknown users and wrong passwords are indistinguishable to the client.
    pub fn verify(&mut self, provider: &dyn CredentialProvider, auth: &[u8]) -> Result<()> {
        let accepted = provider
            .get_credential(&self.user)
            .map(|password| check_native_password(auth, &self.scramble, &password))
            .unwrap_or(false);

        if accepted {
            self.capability &= self.server_capability;
            self.state = HandshakeState::Authenticated;
            Ok(())
        } else {
            self.state = HandshakeState::Rejected;
            Err(self.access_denied(!auth.is_empty()))
        }
    }

    fn access_denied(&self, using_password: bool) -> ProxyError {
        ProxyError::AccessDenied {
            user: self.user.clone(),
            host: self.peer.clone(),
            using_password,
        }
    }

    /// Run the connection phase up to (not including) the final OK.
    ///
    /// On success the returned connection carries the negotiated
    /// capabilities and collation. Decode and credential failures are
    /// reported to the client before the error is returned.
    pub async fn accept<S: TlsUpgrade>(
        &mut self,
        mut conn: Connection<S>,
        provider: &dyn CredentialProvider,
        tls: Option<&TlsAcceptor>,
    ) -> Result<Connection<S>> {
        conn.write_packet(&self.greeting()).await?;
        self.state = HandshakeState::GreetingSent;

        let mut data = conn.read_packet().await?;
        if let Err(err) = self.decode_first_part(&data) {
            self.state = HandshakeState::Rejected;
            self.write_error(&mut conn, &err).await;
            return Err(err);
        }

        if self.is_ssl_request(&data) {
            let Some(acceptor) = tls else {
                warn!(client = %self.peer, "Client requested SSL, but TLS is not configured");
                self.state = HandshakeState::Rejected;
                let err = ProxyError::Connection(format!(
                    "The host '{}' does not support SSL connections",
                    self.peer
                ));
                let _ = conn
                    .write_packet(&build_err_packet(&err.to_err_packet(), CLIENT_PROTOCOL_41))
                    .await;
                return Err(err);
            };

            debug!(client = %self.peer, "Upgrading client connection to TLS");
            conn = conn
                .upgrade(|stream| stream.accept_tls(acceptor))
                .await
                .inspect_err(|_| self.state = HandshakeState::Rejected)?;
            data = conn.read_packet().await?;
        }

        let mut auth = match self.decode_response(&data) {
            Ok(auth) => auth,
            Err(err) => {
                self.state = HandshakeState::Rejected;
                self.write_error(&mut conn, &err).await;
                return Err(err);
            }
        };

        if self.needs_auth_switch() {
            debug!(
                client = %self.peer,
                plugin = %self.auth_plugin,
                "Switching client to mysql_native_password"
            );
            conn.write_packet(&build_auth_switch_request(AUTH_NATIVE_PASSWORD, &self.scramble))
                .await?;
            auth = conn.read_packet().await?;
            self.auth_plugin = AUTH_NATIVE_PASSWORD.to_string();
        }

        if let Err(err) = self.verify(provider, &auth) {
            warn!(client = %self.peer, user = %self.user, "Client authentication failed");
            self.write_error(&mut conn, &err).await;
            return Err(err);
        }

        conn.set_capabilities(self.capability);
        if self.charset > 0 {
            conn.set_collation(self.charset);
        }
        debug!(
            client = %self.peer,
            user = %self.user,
            capability = format_args!("0x{:08X}", self.capability),
            "Client authenticated"
        );
        Ok(conn)
    }

    /// Send the last packet of the connection phase: OK if the session was
    /// set up, otherwise an ERR describing why.
    ///
    /// The sequence is reset afterwards so the command phase starts at 0.
    pub async fn finish<S: TlsUpgrade>(
        &mut self,
        conn: &mut Connection<S>,
        outcome: &Result<()>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => {
                conn.write_packet(&build_ok_packet(&OkPacket::default(), conn.capability()))
                    .await?;
                conn.reset_sequence();
                Ok(())
            }
            Err(err) => {
                self.state = HandshakeState::Closed;
                self.write_error(conn, err).await;
                Ok(())
            }
        }
    }

    async fn write_error<S: TlsUpgrade>(&self, conn: &mut Connection<S>, err: &ProxyError) {
        let payload = build_err_packet(&err.to_err_packet(), CLIENT_PROTOCOL_41);
        if let Err(e) = conn.write_packet(&payload).await {
            debug!(client = %self.peer, error = %e, "Failed to send handshake error");
        }
    }

    pub fn close(&mut self) {
        self.state = HandshakeState::Closed;
    }
}

/// NUL-terminated string at `pos`, returning the offset past the NUL.
fn read_cstr(data: &[u8], pos: usize) -> Result<(String, usize)> {
    let rest = data.get(pos..).ok_or(ProxyError::BadHandshake)?;
    let len = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProxyError::BadHandshake)?;
    Ok((
        String::from_utf8_lossy(&rest[..len]).into_owned(),
        pos + len + 1,
    ))
}
