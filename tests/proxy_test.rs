//! End-to-end tests for mysql-credential-proxy
//!
//! Each test starts the real listener on an ephemeral port in front of an
//! in-process fake MySQL server built from the crate's own packet codec.
//! The fake server only accepts the secret credential, so a successful
//! query proves the proxy swapped identities.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use mysql_credential_proxy::config::load_config_from_str;
use mysql_credential_proxy::protocol::mysql::{
    build_column_definition, build_eof_packet, build_err_packet, build_handshake_response41,
    build_handshake_v10, build_ok_packet, check_native_password, compute_auth_response,
    parse_err_packet, parse_handshake_response41, parse_handshake_v10, read_length_encoded_string,
    write_length_encoded_string, ColumnDefinition, Connection, EofPacket, ErrPacket,
    HandshakeResponse41, HandshakeV10, OkPacket, AUTH_NATIVE_PASSWORD, CLIENT_LONG_PASSWORD,
    CLIENT_MULTI_STATEMENTS, CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION,
    CLIENT_TRANSACTIONS, COM_INIT_DB, COM_PING, COM_QUERY, COM_QUIT, DEFAULT_SERVER_CAPABILITIES,
    ER_ACCESS_DENIED_ERROR, ER_HANDSHAKE_ERROR, ER_UNKNOWN_COM_ERROR, ER_UNKNOWN_ERROR,
};
use mysql_credential_proxy::server::ListenerStats;
use mysql_credential_proxy::{Listener, ProxyContext, Result};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const BACKEND_SCRAMBLE: [u8; 20] = *b"0123456789abcdefghij";

// ============================================================================
// Fake MySQL server
// ============================================================================

#[derive(Clone)]
struct FakeBackend {
    /// Handshake responses of successful logins, in order
    logins: Arc<Mutex<Vec<HandshakeResponse41>>>,
    /// Every query text received, across all connections
    queries: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    /// Drop the connection instead of answering the next `SELECT flaky`
    fail_next: Arc<AtomicBool>,
    /// Closes every open connection while it waits for a command
    kill: broadcast::Sender<()>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            logins: Arc::default(),
            queries: Arc::default(),
            connections: Arc::default(),
            fail_next: Arc::default(),
            kill: broadcast::channel(4).0,
        }
    }
}

impl FakeBackend {
    async fn start(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let backend = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                backend.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(backend.clone().serve(stream));
            }
        });
        addr
    }

    fn logins(&self) -> Vec<HandshakeResponse41> {
        self.logins.lock().unwrap().clone()
    }

    fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    async fn serve(self, stream: TcpStream) -> Result<()> {
        let mut kill_rx = self.kill.subscribe();
        let mut conn = Connection::new(stream);
        let greeting =
            HandshakeV10::with_scramble(&BACKEND_SCRAMBLE, DEFAULT_SERVER_CAPABILITIES, 99);
        conn.write_packet(&build_handshake_v10(&greeting)).await?;

        let response = parse_handshake_response41(&conn.read_packet().await?)?;
        if response.username != "real_user"
            || !check_native_password(&response.auth_response, &BACKEND_SCRAMBLE, "real_pw")
        {
            let err = ErrPacket::access_denied(&response.username, "proxy", true);
            conn.write_packet(&build_err_packet(&err, CLIENT_PROTOCOL_41))
                .await?;
            return Ok(());
        }
        self.logins.lock().unwrap().push(response);
        conn.write_packet(&build_ok_packet(&OkPacket::default(), CLIENT_PROTOCOL_41))
            .await?;

        loop {
            conn.reset_sequence();
            let packet = tokio::select! {
                packet = conn.read_packet() => match packet {
                    Ok(packet) => packet,
                    Err(_) => return Ok(()),
                },
                _ = kill_rx.recv() => return Ok(()),
            };
            if packet[0] == COM_QUERY {
                let text = String::from_utf8_lossy(&packet[1..]).into_owned();
                self.queries.lock().unwrap().push(text);
            }
            match (packet[0], &packet[1..]) {
                (COM_QUIT, _) => return Ok(()),
                (COM_QUERY, b"SELECT 1") => write_single_value(&mut conn, "1", "1").await?,
                (COM_QUERY, b"SELECT flaky") => {
                    if self.fail_next.swap(false, Ordering::SeqCst) {
                        return Ok(());
                    }
                    write_single_value(&mut conn, "state", "recovered").await?
                }
                (COM_PING, _) | (COM_INIT_DB, _) => {
                    conn.write_packet(&build_ok_packet(&OkPacket::default(), CLIENT_PROTOCOL_41))
                        .await?
                }
                _ => {
                    let err = ErrPacket::new(ER_UNKNOWN_COM_ERROR, "Unknown command");
                    conn.write_packet(&build_err_packet(&err, CLIENT_PROTOCOL_41))
                        .await?
                }
            }
        }
    }
}

/// One-column, one-row text result set.
async fn write_single_value(
    conn: &mut Connection<TcpStream>,
    column: &str,
    value: &str,
) -> Result<()> {
    let eof = build_eof_packet(&EofPacket::default(), CLIENT_PROTOCOL_41);
    let mut row = Vec::new();
    write_length_encoded_string(&mut row, value.as_bytes());

    conn.write_packet(&[1]).await?;
    conn.write_packet(&build_column_definition(&ColumnDefinition::new(column)))
        .await?;
    conn.write_packet(&eof).await?;
    conn.write_packet(&row).await?;
    conn.write_packet(&eof).await
}

// ============================================================================
// Proxy and client helpers
// ============================================================================

struct Proxy {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    stats: Arc<ListenerStats>,
    handle: JoinHandle<Result<()>>,
}

async fn start_proxy(backend: SocketAddr, mode: &str, max_connections: usize) -> Proxy {
    start_proxy_with_secret(backend, mode, max_connections, "real_pw").await
}

/// Like [`start_proxy`], with `password` stored as the backend secret.
async fn start_proxy_with_secret(
    backend: SocketAddr,
    mode: &str,
    max_connections: usize,
    password: &str,
) -> Proxy {
    let yaml = format!(
        r#"
server:
  addr: "127.0.0.1:0"
  mode: {mode}
  connect_timeout_secs: 5
  max_connections: {max_connections}
fakeIdentity:
  username: proxyuser
  password: secret
confidential:
  storage: yaml
  yaml:
    host: 127.0.0.1
    port: {port}
    username: real_user
    password: {password}
    dbname: shop
"#,
        port = backend.port()
    );
    let config = Arc::new(load_config_from_str(&yaml).unwrap());
    let ctx = Arc::new(ProxyContext::from_config(config).unwrap());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let listener = Listener::bind(ctx, shutdown_rx).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = listener.stats();
    let handle = tokio::spawn(listener.run());

    Proxy {
        addr,
        shutdown_tx,
        stats,
        handle,
    }
}

/// Log in to the proxy; returns the connection and the final
/// connection-phase packet (OK or ERR).
async fn login(
    proxy: SocketAddr,
    user: &str,
    password: &str,
) -> (Connection<TcpStream>, Vec<u8>) {
    let mut conn = Connection::new(TcpStream::connect(proxy).await.unwrap());
    let greeting = parse_handshake_v10(&conn.read_packet().await.unwrap()).unwrap();
    assert_eq!(greeting.auth_plugin_name, AUTH_NATIVE_PASSWORD);

    let response = HandshakeResponse41 {
        capability_flags: CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_LONG_PASSWORD
            | CLIENT_TRANSACTIONS
            | CLIENT_PLUGIN_AUTH
            | CLIENT_MULTI_STATEMENTS,
        character_set: 45,
        username: user.to_string(),
        auth_response: compute_auth_response(password, &greeting.get_scramble()),
        auth_plugin_name: Some(AUTH_NATIVE_PASSWORD.to_string()),
        ..Default::default()
    };
    conn.write_packet(&build_handshake_response41(&response))
        .await
        .unwrap();
    let reply = conn.read_packet().await.unwrap();
    (conn, reply)
}

async fn query(conn: &mut Connection<TcpStream>, sql: &str) -> Vec<Vec<u8>> {
    let mut payload = vec![COM_QUERY];
    payload.extend_from_slice(sql.as_bytes());
    conn.reset_sequence();
    conn.write_packet(&payload).await.unwrap();

    let first = conn.read_packet().await.unwrap();
    if first[0] == 0xFF {
        return vec![first];
    }
    // count, column definition, EOF, row, EOF
    let mut packets = vec![first];
    for _ in 0..4 {
        packets.push(conn.read_packet().await.unwrap());
    }
    packets
}

fn row_value(packets: &[Vec<u8>]) -> String {
    let (value, _) = read_length_encoded_string(&packets[3]).unwrap();
    String::from_utf8(value.unwrap().to_vec()).unwrap()
}

macro_rules! with_timeout {
    ($body:expr) => {
        match timeout(TEST_TIMEOUT, async { $body }).await {
            Ok(result) => result,
            Err(_) => panic!("Test timed out after {:?}", TEST_TIMEOUT),
        }
    };
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_relay_mode_swaps_credentials() {
    with_timeout!({
        let backend = FakeBackend::default();
        let proxy = start_proxy(backend.start().await, "relay", 0).await;

        let (mut client, reply) = login(proxy.addr, "proxyuser", "secret").await;
        assert_eq!(reply[0], 0x00, "expected OK, got {:?}", reply);

        let packets = query(&mut client, "SELECT 1").await;
        assert_eq!(packets.len(), 5);
        assert_eq!(row_value(&packets), "1");

        // backend saw the secret account with the client's options mirrored
        let logins = backend.logins();
        assert_eq!(logins.len(), 1);
        assert_eq!(logins[0].username, "real_user");
        assert_eq!(logins[0].database.as_deref(), Some("shop"));
        assert_eq!(logins[0].character_set, 45);
        assert_ne!(logins[0].capability_flags & CLIENT_MULTI_STATEMENTS, 0);

        conn_quit(&mut client).await;
        let _ = proxy.shutdown_tx.send(());
        proxy.handle.await.unwrap().unwrap();
        assert_eq!(proxy.stats.connections_accepted.load(Ordering::Relaxed), 1);
    });
}

async fn conn_quit(conn: &mut Connection<TcpStream>) {
    conn.reset_sequence();
    conn.write_packet(&[COM_QUIT]).await.unwrap();
    // proxy closes the client leg once the backend goes away
    assert!(conn.read_packet().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_fake_password_is_denied() {
    with_timeout!({
        let backend = FakeBackend::default();
        let proxy = start_proxy(backend.start().await, "relay", 0).await;

        let (_client, reply) = login(proxy.addr, "proxyuser", "wrong").await;
        let err = parse_err_packet(&reply, CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(err.error_code, ER_ACCESS_DENIED_ERROR);
        assert_eq!(&err.sql_state, b"28000");

        // the real credential is the only one that reaches the database,
        // and only after the client authenticated
        let (_client, reply) = login(proxy.addr, "real_user", "real_pw").await;
        assert_eq!(reply[0], 0xFF);
        assert_eq!(backend.connections.load(Ordering::SeqCst), 0);

        let _ = proxy.shutdown_tx.send(());
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_truncated_handshake_is_bad_handshake() {
    with_timeout!({
        let backend = FakeBackend::default();
        let proxy = start_proxy(backend.start().await, "relay", 0).await;

        let mut conn = Connection::new(TcpStream::connect(proxy.addr).await.unwrap());
        conn.read_packet().await.unwrap();

        let mut payload = Vec::new();
        payload.extend_from_slice(&(CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION).to_le_bytes());
        payload.extend_from_slice(&0x0100_0000u32.to_le_bytes());
        payload.push(45);
        payload.extend_from_slice(&[0u8; 23]);
        payload.extend_from_slice(b"proxyuser\0");
        // claims 20 bytes of auth data, carries 3
        payload.extend_from_slice(&[20, 1, 2, 3]);
        conn.write_packet(&payload).await.unwrap();

        let reply = conn.read_packet().await.unwrap();
        let err = parse_err_packet(&reply, CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(err.error_code, ER_HANDSHAKE_ERROR);
        assert_eq!(backend.connections.load(Ordering::SeqCst), 0);

        let _ = proxy.shutdown_tx.send(());
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_backend_fails_login() {
    with_timeout!({
        // bind then drop to get a port with nothing listening
        let closed = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let proxy = start_proxy(closed, "relay", 0).await;

        let (mut client, reply) = login(proxy.addr, "proxyuser", "secret").await;
        let err = parse_err_packet(&reply, CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(err.error_code, ER_UNKNOWN_ERROR);
        // the backend address stays on the proxy side
        assert!(!err.error_message.contains("127.0.0.1"));
        assert!(!err.error_message.contains(&closed.port().to_string()));
        // never left half-open
        assert!(client.read_packet().await.is_err());

        let _ = proxy.shutdown_tx.send(());
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backend_rejection_hides_real_account() {
    with_timeout!({
        let backend = FakeBackend::default();
        let proxy = start_proxy_with_secret(backend.start().await, "relay", 0, "stale_pw").await;

        let (mut client, reply) = login(proxy.addr, "proxyuser", "secret").await;
        let err = parse_err_packet(&reply, CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(err.error_code, ER_UNKNOWN_ERROR);
        assert_eq!(err.error_message, "failed to connect to remote mysql");
        assert!(!err.error_message.contains("real_user"));
        assert_eq!(backend.connections.load(Ordering::SeqCst), 1);
        assert!(backend.logins().is_empty());
        assert!(client.read_packet().await.is_err());

        let _ = proxy.shutdown_tx.send(());
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inspect_mode_forwards_and_recovers_backend() {
    with_timeout!({
        let backend = FakeBackend::default();
        let proxy = start_proxy(backend.start().await, "inspect", 0).await;

        let (mut client, reply) = login(proxy.addr, "proxyuser", "secret").await;
        assert_eq!(reply[0], 0x00);

        let packets = query(&mut client, "SELECT 1").await;
        assert_eq!(row_value(&packets), "1");

        // backend goes away between commands; the proxy reconnects first
        backend.kill.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let packets = query(&mut client, "SELECT 1").await;
        assert_eq!(row_value(&packets), "1");
        assert_eq!(backend.logins().len(), 2);
        assert_eq!(backend.queries(), vec!["SELECT 1", "SELECT 1"]);

        // backend errors are forwarded and the session stays usable
        let packets = query(&mut client, "SHOW NOTHING").await;
        let err = parse_err_packet(&packets[0], CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(err.error_code, ER_UNKNOWN_COM_ERROR);

        client.reset_sequence();
        client.write_packet(&[COM_PING]).await.unwrap();
        assert_eq!(client.read_packet().await.unwrap()[0], 0x00);

        client.reset_sequence();
        client.write_packet(&[COM_QUIT]).await.unwrap();
        assert!(client.read_packet().await.is_err());

        let _ = proxy.shutdown_tx.send(());
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inspect_mode_never_resends_delivered_command() {
    with_timeout!({
        let backend = FakeBackend::default();
        let proxy = start_proxy(backend.start().await, "inspect", 0).await;

        let (mut client, reply) = login(proxy.addr, "proxyuser", "secret").await;
        assert_eq!(reply[0], 0x00);

        // backend reads the command, then drops without answering
        backend.fail_next.store(true, Ordering::SeqCst);
        let packets = query(&mut client, "SELECT flaky").await;
        let err = parse_err_packet(&packets[0], CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(err.error_code, ER_UNKNOWN_ERROR);

        assert_eq!(backend.queries(), vec!["SELECT flaky"]);
        assert_eq!(backend.logins().len(), 1);
        // the outcome is unknown, so the session ends
        assert!(client.read_packet().await.is_err());

        let _ = proxy.shutdown_tx.send(());
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_relay_session_end_releases_connection() {
    with_timeout!({
        let backend = FakeBackend::default();
        let proxy = start_proxy(backend.start().await, "relay", 0).await;

        let (mut client, reply) = login(proxy.addr, "proxyuser", "secret").await;
        assert_eq!(reply[0], 0x00);
        assert_eq!(row_value(&query(&mut client, "SELECT 1").await), "1");
        assert_eq!(proxy.stats.connections_active.load(Ordering::Relaxed), 1);

        drop(client);
        while proxy.stats.connections_active.load(Ordering::Relaxed) != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // the slot is usable again
        let (_client, reply) = login(proxy.addr, "proxyuser", "secret").await;
        assert_eq!(reply[0], 0x00);

        let _ = proxy.shutdown_tx.send(());
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_relay_sessions() {
    with_timeout!({
        let backend = FakeBackend::default();
        let proxy = start_proxy(backend.start().await, "relay", 0).await;

        let (mut client, reply) = login(proxy.addr, "proxyuser", "secret").await;
        assert_eq!(reply[0], 0x00);

        proxy.shutdown_tx.send(()).unwrap();
        assert!(client.read_packet().await.is_err());
        proxy.handle.await.unwrap().unwrap();

        // listening socket is gone
        assert!(TcpStream::connect(proxy.addr).await.is_err());
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_limit_rejects_extra_clients() {
    with_timeout!({
        let backend = FakeBackend::default();
        let proxy = start_proxy(backend.start().await, "relay", 1).await;

        let (_first, reply) = login(proxy.addr, "proxyuser", "secret").await;
        assert_eq!(reply[0], 0x00);

        let mut second = Connection::new(TcpStream::connect(proxy.addr).await.unwrap());
        assert!(second.read_packet().await.is_err());
        assert_eq!(proxy.stats.connections_rejected.load(Ordering::Relaxed), 1);
        assert_eq!(proxy.stats.connections_active.load(Ordering::Relaxed), 1);

        let _ = proxy.shutdown_tx.send(());
    });
}
