//! TLS Integration Tests
//!
//! These tests verify TLS configuration and the SSLRequest path at the
//! integration level. Full encrypted sessions need real certificates and a
//! TLS-enabled MySQL server, which belongs in CI infrastructure.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::broadcast;

use mysql_credential_proxy::config::load_config_from_str;
use mysql_credential_proxy::protocol::mysql::{
    build_ssl_request, parse_err_packet, parse_handshake_v10, Connection, CLIENT_PROTOCOL_41,
    CLIENT_SECURE_CONNECTION, CLIENT_SSL, MAX_PACKET_SIZE,
};
use mysql_credential_proxy::{
    Listener, ProxyContext, ProxyError, TlsAcceptor, TlsClientConfig, TlsConnector,
    TlsServerConfig,
};

fn config_yaml(tls_block: &str) -> String {
    format!(
        r#"
server:
  addr: "127.0.0.1:0"
{tls_block}
fakeIdentity:
  username: proxyuser
  password: secret
confidential:
  storage: yaml
  yaml:
    host: 127.0.0.1
    port: 3306
    username: real_user
    password: real_pw
  tls:
    enabled: true
    ca_path: "/path/to/ca.pem"
    insecure_skip_verify: false
    server_name: "db.internal"
"#
    )
}

/// Test that TLS configuration can be loaded from YAML
#[test]
fn test_tls_config_yaml_parsing() {
    let yaml = config_yaml(
        r#"  tls:
    enabled: true
    cert_path: "/path/to/cert.pem"
    key_path: "/path/to/key.pem""#,
    );
    let config = load_config_from_str(&yaml).unwrap();

    assert!(config.server.tls.enabled);
    assert_eq!(
        config.server.tls.cert_path,
        Some(PathBuf::from("/path/to/cert.pem"))
    );
    assert_eq!(
        config.server.tls.key_path,
        Some(PathBuf::from("/path/to/key.pem"))
    );

    let backend = &config.confidential.tls;
    assert!(backend.enabled);
    assert_eq!(backend.ca_path, Some(PathBuf::from("/path/to/ca.pem")));
    assert!(!backend.insecure_skip_verify);
    assert_eq!(backend.server_name_or("127.0.0.1"), "db.internal");
}

/// Server TLS without a key is rejected at load time
#[test]
fn test_tls_enabled_without_key_fails_validation() {
    let yaml = config_yaml(
        r#"  tls:
    enabled: true
    cert_path: "/path/to/cert.pem""#,
    );
    let err = load_config_from_str(&yaml).unwrap_err();
    assert!(matches!(err, ProxyError::Config(_)));
    assert!(err.to_string().contains("key_path"));
}

/// Test TLS acceptor validation without valid certs
#[test]
fn test_tls_acceptor_validation() {
    let config = TlsServerConfig {
        enabled: true,
        cert_path: None,
        key_path: Some(PathBuf::from("/key.pem")),
    };
    assert!(TlsAcceptor::new(&config).is_err());

    // paths present but unreadable
    let config = TlsServerConfig {
        enabled: true,
        cert_path: Some(PathBuf::from("/nonexistent/cert.pem")),
        key_path: Some(PathBuf::from("/nonexistent/key.pem")),
    };
    assert!(TlsAcceptor::new(&config).is_err());
}

/// Test TLS connector validation
#[test]
fn test_tls_connector_validation() {
    // client certificate without its key
    let config = TlsClientConfig {
        enabled: true,
        cert_path: Some(PathBuf::from("/client.pem")),
        ..Default::default()
    };
    assert!(TlsConnector::new(&config).is_err());

    // webpki roots when no CA bundle is given
    let config = TlsClientConfig {
        enabled: true,
        ..Default::default()
    };
    assert!(TlsConnector::new(&config).is_ok());
}

/// Test insecure TLS connector can be created
#[test]
fn test_tls_connector_insecure() {
    assert!(TlsConnector::new_insecure().is_ok());
}

/// A client asking for SSL from a proxy without a certificate gets an ERR
/// instead of a hung handshake.
#[tokio::test]
async fn test_ssl_request_without_server_tls_is_refused() {
    let yaml = r#"
server:
  addr: "127.0.0.1:0"
fakeIdentity:
  username: proxyuser
  password: secret
confidential:
  storage: yaml
  yaml:
    host: 127.0.0.1
    port: 3306
    username: real_user
    password: real_pw
"#;
    let config = Arc::new(load_config_from_str(yaml).unwrap());
    let ctx = Arc::new(ProxyContext::from_config(config).unwrap());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let listener = Listener::bind(ctx, shutdown_rx).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(listener.run());

    let mut conn = Connection::new(TcpStream::connect(addr).await.unwrap());
    let greeting = parse_handshake_v10(&conn.read_packet().await.unwrap()).unwrap();
    assert_eq!(greeting.capability_flags() & CLIENT_SSL, 0);

    let request = build_ssl_request(
        CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_SSL,
        MAX_PACKET_SIZE,
        45,
    );
    conn.write_packet(&request).await.unwrap();
    let reply = conn.read_packet().await.unwrap();
    let err = parse_err_packet(&reply, CLIENT_PROTOCOL_41).unwrap();
    assert!(err.error_message.contains("SSL"));

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}
