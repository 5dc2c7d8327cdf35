//! Configuration types

use serde::Deserialize;

use crate::tls::{TlsClientConfig, TlsServerConfig};

/// Root configuration structure
///
/// ```yaml
/// server:
///   addr: "0.0.0.0:3307"
/// confidential:
///   storage: yaml
///   yaml:
///     host: "db.internal"
///     port: 3306
///     username: "app"
///     password: "${DB_PASSWORD}"
///     dbname: "shop"
/// fakeIdentity:
///   username: "proxyuser"
///   password: "secret"
/// ```
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,

    /// Relay buffer pool sizing
    #[serde(default)]
    pub buffer_pool: BufferPoolConfig,

    /// Where the real database credential comes from
    pub confidential: ConfidentialConfig,

    /// The credential clients present to the proxy
    #[serde(rename = "fakeIdentity")]
    pub fake_identity: FakeIdentity,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.addr.trim().is_empty() {
            return Err("server.addr must not be empty".into());
        }
        if self.server.connect_timeout_secs == 0 {
            return Err("server.connect_timeout_secs must be positive".into());
        }
        if self.server.max_result_bytes == 0 {
            return Err("server.max_result_bytes must be positive".into());
        }
        self.server
            .tls
            .validate()
            .map_err(|e| format!("server.tls: {}", e))?;

        if self.fake_identity.username.is_empty() || self.fake_identity.password.is_empty() {
            return Err("fakeIdentity username and password must not be empty".into());
        }

        let pool = &self.buffer_pool;
        if pool.buffer_size == 0 || pool.fast_slots == 0 {
            return Err("buffer_pool.buffer_size and buffer_pool.fast_slots must be positive".into());
        }

        match self.confidential.storage {
            SecretStorage::Yaml => {
                if self.confidential.yaml.is_none() {
                    return Err("confidential.yaml is required for yaml storage".into());
                }
            }
            SecretStorage::Vault => {
                let vault = self
                    .confidential
                    .vault
                    .as_ref()
                    .ok_or("confidential.vault is required for vault storage")?;
                if vault.addr.is_empty() || vault.token.is_empty() || vault.data_path.is_empty() {
                    return Err("confidential.vault addr, token and dataPath must be set".into());
                }
            }
        }
        self.confidential
            .tls
            .validate()
            .map_err(|e| format!("confidential.tls: {}", e))
    }
}

/// What a session does once both legs are authenticated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Opaque byte copy in both directions
    #[default]
    Relay,
    /// Decode each command and forward it through the dispatcher
    Inspect,
}

/// Server listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on, `host:port`
    pub addr: String,
    #[serde(default)]
    pub mode: RelayMode,
    /// Handshake and backend connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Relay idle timeout in seconds (0 = none)
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Maximum number of concurrent connections (0 = unlimited)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Time in-flight sessions get after a shutdown signal
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Largest result the inspect mode buffers for one command
    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: usize,
    /// TLS configuration for accepting client connections
    #[serde(default)]
    pub tls: TlsServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferPoolConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_fast_slots")]
    pub fast_slots: usize,
    #[serde(default = "default_overflow_slots")]
    pub overflow_slots: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            fast_slots: default_fast_slots(),
            overflow_slots: default_overflow_slots(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretStorage {
    Yaml,
    Vault,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfidentialConfig {
    pub storage: SecretStorage,
    #[serde(default)]
    pub yaml: Option<RemoteMysql>,
    #[serde(default)]
    pub vault: Option<VaultConfig>,
    /// TLS toward the real database
    #[serde(default)]
    pub tls: TlsClientConfig,
}

/// The real database and its credential.
#[derive(Clone, Default, Deserialize)]
pub struct RemoteMysql {
    pub host: String,
    pub port: i64,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub dbname: String,
}

impl RemoteMysql {
    /// Fails when host, username or password is empty or the port is not
    /// a valid TCP port.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("database host must not be empty".into());
        }
        if self.port <= 0 || self.port > u16::MAX as i64 {
            return Err(format!("invalid database port {}", self.port));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err("database username and password must not be empty".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn database(&self) -> Option<&str> {
        (!self.dbname.is_empty()).then_some(self.dbname.as_str())
    }
}

impl std::fmt::Debug for RemoteMysql {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMysql")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
pub struct VaultConfig {
    pub addr: String,
    pub token: String,
    #[serde(rename = "dataPath")]
    pub data_path: String,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("addr", &self.addr)
            .field("token", &"<redacted>")
            .field("data_path", &self.data_path)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
pub struct FakeIdentity {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for FakeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeIdentity")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    1000
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_max_result_bytes() -> usize {
    crate::client::resp::DEFAULT_MAX_RESULT_BYTES
}

fn default_buffer_size() -> usize {
    4096
}

fn default_fast_slots() -> usize {
    10
}

fn default_overflow_slots() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}
