//! Error types for mysql-credential-proxy

use thiserror::Error;

use crate::protocol::mysql::packets::{ErrPacket, ER_UNKNOWN_ERROR};
use crate::tls::TlsError;

/// Main error type for the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Framing or sequence violation; fatal to the connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Malformed handshake response from the client
    #[error("ERROR 1043 (08S01): Bad handshake")]
    BadHandshake,

    /// Unknown user or wrong password
    #[error(
        "ERROR 1045 (28000): Access denied for user '{user}'@'{host}' (using password: {})",
        yes_no(.using_password)
    )]
    AccessDenied {
        user: String,
        host: String,
        using_password: bool,
    },

    /// Statement id not found in the session's statement table
    #[error("ERROR 1243 (HY000): Unknown prepared statement handler ({id}) given to {command}")]
    UnknownStatement { id: u32, command: &'static str },

    /// Application-level error forwarded to the client verbatim
    #[error("ERROR {} ({}): {}", .0.error_code, .0.sql_state_str(), .0.error_message)]
    Server(ErrPacket),

    /// The backend leg is unusable and must be re-established
    #[error("Bad connection: {0}")]
    BadConnection(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Secret source failure (vault request, missing fields)
    #[error("Secret source error: {0}")]
    Secret(String),

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

fn yes_no(flag: &bool) -> &'static str {
    if *flag {
        "YES"
    } else {
        "NO"
    }
}

impl ProxyError {
    /// ER_UNKNOWN_ERROR carrying `message`
    pub fn unknown(message: impl Into<String>) -> Self {
        ProxyError::Server(ErrPacket::new(ER_UNKNOWN_ERROR, message))
    }

    /// Whether this error means the backend connection must be replaced
    /// before the command can be retried.
    pub fn is_bad_connection(&self) -> bool {
        matches!(self, ProxyError::BadConnection(_))
    }

    /// Whether the session cannot continue after reporting this error,
    /// e.g. the backend went away after a command was delivered.
    pub fn ends_session(&self) -> bool {
        matches!(self, ProxyError::Connection(_))
    }

    /// The ERR packet a client should see for this error.
    pub fn to_err_packet(&self) -> ErrPacket {
        match self {
            ProxyError::BadHandshake => ErrPacket::bad_handshake(),
            ProxyError::AccessDenied {
                user,
                host,
                using_password,
            } => ErrPacket::access_denied(user, host, *using_password),
            ProxyError::UnknownStatement { id, command } => ErrPacket::unknown_statement(*id, command),
            ProxyError::Server(packet) => packet.clone(),
            other => ErrPacket::new(ER_UNKNOWN_ERROR, other.to_string()),
        }
    }
}

/// Result type alias for ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Secret(err.to_string())
    }
}
