//! MySQL wire structures and protocol constants.
//!
//! Everything here is plain data. Encoding and decoding live in
//! [`super::parser`], framing lives in [`super::conn`].
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html>

/// Four-byte frame header: 3-byte little-endian length plus sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub payload_length: u32,
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Largest payload a single physical frame can carry (2^24 - 1).
    pub const MAX_PAYLOAD_LENGTH: u32 = 0xFF_FF_FF;

    /// Header size on the wire.
    pub const SIZE: usize = 4;

    pub fn new(payload_length: u32, sequence_id: u8) -> Self {
        Self {
            payload_length,
            sequence_id,
        }
    }

    pub fn encode(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }

    pub fn decode(raw: [u8; 4]) -> Self {
        Self {
            payload_length: u32::from_le_bytes([raw[0], raw[1], raw[2], 0]),
            sequence_id: raw[3],
        }
    }
}

/// Server greeting (Protocol::HandshakeV10).
///
/// The proxy builds one of these for every client and parses the one sent
/// by the backend.
#[derive(Debug, Clone)]
pub struct HandshakeV10 {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// First 8 bytes of the challenge
    pub auth_plugin_data_part_1: [u8; 8],
    pub capability_flags_lower: u16,
    pub character_set: u8,
    pub status_flags: u16,
    pub capability_flags_upper: u16,
    pub auth_plugin_data_length: u8,
    /// Remaining challenge bytes (12 for a 20-byte scramble)
    pub auth_plugin_data_part_2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl Default for HandshakeV10 {
    fn default() -> Self {
        Self {
            protocol_version: 10,
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            connection_id: 1,
            auth_plugin_data_part_1: [0u8; 8],
            capability_flags_lower: 0,
            character_set: DEFAULT_COLLATION_ID,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            capability_flags_upper: 0,
            auth_plugin_data_length: 21,
            auth_plugin_data_part_2: vec![0u8; 12],
            auth_plugin_name: AUTH_NATIVE_PASSWORD.to_string(),
        }
    }
}

impl HandshakeV10 {
    /// Build a greeting around a 20-byte challenge.
    pub fn with_scramble(scramble: &[u8; 20], capabilities: u32, connection_id: u32) -> Self {
        let mut part1 = [0u8; 8];
        part1.copy_from_slice(&scramble[..8]);
        let mut greeting = Self {
            connection_id,
            auth_plugin_data_part_1: part1,
            auth_plugin_data_part_2: scramble[8..].to_vec(),
            ..Self::default()
        };
        greeting.set_capability_flags(capabilities);
        greeting
    }

    /// Full 20-byte scramble (part 1 + first 12 bytes of part 2).
    pub fn get_scramble(&self) -> Vec<u8> {
        let mut scramble = Vec::with_capacity(20);
        scramble.extend_from_slice(&self.auth_plugin_data_part_1);
        let part2_len = std::cmp::min(12, self.auth_plugin_data_part_2.len());
        scramble.extend_from_slice(&self.auth_plugin_data_part_2[..part2_len]);
        scramble
    }

    pub fn capability_flags(&self) -> u32 {
        (self.capability_flags_upper as u32) << 16 | self.capability_flags_lower as u32
    }

    pub fn set_capability_flags(&mut self, flags: u32) {
        self.capability_flags_lower = (flags & 0xFFFF) as u16;
        self.capability_flags_upper = ((flags >> 16) & 0xFFFF) as u16;
    }
}

/// Client reply to the greeting (Protocol::HandshakeResponse41).
#[derive(Debug, Clone)]
pub struct HandshakeResponse41 {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    /// Present when CLIENT_CONNECT_WITH_DB is set
    pub database: Option<String>,
    /// Present when CLIENT_PLUGIN_AUTH is set
    pub auth_plugin_name: Option<String>,
}

impl Default for HandshakeResponse41 {
    fn default() -> Self {
        Self {
            capability_flags: 0,
            max_packet_size: MAX_PACKET_SIZE,
            character_set: DEFAULT_COLLATION_ID,
            username: String::new(),
            auth_response: Vec::new(),
            database: None,
            auth_plugin_name: None,
        }
    }
}

/// OK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    /// 0x00, or 0xFE when used as an end-of-rows marker
    pub header: u8,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl Default for OkPacket {
    fn default() -> Self {
        Self {
            header: 0x00,
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
            info: String::new(),
        }
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: [u8; 5],
    pub error_message: String,
}

impl ErrPacket {
    /// Error with the generic `HY000` state.
    pub fn new(error_code: u16, error_message: impl Into<String>) -> Self {
        Self::with_state(error_code, *b"HY000", error_message)
    }

    pub fn with_state(error_code: u16, sql_state: [u8; 5], error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            sql_state,
            error_message: error_message.into(),
        }
    }

    /// ER_ACCESS_DENIED_ERROR (1045, 28000)
    pub fn access_denied(user: &str, host: &str, using_password: bool) -> Self {
        Self::with_state(
            ER_ACCESS_DENIED_ERROR,
            *b"28000",
            format!(
                "Access denied for user '{}'@'{}' (using password: {})",
                user,
                host,
                if using_password { "YES" } else { "NO" }
            ),
        )
    }

    /// ER_HANDSHAKE_ERROR (1043, 08S01)
    pub fn bad_handshake() -> Self {
        Self::with_state(ER_HANDSHAKE_ERROR, *b"08S01", "Bad handshake")
    }

    /// ER_UNKNOWN_STMT_HANDLER (1243)
    pub fn unknown_statement(id: u32, command: &str) -> Self {
        Self::new(
            ER_UNKNOWN_STMT_HANDLER,
            format!(
                "Unknown prepared statement handler ({}) given to {}",
                id, command
            ),
        )
    }

    pub fn sql_state_str(&self) -> &str {
        std::str::from_utf8(&self.sql_state).unwrap_or("HY000")
    }
}

/// Legacy EOF packet (used without CLIENT_DEPRECATE_EOF)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl Default for EofPacket {
    fn default() -> Self {
        Self {
            warnings: 0,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
        }
    }
}

/// Protocol::ColumnDefinition41
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub character_set: u16,
    pub column_length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
    /// Only sent in COM_FIELD_LIST responses
    pub default_value: Option<Vec<u8>>,
}

impl ColumnDefinition {
    /// A VARCHAR column with the given name and no table binding.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            org_name: name.clone(),
            name,
            character_set: DEFAULT_COLLATION_ID as u16,
            column_length: 255,
            column_type: MYSQL_TYPE_VAR_STRING,
            flags: 0,
            decimals: 0,
            default_value: None,
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

/// Version string advertised in the proxy's greeting
pub const DEFAULT_SERVER_VERSION: &str = "5.7.0-credential-proxy";

/// utf8_general_ci
pub const DEFAULT_COLLATION_ID: u8 = 0x21;

/// Max packet size announced in handshake responses
pub const MAX_PACKET_SIZE: u32 = 0x00FF_FFFF;

pub const AUTH_NATIVE_PASSWORD: &str = "mysql_native_password";
pub const AUTH_CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

// ============================================================================
// Capability Flags
// Reference: https://dev.mysql.com/doc/dev/mysql-server/latest/group__group__cs__capabilities__flags.html
// ============================================================================

pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_NO_SCHEMA: u32 = 0x0000_0010;
pub const CLIENT_COMPRESS: u32 = 0x0000_0020;
pub const CLIENT_ODBC: u32 = 0x0000_0040;
pub const CLIENT_LOCAL_FILES: u32 = 0x0000_0080;
pub const CLIENT_IGNORE_SPACE: u32 = 0x0000_0100;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_INTERACTIVE: u32 = 0x0000_0400;
pub const CLIENT_SSL: u32 = 0x0000_0800;
pub const CLIENT_IGNORE_SIGPIPE: u32 = 0x0000_1000;
pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
pub const CLIENT_RESERVED: u32 = 0x0000_4000;
/// Pre-plugin name of CLIENT_SECURE_CONNECTION
pub const CLIENT_RESERVED2: u32 = 0x0000_8000;
pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;
pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
pub const CLIENT_PS_MULTI_RESULTS: u32 = 0x0004_0000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
/// Auth response is a length-encoded string (can exceed 255 bytes)
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;
pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 0x0040_0000;
pub const CLIENT_SESSION_TRACK: u32 = 0x0080_0000;
pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

pub const CLIENT_SECURE_CONNECTION: u32 = CLIENT_RESERVED2;

/// Capabilities the proxy offers to clients. CLIENT_SSL is added at runtime
/// when a server certificate is configured.
pub const DEFAULT_SERVER_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;

/// Base capabilities the proxy requests from the backend.
pub const DEFAULT_CLIENT_CAPABILITIES: u32 = CLIENT_PROTOCOL_41
    | CLIENT_SECURE_CONNECTION
    | CLIENT_LONG_PASSWORD
    | CLIENT_TRANSACTIONS
    | CLIENT_PLUGIN_AUTH;

/// Flags copied from the client session onto the backend session.
pub const MIRRORED_CAPABILITIES: u32 =
    CLIENT_MULTI_STATEMENTS | CLIENT_MULTI_RESULTS | CLIENT_PS_MULTI_RESULTS;

// ============================================================================
// Status Flags
// ============================================================================

pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

// ============================================================================
// Commands
// Reference: https://dev.mysql.com/doc/dev/mysql-server/latest/my__command_8h.html
// ============================================================================

pub const COM_SLEEP: u8 = 0x00;
pub const COM_QUIT: u8 = 0x01;
pub const COM_INIT_DB: u8 = 0x02;
pub const COM_QUERY: u8 = 0x03;
pub const COM_FIELD_LIST: u8 = 0x04;
pub const COM_CREATE_DB: u8 = 0x05;
pub const COM_DROP_DB: u8 = 0x06;
pub const COM_REFRESH: u8 = 0x07;
pub const COM_SHUTDOWN: u8 = 0x08;
pub const COM_STATISTICS: u8 = 0x09;
pub const COM_PROCESS_INFO: u8 = 0x0a;
pub const COM_CONNECT: u8 = 0x0b;
pub const COM_PROCESS_KILL: u8 = 0x0c;
pub const COM_DEBUG: u8 = 0x0d;
pub const COM_PING: u8 = 0x0e;
pub const COM_CHANGE_USER: u8 = 0x11;
pub const COM_BINLOG_DUMP: u8 = 0x12;
pub const COM_REGISTER_SLAVE: u8 = 0x15;
pub const COM_STMT_PREPARE: u8 = 0x16;
pub const COM_STMT_EXECUTE: u8 = 0x17;
pub const COM_STMT_SEND_LONG_DATA: u8 = 0x18;
pub const COM_STMT_CLOSE: u8 = 0x19;
pub const COM_STMT_RESET: u8 = 0x1a;
pub const COM_SET_OPTION: u8 = 0x1b;
pub const COM_STMT_FETCH: u8 = 0x1c;
pub const COM_BINLOG_DUMP_GTID: u8 = 0x1e;
pub const COM_RESET_CONNECTION: u8 = 0x1f;

// ============================================================================
// Response markers
// ============================================================================

pub const OK_HEADER: u8 = 0x00;
pub const AUTH_MORE_DATA_HEADER: u8 = 0x01;
pub const LOCAL_INFILE_HEADER: u8 = 0xFB;
pub const EOF_HEADER: u8 = 0xFE;
pub const ERR_HEADER: u8 = 0xFF;

/// caching_sha2_password fast-auth outcome bytes following AUTH_MORE_DATA
pub const CACHE_SHA2_FAST_AUTH: u8 = 0x03;
pub const CACHE_SHA2_FULL_AUTH: u8 = 0x04;

// ============================================================================
// Column types
// ============================================================================

pub const MYSQL_TYPE_DECIMAL: u8 = 0x00;
pub const MYSQL_TYPE_TINY: u8 = 0x01;
pub const MYSQL_TYPE_SHORT: u8 = 0x02;
pub const MYSQL_TYPE_LONG: u8 = 0x03;
pub const MYSQL_TYPE_FLOAT: u8 = 0x04;
pub const MYSQL_TYPE_DOUBLE: u8 = 0x05;
pub const MYSQL_TYPE_NULL: u8 = 0x06;
pub const MYSQL_TYPE_TIMESTAMP: u8 = 0x07;
pub const MYSQL_TYPE_LONGLONG: u8 = 0x08;
pub const MYSQL_TYPE_INT24: u8 = 0x09;
pub const MYSQL_TYPE_DATE: u8 = 0x0a;
pub const MYSQL_TYPE_TIME: u8 = 0x0b;
pub const MYSQL_TYPE_DATETIME: u8 = 0x0c;
pub const MYSQL_TYPE_YEAR: u8 = 0x0d;
pub const MYSQL_TYPE_NEWDATE: u8 = 0x0e;
pub const MYSQL_TYPE_VARCHAR: u8 = 0x0f;
pub const MYSQL_TYPE_BIT: u8 = 0x10;
pub const MYSQL_TYPE_JSON: u8 = 0xf5;
pub const MYSQL_TYPE_NEWDECIMAL: u8 = 0xf6;
pub const MYSQL_TYPE_ENUM: u8 = 0xf7;
pub const MYSQL_TYPE_SET: u8 = 0xf8;
pub const MYSQL_TYPE_TINY_BLOB: u8 = 0xf9;
pub const MYSQL_TYPE_MEDIUM_BLOB: u8 = 0xfa;
pub const MYSQL_TYPE_LONG_BLOB: u8 = 0xfb;
pub const MYSQL_TYPE_BLOB: u8 = 0xfc;
pub const MYSQL_TYPE_VAR_STRING: u8 = 0xfd;
pub const MYSQL_TYPE_STRING: u8 = 0xfe;
pub const MYSQL_TYPE_GEOMETRY: u8 = 0xff;

/// Set in the high byte of a parameter type for unsigned integers
pub const PARAM_UNSIGNED_FLAG: u8 = 0x80;

// ============================================================================
// Error codes
// ============================================================================

pub const ER_HANDSHAKE_ERROR: u16 = 1043;
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
pub const ER_UNKNOWN_ERROR: u16 = 1105;
pub const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;
pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
pub const ER_NOT_SUPPORTED_AUTH_MODE: u16 = 1251;
/// Client-side "Can't connect to MySQL server"
pub const CR_CONN_HOST_ERROR: u16 = 2003;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = PacketHeader::new(0x0A0B0C, 7);
        let raw = header.encode();
        assert_eq!(raw, [0x0C, 0x0B, 0x0A, 7]);
        assert_eq!(PacketHeader::decode(raw), header);
    }

    #[test]
    fn test_greeting_scramble_split() {
        let scramble: [u8; 20] = core::array::from_fn(|i| i as u8 + 1);
        let greeting = HandshakeV10::with_scramble(&scramble, DEFAULT_SERVER_CAPABILITIES, 9);
        assert_eq!(greeting.get_scramble(), scramble.to_vec());
        assert_eq!(greeting.capability_flags(), DEFAULT_SERVER_CAPABILITIES);
        assert_eq!(greeting.connection_id, 9);
    }

    #[test]
    fn test_access_denied_message() {
        let err = ErrPacket::access_denied("bob", "10.0.0.1", false);
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state_str(), "28000");
        assert_eq!(
            err.error_message,
            "Access denied for user 'bob'@'10.0.0.1' (using password: NO)"
        );
    }

    #[test]
    fn test_command_constants_values() {
        assert_eq!(COM_QUIT, 0x01);
        assert_eq!(COM_FIELD_LIST, 0x04);
        assert_eq!(COM_PING, 0x0e);
        assert_eq!(COM_STMT_SEND_LONG_DATA, 0x18);
        assert_eq!(COM_STMT_RESET, 0x1a);
        assert_eq!(COM_SET_OPTION, 0x1b);
    }
}
