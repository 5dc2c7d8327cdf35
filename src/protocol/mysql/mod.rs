//! MySQL protocol implementation
//!
//! This module contains:
//! - Packet structures and constants
//! - Payload codecs (parse/build)
//! - Sequenced framing over a stream ([`Connection`])
//! - Password scrambling for native and caching_sha2 auth
//! - Replication coordinates (binlog positions, GTID sets)

pub mod auth;
pub mod binary;
pub mod conn;
pub mod gtid;
pub mod packets;
pub mod parser;
pub mod position;

pub use auth::*;
pub use conn::Connection;
pub use gtid::{parse_gtid_set, GtidSet, MariadbGtidSet, MysqlGtidSet};
pub use packets::*;
pub use parser::*;
pub use position::{compare_binlog_file_name, Position};
