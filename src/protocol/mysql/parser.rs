//! MySQL payload codecs
//!
//! Parse and build functions for the individual packet payloads. All reads
//! are bounds-checked; a truncated payload is a [`ProxyError::Protocol`],
//! never a panic. Framing (headers, sequence ids, multi-frame payloads) is
//! handled by [`super::conn::Connection`].
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html>

use super::packets::*;
use crate::error::{ProxyError, Result};

// ============================================================================
// Parsing
// ============================================================================

/// Parse a HandshakeV10 greeting sent by the backend.
pub fn parse_handshake_v10(payload: &[u8]) -> Result<HandshakeV10> {
    let protocol_version = *payload
        .first()
        .ok_or_else(|| ProxyError::Protocol("Empty handshake packet".into()))?;
    if protocol_version != 10 {
        return Err(ProxyError::Protocol(format!(
            "Unsupported protocol version: {}",
            protocol_version
        )));
    }
    let mut cursor = 1;

    let (server_version, n) = read_null_terminated_string(&payload[cursor..])?;
    cursor += n;

    let connection_id = read_u32_le(take(payload, cursor, 4)?)?;
    cursor += 4;

    let mut auth_plugin_data_part_1 = [0u8; 8];
    auth_plugin_data_part_1.copy_from_slice(take(payload, cursor, 8)?);
    // part 1 plus the 0x00 filler
    cursor += 9;

    let capability_flags_lower = read_u16_le(take(payload, cursor, 2)?)?;
    cursor += 2;

    let mut greeting = HandshakeV10 {
        protocol_version,
        server_version,
        connection_id,
        auth_plugin_data_part_1,
        capability_flags_lower,
        capability_flags_upper: 0,
        auth_plugin_data_length: 0,
        auth_plugin_data_part_2: Vec::new(),
        auth_plugin_name: String::new(),
        ..HandshakeV10::default()
    };

    // Pre-4.1 servers stop here
    if cursor >= payload.len() {
        return Ok(greeting);
    }

    greeting.character_set = take(payload, cursor, 1)?[0];
    cursor += 1;
    greeting.status_flags = read_u16_le(take(payload, cursor, 2)?)?;
    cursor += 2;
    greeting.capability_flags_upper = read_u16_le(take(payload, cursor, 2)?)?;
    cursor += 2;
    greeting.auth_plugin_data_length = take(payload, cursor, 1)?[0];
    cursor += 1;
    // reserved
    cursor += 10;

    let caps = greeting.capability_flags();
    if caps & CLIENT_SECURE_CONNECTION != 0 && cursor < payload.len() {
        // max(13, auth_plugin_data_length - 8), NUL included
        let part2_len =
            std::cmp::max(13, greeting.auth_plugin_data_length.saturating_sub(8)) as usize;
        let available = std::cmp::min(part2_len, payload.len() - cursor);
        let mut part2 = payload[cursor..cursor + available].to_vec();
        if part2.last() == Some(&0) {
            part2.pop();
        }
        greeting.auth_plugin_data_part_2 = part2;
        cursor += available;
    }

    if caps & CLIENT_PLUGIN_AUTH != 0 && cursor < payload.len() {
        // Some servers omit the trailing NUL on the plugin name
        let rest = &payload[cursor..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        greeting.auth_plugin_name = String::from_utf8_lossy(&rest[..end]).into_owned();
    }

    Ok(greeting)
}

/// Parse a HandshakeResponse41 payload.
///
/// The proxy's server side decodes client responses incrementally (see
/// `server::handshake`); this full parser is for callers that already know
/// the whole packet is a response, such as a backend test double.
pub fn parse_handshake_response41(payload: &[u8]) -> Result<HandshakeResponse41> {
    let capability_flags = read_u32_le(payload)?;
    let max_packet_size = read_u32_le(take(payload, 4, 4)?)?;
    let character_set = take(payload, 8, 1)?[0];
    // 23 reserved bytes
    let mut cursor = 32;
    if cursor > payload.len() {
        return Err(ProxyError::Protocol("Handshake response too short".into()));
    }

    let (username, n) = read_null_terminated_string(&payload[cursor..])?;
    cursor += n;

    let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        let (data, n) = read_length_encoded_string(&payload[cursor..])?;
        cursor += n;
        data.unwrap_or_default().to_vec()
    } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
        let len = take(payload, cursor, 1)?[0] as usize;
        cursor += 1;
        let data = take(payload, cursor, len)?.to_vec();
        cursor += len;
        data
    } else {
        let rest = &payload[cursor..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProxyError::Protocol("Missing null terminator".into()))?;
        cursor += end + 1;
        rest[..end].to_vec()
    };

    let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && cursor < payload.len() {
        let (db, n) = read_null_terminated_string(&payload[cursor..])?;
        cursor += n;
        Some(db)
    } else {
        None
    };

    let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && cursor < payload.len() {
        let (name, _) = read_null_terminated_string(&payload[cursor..])?;
        Some(name)
    } else {
        None
    };

    Ok(HandshakeResponse41 {
        capability_flags,
        max_packet_size,
        character_set,
        username,
        auth_response,
        database,
        auth_plugin_name,
    })
}

/// Parse an OK packet
pub fn parse_ok_packet(payload: &[u8], capabilities: u32) -> Result<OkPacket> {
    let header = take(payload, 0, 1)?[0];
    if header != OK_HEADER && header != EOF_HEADER {
        return Err(ProxyError::Protocol(format!(
            "Invalid OK packet header: 0x{:02X}",
            header
        )));
    }
    let mut cursor = 1;

    let (affected_rows, n) = read_length_encoded_int(&payload[cursor..])?;
    cursor += n;
    let (last_insert_id, n) = read_length_encoded_int(&payload[cursor..])?;
    cursor += n;

    let (status_flags, warnings) = if capabilities & CLIENT_PROTOCOL_41 != 0 {
        let status = read_u16_le(take(payload, cursor, 2)?)?;
        let warns = read_u16_le(take(payload, cursor + 2, 2)?)?;
        cursor += 4;
        (status, warns)
    } else {
        (0, 0)
    };

    let info = String::from_utf8_lossy(payload.get(cursor..).unwrap_or_default()).into_owned();

    Ok(OkPacket {
        header,
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
        info,
    })
}

/// Parse an ERR packet
pub fn parse_err_packet(payload: &[u8], capabilities: u32) -> Result<ErrPacket> {
    let header = take(payload, 0, 1)?[0];
    if header != ERR_HEADER {
        return Err(ProxyError::Protocol(format!(
            "Invalid ERR packet header: 0x{:02X}",
            header
        )));
    }
    let error_code = read_u16_le(take(payload, 1, 2)?)?;
    let mut cursor = 3;

    let mut sql_state = *b"HY000";
    if capabilities & CLIENT_PROTOCOL_41 != 0 && payload.get(cursor) == Some(&b'#') {
        sql_state.copy_from_slice(take(payload, cursor + 1, 5)?);
        cursor += 6;
    }

    let error_message = String::from_utf8_lossy(&payload[cursor..]).into_owned();

    Ok(ErrPacket {
        error_code,
        sql_state,
        error_message,
    })
}

/// Parse a legacy EOF packet
pub fn parse_eof_packet(payload: &[u8]) -> Result<EofPacket> {
    if !is_eof_packet(payload) {
        return Err(ProxyError::Protocol("Not an EOF packet".into()));
    }
    if payload.len() < 5 {
        return Ok(EofPacket {
            warnings: 0,
            status_flags: 0,
        });
    }
    Ok(EofPacket {
        warnings: read_u16_le(&payload[1..])?,
        status_flags: read_u16_le(&payload[3..])?,
    })
}

/// Parse an AuthSwitchRequest (0xFE, plugin name, plugin data).
pub fn parse_auth_switch_request(payload: &[u8]) -> Result<(String, Vec<u8>)> {
    if payload.first() != Some(&EOF_HEADER) {
        return Err(ProxyError::Protocol("Not an auth switch request".into()));
    }
    let (plugin, n) = read_null_terminated_string(&payload[1..])?;
    let mut data = payload[1 + n..].to_vec();
    if data.last() == Some(&0) {
        data.pop();
    }
    Ok((plugin, data))
}

pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

/// A 0xFE packet short enough to be an EOF rather than a row or auth switch
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

// ============================================================================
// Helper Functions - Reading
// ============================================================================

/// Bounds-checked sub-slice `data[start..start + len]`.
pub fn take(data: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| {
            ProxyError::Protocol(format!(
                "Packet truncated: need {} bytes at offset {}, have {}",
                len,
                start,
                data.len()
            ))
        })
}

/// Read a null-terminated string.
/// Returns the string and the number of bytes consumed (including the NUL).
pub fn read_null_terminated_string(data: &[u8]) -> Result<(String, usize)> {
    let null_pos = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProxyError::Protocol("Missing null terminator".into()))?;

    let s = String::from_utf8_lossy(&data[..null_pos]).into_owned();
    Ok((s, null_pos + 1))
}

pub fn read_u16_le(data: &[u8]) -> Result<u16> {
    let b = take(data, 0, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

pub fn read_u32_le(data: &[u8]) -> Result<u32> {
    let b = take(data, 0, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Read a length-encoded integer.
/// Returns the value and the number of bytes consumed. The NULL marker
/// (0xFB) reads as 0; use [`read_length_encoded_string`] where NULL matters.
pub fn read_length_encoded_int(data: &[u8]) -> Result<(u64, usize)> {
    let marker = *data
        .first()
        .ok_or_else(|| ProxyError::Protocol("Empty data for length-encoded int".into()))?;

    match marker {
        0xFB => Ok((0, 1)),
        0xFC => {
            let b = take(data, 1, 2)?;
            Ok((u16::from_le_bytes([b[0], b[1]]) as u64, 3))
        }
        0xFD => {
            let b = take(data, 1, 3)?;
            Ok((u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64, 4))
        }
        0xFE => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(take(data, 1, 8)?);
            Ok((u64::from_le_bytes(raw), 9))
        }
        // 0xFF is reserved for the ERR header
        0xFF => Err(ProxyError::Protocol(
            "Invalid length-encoded int marker 0xFF".into(),
        )),
        n => Ok((n as u64, 1)),
    }
}

/// Read a length-encoded string.
/// Returns `None` for the NULL marker, plus the total bytes consumed.
pub fn read_length_encoded_string(data: &[u8]) -> Result<(Option<&[u8]>, usize)> {
    if data.first() == Some(&0xFB) {
        return Ok((None, 1));
    }
    let (len, n) = read_length_encoded_int(data)?;
    let len = usize::try_from(len)
        .map_err(|_| ProxyError::Protocol("Length-encoded string too large".into()))?;
    let value = take(data, n, len)?;
    Ok((Some(value), n + len))
}

// ============================================================================
// Building
// ============================================================================

/// Build a HandshakeV10 greeting payload
pub fn build_handshake_v10(handshake: &HandshakeV10) -> Vec<u8> {
    let mut payload = Vec::with_capacity(96);

    payload.push(handshake.protocol_version);
    payload.extend_from_slice(handshake.server_version.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&handshake.connection_id.to_le_bytes());
    payload.extend_from_slice(&handshake.auth_plugin_data_part_1);
    payload.push(0);
    payload.extend_from_slice(&handshake.capability_flags_lower.to_le_bytes());
    payload.push(handshake.character_set);
    payload.extend_from_slice(&handshake.status_flags.to_le_bytes());
    payload.extend_from_slice(&handshake.capability_flags_upper.to_le_bytes());
    payload.push(handshake.auth_plugin_data_length);
    payload.extend_from_slice(&[0u8; 10]);
    payload.extend_from_slice(&handshake.auth_plugin_data_part_2);
    payload.push(0);
    payload.extend_from_slice(handshake.auth_plugin_name.as_bytes());
    payload.push(0);

    payload
}

/// Build a HandshakeResponse41 payload
pub fn build_handshake_response41(response: &HandshakeResponse41) -> Vec<u8> {
    let mut payload = build_ssl_request(
        response.capability_flags,
        response.max_packet_size,
        response.character_set,
    );

    payload.extend_from_slice(response.username.as_bytes());
    payload.push(0);

    if response.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        write_length_encoded_string(&mut payload, &response.auth_response);
    } else if response.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
        payload.push(response.auth_response.len() as u8);
        payload.extend_from_slice(&response.auth_response);
    } else {
        payload.extend_from_slice(&response.auth_response);
        payload.push(0);
    }

    if let Some(ref db) = response.database {
        if response.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            payload.extend_from_slice(db.as_bytes());
            payload.push(0);
        }
    }

    if let Some(ref name) = response.auth_plugin_name {
        if response.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
        }
    }

    payload
}

/// Build the 32-byte SSLRequest, which is also the fixed prefix of every
/// HandshakeResponse41.
pub fn build_ssl_request(capabilities: u32, max_packet_size: u32, character_set: u8) -> Vec<u8> {
    let mut payload = Vec::with_capacity(128);
    payload.extend_from_slice(&capabilities.to_le_bytes());
    payload.extend_from_slice(&max_packet_size.to_le_bytes());
    payload.push(character_set);
    payload.extend_from_slice(&[0u8; 23]);
    payload
}

/// Build an OK packet payload
pub fn build_ok_packet(ok: &OkPacket, capabilities: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32);

    payload.push(ok.header);
    write_length_encoded_int(&mut payload, ok.affected_rows);
    write_length_encoded_int(&mut payload, ok.last_insert_id);

    if capabilities & CLIENT_PROTOCOL_41 != 0 {
        payload.extend_from_slice(&ok.status_flags.to_le_bytes());
        payload.extend_from_slice(&ok.warnings.to_le_bytes());
    }

    payload.extend_from_slice(ok.info.as_bytes());
    payload
}

/// Build an ERR packet payload
pub fn build_err_packet(err: &ErrPacket, capabilities: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + err.error_message.len());

    payload.push(ERR_HEADER);
    payload.extend_from_slice(&err.error_code.to_le_bytes());
    if capabilities & CLIENT_PROTOCOL_41 != 0 {
        payload.push(b'#');
        payload.extend_from_slice(&err.sql_state);
    }
    payload.extend_from_slice(err.error_message.as_bytes());

    payload
}

/// Build a legacy EOF packet payload
pub fn build_eof_packet(eof: &EofPacket, capabilities: u32) -> Vec<u8> {
    let mut payload = vec![EOF_HEADER];
    if capabilities & CLIENT_PROTOCOL_41 != 0 {
        payload.extend_from_slice(&eof.warnings.to_le_bytes());
        payload.extend_from_slice(&eof.status_flags.to_le_bytes());
    }
    payload
}

/// Build an AuthSwitchRequest asking the client to answer `scramble` with
/// `plugin`.
pub fn build_auth_switch_request(plugin: &str, scramble: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + plugin.len() + scramble.len() + 1);
    payload.push(EOF_HEADER);
    payload.extend_from_slice(plugin.as_bytes());
    payload.push(0);
    payload.extend_from_slice(scramble);
    payload.push(0);
    payload
}

/// Build a ColumnDefinition41 payload
pub fn build_column_definition(column: &ColumnDefinition) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);

    write_length_encoded_string(&mut payload, b"def");
    write_length_encoded_string(&mut payload, column.schema.as_bytes());
    write_length_encoded_string(&mut payload, column.table.as_bytes());
    write_length_encoded_string(&mut payload, column.org_table.as_bytes());
    write_length_encoded_string(&mut payload, column.name.as_bytes());
    write_length_encoded_string(&mut payload, column.org_name.as_bytes());
    // length of the fixed-size fields that follow
    payload.push(0x0c);
    payload.extend_from_slice(&column.character_set.to_le_bytes());
    payload.extend_from_slice(&column.column_length.to_le_bytes());
    payload.push(column.column_type);
    payload.extend_from_slice(&column.flags.to_le_bytes());
    payload.push(column.decimals);
    payload.extend_from_slice(&[0, 0]);

    if let Some(ref default) = column.default_value {
        write_length_encoded_string(&mut payload, default);
    }

    payload
}

/// Parse a ColumnDefinition41 payload
pub fn parse_column_definition(payload: &[u8]) -> Result<ColumnDefinition> {
    let mut cursor = 0;
    let mut strings: Vec<String> = Vec::with_capacity(6);
    for _ in 0..6 {
        let (value, n) = read_length_encoded_string(&payload[cursor..])?;
        strings.push(String::from_utf8_lossy(value.unwrap_or_default()).into_owned());
        cursor += n;
    }
    let (_, n) = read_length_encoded_int(&payload[cursor..])?;
    cursor += n;

    let fixed = take(payload, cursor, 10)?;
    let character_set = u16::from_le_bytes([fixed[0], fixed[1]]);
    let column_length = u32::from_le_bytes([fixed[2], fixed[3], fixed[4], fixed[5]]);
    let column_type = fixed[6];
    let flags = u16::from_le_bytes([fixed[7], fixed[8]]);
    let decimals = fixed[9];
    cursor += 12;

    let default_value = if cursor < payload.len() {
        let (value, _) = read_length_encoded_string(&payload[cursor..])?;
        value.map(|v| v.to_vec())
    } else {
        None
    };

    // skip the catalog ("def")
    let mut strings = strings.into_iter().skip(1);
    let mut next = || strings.next().unwrap_or_default();
    Ok(ColumnDefinition {
        schema: next(),
        table: next(),
        org_table: next(),
        name: next(),
        org_name: next(),
        character_set,
        column_length,
        column_type,
        flags,
        decimals,
        default_value,
    })
}

/// Build the COM_STMT_PREPARE_OK header packet
pub fn build_stmt_prepare_ok(statement_id: u32, columns: u16, params: u16, warnings: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.push(OK_HEADER);
    payload.extend_from_slice(&statement_id.to_le_bytes());
    payload.extend_from_slice(&columns.to_le_bytes());
    payload.extend_from_slice(&params.to_le_bytes());
    payload.push(0);
    payload.extend_from_slice(&warnings.to_le_bytes());
    payload
}

// ============================================================================
// Helper Functions - Writing
// ============================================================================

pub fn write_length_encoded_int(buf: &mut Vec<u8>, value: u64) {
    if value < 251 {
        buf.push(value as u8);
    } else if value < 1 << 16 {
        buf.push(0xFC);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value < 1 << 24 {
        buf.push(0xFD);
        buf.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        buf.push(0xFE);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

pub fn write_length_encoded_string(buf: &mut Vec<u8>, value: &[u8]) {
    write_length_encoded_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}
