//! Command results and their wire encoding
//!
//! Handlers answer with a [`QueryResult`]; the dispatcher turns it into
//! packets. Result sets use the text row format for COM_QUERY and the
//! binary row format for COM_STMT_EXECUTE.

use crate::error::{ProxyError, Result};
use crate::protocol::mysql::{
    build_column_definition, build_eof_packet, build_ok_packet, write_length_encoded_int,
    write_length_encoded_string, ColumnDefinition, EofPacket, OkPacket, MYSQL_TYPE_DOUBLE,
    MYSQL_TYPE_FLOAT, MYSQL_TYPE_INT24, MYSQL_TYPE_LONG, MYSQL_TYPE_LONGLONG, MYSQL_TYPE_NULL,
    MYSQL_TYPE_SHORT, MYSQL_TYPE_TINY, MYSQL_TYPE_YEAR,
};

/// Column flag marking an unsigned integer column
pub const UNSIGNED_FLAG: u16 = 0x0020;

/// What a handler produced for one command.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Statement without rows (INSERT, SET, ...)
    Ok(OkPacket),
    Rows(ResultSet),
    /// Response packets relayed as-is from a backend. Sequence ids are
    /// rewritten on the way out.
    Packets(Vec<Vec<u8>>),
}

impl Default for QueryResult {
    fn default() -> Self {
        QueryResult::Ok(OkPacket::default())
    }
}

/// Column metadata plus rows of textual cell values (`None` is SQL NULL).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<ColumnDefinition>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
    pub status_flags: u16,
}

impl ResultSet {
    pub fn new(columns: Vec<ColumnDefinition>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            status_flags: OkPacket::default().status_flags,
        }
    }

    /// Append a row of string cells.
    pub fn push_row<I, V>(&mut self, cells: I)
    where
        I: IntoIterator<Item = Option<V>>,
        V: Into<Vec<u8>>,
    {
        self.rows
            .push(cells.into_iter().map(|cell| cell.map(Into::into)).collect());
    }
}

/// Row format requested by the command being answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    Text,
    Binary,
}

impl QueryResult {
    /// Encode as the sequence of payloads sent to the client.
    pub fn encode(&self, capability: u32, format: RowFormat) -> Result<Vec<Vec<u8>>> {
        match self {
            QueryResult::Ok(ok) => Ok(vec![build_ok_packet(ok, capability)]),
            QueryResult::Packets(packets) => Ok(packets.clone()),
            QueryResult::Rows(rs) => encode_resultset(rs, capability, format),
        }
    }
}

fn encode_resultset(rs: &ResultSet, capability: u32, format: RowFormat) -> Result<Vec<Vec<u8>>> {
    let mut packets = Vec::with_capacity(rs.columns.len() + rs.rows.len() + 3);

    let mut count = Vec::with_capacity(9);
    write_length_encoded_int(&mut count, rs.columns.len() as u64);
    packets.push(count);

    packets.extend(rs.columns.iter().map(build_column_definition));
    let eof = EofPacket {
        warnings: 0,
        status_flags: rs.status_flags,
    };
    packets.push(build_eof_packet(&eof, capability));

    for row in &rs.rows {
        if row.len() != rs.columns.len() {
            return Err(ProxyError::unknown(format!(
                "row has {} values for {} columns",
                row.len(),
                rs.columns.len()
            )));
        }
        packets.push(match format {
            RowFormat::Text => encode_text_row(row),
            RowFormat::Binary => encode_binary_row(&rs.columns, row)?,
        });
    }

    packets.push(build_eof_packet(&eof, capability));
    Ok(packets)
}

fn encode_text_row(row: &[Option<Vec<u8>>]) -> Vec<u8> {
    let mut payload = Vec::new();
    for cell in row {
        match cell {
            Some(value) => write_length_encoded_string(&mut payload, value),
            None => payload.push(0xFB),
        }
    }
    payload
}

/// ProtocolBinary::ResultsetRow. The NULL bitmap is offset by 2 bits.
fn encode_binary_row(columns: &[ColumnDefinition], row: &[Option<Vec<u8>>]) -> Result<Vec<u8>> {
    let mut payload = vec![0x00];
    let bitmap_start = payload.len();
    payload.resize(bitmap_start + (columns.len() + 7 + 2) / 8, 0);

    for (i, (column, cell)) in columns.iter().zip(row).enumerate() {
        let Some(value) = cell else {
            let bit = i + 2;
            payload[bitmap_start + bit / 8] |= 1 << (bit % 8);
            continue;
        };
        encode_binary_value(&mut payload, column, value)?;
    }
    Ok(payload)
}

fn encode_binary_value(payload: &mut Vec<u8>, column: &ColumnDefinition, value: &[u8]) -> Result<()> {
    let text = || {
        std::str::from_utf8(value)
            .map(str::trim)
            .map_err(|_| ProxyError::unknown(format!("column '{}' is not valid UTF-8", column.name)))
    };
    let bad = || ProxyError::unknown(format!("column '{}' holds a non-numeric value", column.name));
    let unsigned = column.flags & UNSIGNED_FLAG != 0;

    match column.column_type {
        MYSQL_TYPE_TINY if unsigned => payload.push(text()?.parse::<u8>().map_err(|_| bad())?),
        MYSQL_TYPE_TINY => payload.extend_from_slice(&text()?.parse::<i8>().map_err(|_| bad())?.to_le_bytes()),
        MYSQL_TYPE_SHORT | MYSQL_TYPE_YEAR if unsigned => {
            payload.extend_from_slice(&text()?.parse::<u16>().map_err(|_| bad())?.to_le_bytes())
        }
        MYSQL_TYPE_SHORT | MYSQL_TYPE_YEAR => {
            payload.extend_from_slice(&text()?.parse::<i16>().map_err(|_| bad())?.to_le_bytes())
        }
        MYSQL_TYPE_INT24 | MYSQL_TYPE_LONG if unsigned => {
            payload.extend_from_slice(&text()?.parse::<u32>().map_err(|_| bad())?.to_le_bytes())
        }
        MYSQL_TYPE_INT24 | MYSQL_TYPE_LONG => {
            payload.extend_from_slice(&text()?.parse::<i32>().map_err(|_| bad())?.to_le_bytes())
        }
        MYSQL_TYPE_LONGLONG if unsigned => {
            payload.extend_from_slice(&text()?.parse::<u64>().map_err(|_| bad())?.to_le_bytes())
        }
        MYSQL_TYPE_LONGLONG => {
            payload.extend_from_slice(&text()?.parse::<i64>().map_err(|_| bad())?.to_le_bytes())
        }
        MYSQL_TYPE_FLOAT => {
            let v: f32 = text()?.parse().map_err(|_| bad())?;
            payload.extend_from_slice(&v.to_le_bytes());
        }
        MYSQL_TYPE_DOUBLE => {
            let v: f64 = text()?.parse().map_err(|_| bad())?;
            payload.extend_from_slice(&v.to_le_bytes());
        }
        MYSQL_TYPE_NULL => {}
        // strings, decimals, blobs; temporal values are sent as strings too
        _ => write_length_encoded_string(payload, value),
    }
    Ok(())
}
