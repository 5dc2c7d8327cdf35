//! Reading complete backend responses
//!
//! The forwarding handler relays result sets packet by packet, so these
//! readers only find the end of a response; rows are never decoded.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ProxyError, Result};
use crate::protocol::mysql::{
    is_eof_packet, is_err_packet, is_ok_packet, parse_column_definition, parse_eof_packet,
    parse_err_packet, parse_ok_packet, read_length_encoded_int, read_u16_le, read_u32_le,
    ColumnDefinition, Connection, LOCAL_INFILE_HEADER, SERVER_MORE_RESULTS_EXISTS,
};

/// Default cap on one buffered response.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 64 * 1024 * 1024;

/// Turn an ERR payload into the error forwarded to the client.
pub fn server_error(payload: &[u8], capability: u32) -> ProxyError {
    match parse_err_packet(payload, capability) {
        Ok(err) => ProxyError::Server(err),
        Err(e) => e,
    }
}

/// Read an OK, failing with the backend's ERR if that is what arrived.
pub async fn read_ok<S>(conn: &mut Connection<S>) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = conn.read_packet().await?;
    if is_err_packet(&payload) {
        return Err(server_error(&payload, conn.capability()));
    }
    if !is_ok_packet(&payload) {
        return Err(ProxyError::Protocol(format!(
            "expected OK packet, got header 0x{:02X}",
            payload.first().copied().unwrap_or(0)
        )));
    }
    Ok(payload)
}

/// Packets of one response, up to a byte limit.
///
/// Past the limit nothing more is kept, but the response is still read to
/// its end so the backend stays in step with the next command.
struct Collected {
    packets: Vec<Vec<u8>>,
    bytes: usize,
    limit: usize,
    overflowed: bool,
}

impl Collected {
    fn new(limit: usize) -> Self {
        Self {
            packets: Vec::new(),
            bytes: 0,
            limit,
            overflowed: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.bytes == 0 && self.packets.is_empty()
    }

    fn push(&mut self, packet: Vec<u8>) {
        self.bytes = self.bytes.saturating_add(packet.len().max(1));
        if self.overflowed {
            return;
        }
        if self.bytes > self.limit {
            self.overflowed = true;
            self.packets = Vec::new();
        } else {
            self.packets.push(packet);
        }
    }

    fn finish(self) -> Result<Vec<Vec<u8>>> {
        if self.overflowed {
            warn!(
                bytes = self.bytes,
                limit = self.limit,
                "Result set discarded: larger than max_result_bytes"
            );
            return Err(ProxyError::unknown(format!(
                "result set exceeds the proxy limit of {} bytes",
                self.limit
            )));
        }
        Ok(self.packets)
    }
}

/// Every packet of a text or binary result, across multi-result chains.
///
/// An ERR as the first packet is returned as [`ProxyError::Server`]; an
/// ERR after rows have started is part of the relayed response. A response
/// larger than `limit` bytes is drained and reported as an error.
pub async fn read_result<S>(conn: &mut Connection<S>, limit: usize) -> Result<Vec<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let capability = conn.capability();
    let mut collected = Collected::new(limit);

    loop {
        let first = conn.read_packet().await?;
        if is_err_packet(&first) {
            if collected.is_empty() {
                return Err(server_error(&first, capability));
            }
            collected.push(first);
            return collected.finish();
        }

        if is_ok_packet(&first) {
            let status = parse_ok_packet(&first, capability)?.status_flags;
            collected.push(first);
            if status & SERVER_MORE_RESULTS_EXISTS != 0 {
                continue;
            }
            return collected.finish();
        }

        if first.first() == Some(&LOCAL_INFILE_HEADER) {
            // no file is ever sent; the empty packet ends the transfer
            debug!("Declining LOAD DATA LOCAL INFILE request from backend");
            conn.write_packet(&[]).await?;
            continue;
        }

        let (columns, _) = read_length_encoded_int(&first)?;
        collected.push(first);
        for _ in 0..columns {
            collected.push(conn.read_packet().await?);
        }
        let eof = conn.read_packet().await?;
        if !is_eof_packet(&eof) {
            return Err(ProxyError::Protocol("missing EOF after column definitions".into()));
        }
        collected.push(eof);

        let status = loop {
            let row = conn.read_packet().await?;
            if is_eof_packet(&row) {
                let status = parse_eof_packet(&row)?.status_flags;
                collected.push(row);
                break Some(status);
            }
            let failed = is_err_packet(&row);
            collected.push(row);
            if failed {
                break None;
            }
        };

        match status {
            Some(flags) if flags & SERVER_MORE_RESULTS_EXISTS != 0 => continue,
            _ => return collected.finish(),
        }
    }
}

/// Column definitions up to the terminating EOF (COM_FIELD_LIST).
pub async fn read_column_definitions<S>(conn: &mut Connection<S>) -> Result<Vec<ColumnDefinition>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut columns = Vec::new();
    loop {
        let payload = conn.read_packet().await?;
        if is_err_packet(&payload) {
            return Err(server_error(&payload, conn.capability()));
        }
        if is_eof_packet(&payload) {
            return Ok(columns);
        }
        columns.push(parse_column_definition(&payload)?);
    }
}

/// COM_STMT_PREPARE_OK header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub columns: u16,
    pub params: u16,
}

/// Read a prepare response including its parameter and column blocks.
pub async fn read_prepare_ok<S>(conn: &mut Connection<S>) -> Result<PrepareOk>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = read_ok(conn).await?;
    let body = payload.get(1..).unwrap_or_default();
    let ok = PrepareOk {
        statement_id: read_u32_le(body)?,
        columns: read_u16_le(body.get(4..).unwrap_or_default())?,
        params: read_u16_le(body.get(6..).unwrap_or_default())?,
    };

    for count in [ok.params, ok.columns] {
        if count > 0 {
            // definitions plus EOF
            for _ in 0..=count {
                conn.read_packet().await?;
            }
        }
    }
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::{
        build_column_definition, build_eof_packet, build_err_packet, build_ok_packet,
        build_stmt_prepare_ok, EofPacket, ErrPacket, OkPacket, CLIENT_PROTOCOL_41,
    };
    use tokio::io::{duplex, DuplexStream};

    const LIMIT: usize = 1024 * 1024;

    fn pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let mut proxy = Connection::new(a);
        proxy.set_capabilities(CLIENT_PROTOCOL_41);
        (proxy, Connection::new(b))
    }

    fn eof(status: u16) -> Vec<u8> {
        build_eof_packet(
            &EofPacket {
                warnings: 0,
                status_flags: status,
            },
            CLIENT_PROTOCOL_41,
        )
    }

    #[tokio::test]
    async fn test_read_ok_and_error() {
        let (mut proxy, mut db) = pair();
        db.write_packet(&build_ok_packet(&OkPacket::default(), CLIENT_PROTOCOL_41))
            .await
            .unwrap();
        read_ok(&mut proxy).await.unwrap();

        let err = ErrPacket::with_state(1049, *b"42000", "Unknown database 'x'");
        db.write_packet(&build_err_packet(&err, CLIENT_PROTOCOL_41))
            .await
            .unwrap();
        match read_ok(&mut proxy).await.unwrap_err() {
            ProxyError::Server(got) => assert_eq!(got, err),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_result_multi_results() {
        let (mut proxy, mut db) = pair();
        // the row EOF announces a trailing OK result
        let script = vec![
            vec![1],
            build_column_definition(&ColumnDefinition::new("a")),
            eof(0x0002),
            b"\x011".to_vec(),
            eof(0x0002 | SERVER_MORE_RESULTS_EXISTS),
            build_ok_packet(&OkPacket::default(), CLIENT_PROTOCOL_41),
        ];
        db.write_packets(&script).await.unwrap();

        let packets = read_result(&mut proxy, LIMIT).await.unwrap();
        assert_eq!(packets, script);
    }

    #[tokio::test]
    async fn test_read_result_first_packet_error() {
        let (mut proxy, mut db) = pair();
        let err = ErrPacket::with_state(1146, *b"42S02", "Table 'shop.t' doesn't exist");
        db.write_packet(&build_err_packet(&err, CLIENT_PROTOCOL_41))
            .await
            .unwrap();
        assert!(matches!(
            read_result(&mut proxy, LIMIT).await.unwrap_err(),
            ProxyError::Server(_)
        ));
    }

    #[tokio::test]
    async fn test_read_result_error_mid_rows_is_relayed() {
        let (mut proxy, mut db) = pair();
        let err = build_err_packet(&ErrPacket::new(1317, "interrupted"), CLIENT_PROTOCOL_41);
        let script = vec![
            vec![1],
            build_column_definition(&ColumnDefinition::new("a")),
            eof(0x0002),
            b"\x011".to_vec(),
            err.clone(),
        ];
        db.write_packets(&script).await.unwrap();
        assert_eq!(read_result(&mut proxy, LIMIT).await.unwrap(), script);
    }

    #[tokio::test]
    async fn test_read_result_over_limit_is_drained() {
        let (mut proxy, mut db) = pair();
        let mut script = vec![
            vec![1],
            build_column_definition(&ColumnDefinition::new("a")),
            eof(0x0002),
        ];
        for _ in 0..8 {
            let mut row = vec![0xFC, 0x00, 0x01];
            row.extend_from_slice(&[b'x'; 256]);
            script.push(row);
        }
        script.push(eof(0x0002));
        db.write_packets(&script).await.unwrap();
        db.reset_sequence();
        db.write_packet(&build_ok_packet(&OkPacket::default(), CLIENT_PROTOCOL_41))
            .await
            .unwrap();

        match read_result(&mut proxy, 1024).await.unwrap_err() {
            ProxyError::Server(err) => assert!(err.error_message.contains("1024 bytes")),
            other => panic!("unexpected {:?}", other),
        }
        // the whole oversized response was consumed
        proxy.reset_sequence();
        read_ok(&mut proxy).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_prepare_ok_skips_definitions() {
        let (mut proxy, mut db) = pair();
        let def = build_column_definition(&ColumnDefinition::new("?"));
        db.write_packets(&[
            build_stmt_prepare_ok(9, 1, 2, 0),
            def.clone(),
            def.clone(),
            eof(0x0002),
            def,
            eof(0x0002),
        ])
        .await
        .unwrap();
        // a following OK must still be readable
        db.write_packet(&build_ok_packet(&OkPacket::default(), CLIENT_PROTOCOL_41))
            .await
            .unwrap();

        let ok = read_prepare_ok(&mut proxy).await.unwrap();
        assert_eq!(
            ok,
            PrepareOk {
                statement_id: 9,
                columns: 1,
                params: 2
            }
        );
        read_ok(&mut proxy).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_column_definitions() {
        let (mut proxy, mut db) = pair();
        db.write_packets(&[
            build_column_definition(&ColumnDefinition::new("id")),
            build_column_definition(&ColumnDefinition::new("name")),
            eof(0x0002),
        ])
        .await
        .unwrap();
        let columns = read_column_definitions(&mut proxy).await.unwrap();
        let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["id", "name"]);
    }
}
