//! Command packets sent to the backend
//!
//! Every writer starts a new command exchange, so the sequence is reset
//! before the packet goes out.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::protocol::mysql::{
    write_length_encoded_string, Connection, MYSQL_TYPE_DOUBLE, MYSQL_TYPE_FLOAT,
    MYSQL_TYPE_LONGLONG, MYSQL_TYPE_NULL, MYSQL_TYPE_VAR_STRING, PARAM_UNSIGNED_FLAG,
};
use crate::server::command::Value;

pub async fn write_command<S>(conn: &mut Connection<S>, command: u8) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.reset_sequence();
    conn.write_packet(&[command]).await
}

pub async fn write_command_buf<S>(conn: &mut Connection<S>, command: u8, arg: &[u8]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.reset_sequence();
    let mut payload = Vec::with_capacity(arg.len() + 1);
    payload.push(command);
    payload.extend_from_slice(arg);
    conn.write_packet(&payload).await
}

pub async fn write_command_str<S>(conn: &mut Connection<S>, command: u8, arg: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_command_buf(conn, command, arg.as_bytes()).await
}

pub async fn write_command_u32<S>(conn: &mut Connection<S>, command: u8, arg: u32) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_command_buf(conn, command, &arg.to_le_bytes()).await
}

/// `command`, `arg1`, NUL, `arg2`; the COM_FIELD_LIST layout.
pub async fn write_command_str_str<S>(
    conn: &mut Connection<S>,
    command: u8,
    arg1: &str,
    arg2: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut arg = Vec::with_capacity(arg1.len() + arg2.len() + 1);
    arg.extend_from_slice(arg1.as_bytes());
    arg.push(0);
    arg.extend_from_slice(arg2.as_bytes());
    write_command_buf(conn, command, &arg).await
}

/// COM_STMT_EXECUTE body (without the command byte) binding `args`.
///
/// Types are always sent, so the backend never relies on types from an
/// earlier execute.
pub fn build_stmt_execute(stmt_id: u32, args: &[Value]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + args.len() * 10);
    payload.extend_from_slice(&stmt_id.to_le_bytes());
    payload.push(0); // CURSOR_TYPE_NO_CURSOR
    payload.extend_from_slice(&1u32.to_le_bytes());

    if args.is_empty() {
        return payload;
    }

    let mut null_bitmap = vec![0u8; (args.len() + 7) / 8];
    let mut types = Vec::with_capacity(args.len() * 2);
    let mut values = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        match arg {
            Value::Null => {
                null_bitmap[i / 8] |= 1 << (i % 8);
                types.extend_from_slice(&[MYSQL_TYPE_NULL, 0]);
            }
            Value::Int(v) => {
                types.extend_from_slice(&[MYSQL_TYPE_LONGLONG, 0]);
                values.extend_from_slice(&v.to_le_bytes());
            }
            Value::UInt(v) => {
                types.extend_from_slice(&[MYSQL_TYPE_LONGLONG, PARAM_UNSIGNED_FLAG]);
                values.extend_from_slice(&v.to_le_bytes());
            }
            Value::Float(v) => {
                types.extend_from_slice(&[MYSQL_TYPE_FLOAT, 0]);
                values.extend_from_slice(&v.to_le_bytes());
            }
            Value::Double(v) => {
                types.extend_from_slice(&[MYSQL_TYPE_DOUBLE, 0]);
                values.extend_from_slice(&v.to_le_bytes());
            }
            Value::Bytes(v) => {
                types.extend_from_slice(&[MYSQL_TYPE_VAR_STRING, 0]);
                write_length_encoded_string(&mut values, v);
            }
        }
    }

    payload.extend_from_slice(&null_bitmap);
    payload.push(1); // new params bound
    payload.extend_from_slice(&types);
    payload.extend_from_slice(&values);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::{COM_FIELD_LIST, COM_PING, COM_QUERY, COM_STMT_CLOSE};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_writers_reset_sequence() {
        let (a, b) = duplex(1024);
        let mut backend = Connection::new(a);
        let mut server = Connection::new(b);

        write_command(&mut backend, COM_PING).await.unwrap();
        assert_eq!(server.read_packet().await.unwrap(), vec![COM_PING]);

        // a stale sequence from the previous exchange is discarded
        server.reset_sequence();
        write_command_str(&mut backend, COM_QUERY, "SELECT 1").await.unwrap();
        assert_eq!(server.read_packet().await.unwrap(), b"\x03SELECT 1".to_vec());

        server.reset_sequence();
        write_command_u32(&mut backend, COM_STMT_CLOSE, 7).await.unwrap();
        assert_eq!(server.read_packet().await.unwrap(), vec![COM_STMT_CLOSE, 7, 0, 0, 0]);

        server.reset_sequence();
        write_command_str_str(&mut backend, COM_FIELD_LIST, "users", "id%")
            .await
            .unwrap();
        assert_eq!(server.read_packet().await.unwrap(), b"\x04users\x00id%".to_vec());
    }

    #[test]
    fn test_build_stmt_execute_without_params() {
        assert_eq!(build_stmt_execute(3, &[]), vec![3, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_build_stmt_execute_params() {
        let payload = build_stmt_execute(
            1,
            &[Value::Int(-1), Value::Null, Value::Bytes(b"ab".to_vec())],
        );
        let params = &payload[9..];
        assert_eq!(params[0], 0b010); // null bitmap
        assert_eq!(params[1], 1);
        assert_eq!(
            &params[2..8],
            &[MYSQL_TYPE_LONGLONG, 0, MYSQL_TYPE_NULL, 0, MYSQL_TYPE_VAR_STRING, 0]
        );
        assert_eq!(&params[8..16], &(-1i64).to_le_bytes());
        assert_eq!(&params[16..], b"\x02ab");
    }
}
