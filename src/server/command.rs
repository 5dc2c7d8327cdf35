//! Command phase: dispatch, prepared statements and bad-connection retry
//!
//! After authentication every client packet starts with a command byte.
//! [`ServerConn`] decodes the command, asks its [`Handler`] for a result and
//! writes exactly one response (or none, for the fire-and-forget commands).
//! A handler that reports [`ProxyError::BadConnection`] gets up to
//! [`MAX_BAD_CONN_RETRIES`] chances to reconnect before the session is closed.
//! A [`ProxyError::Connection`] is never retried: the command may already
//! have run, so the client gets an ERR and the session ends.

use std::any::Any;
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ProxyError, Result};
use crate::protocol::mysql::binary::{
    parse_binary_float32, parse_binary_float64, parse_binary_int16, parse_binary_int32,
    parse_binary_int64, parse_binary_int8, parse_binary_uint16, parse_binary_uint32,
    parse_binary_uint64, parse_binary_uint8,
};
use crate::protocol::mysql::{
    build_column_definition, build_eof_packet, build_err_packet, build_ok_packet,
    build_stmt_prepare_ok, read_length_encoded_string, read_u16_le, read_u32_le, take,
    ColumnDefinition, Connection, EofPacket, OkPacket, COM_FIELD_LIST, COM_INIT_DB, COM_PING,
    COM_QUERY, COM_QUIT, COM_SET_OPTION, COM_STMT_CLOSE, COM_STMT_EXECUTE, COM_STMT_PREPARE,
    COM_STMT_RESET, COM_STMT_SEND_LONG_DATA, MYSQL_TYPE_BIT, MYSQL_TYPE_BLOB, MYSQL_TYPE_DATE,
    MYSQL_TYPE_DATETIME, MYSQL_TYPE_DECIMAL, MYSQL_TYPE_DOUBLE, MYSQL_TYPE_ENUM,
    MYSQL_TYPE_FLOAT, MYSQL_TYPE_GEOMETRY, MYSQL_TYPE_INT24, MYSQL_TYPE_JSON, MYSQL_TYPE_LONG,
    MYSQL_TYPE_LONGLONG, MYSQL_TYPE_LONG_BLOB, MYSQL_TYPE_MEDIUM_BLOB, MYSQL_TYPE_NEWDATE,
    MYSQL_TYPE_NEWDECIMAL, MYSQL_TYPE_NULL, MYSQL_TYPE_SET, MYSQL_TYPE_SHORT, MYSQL_TYPE_STRING,
    MYSQL_TYPE_TIME, MYSQL_TYPE_TIMESTAMP, MYSQL_TYPE_TINY, MYSQL_TYPE_TINY_BLOB,
    MYSQL_TYPE_VARCHAR, MYSQL_TYPE_VAR_STRING, MYSQL_TYPE_YEAR, PARAM_UNSIGNED_FLAG,
};
use crate::server::resultset::{QueryResult, RowFormat};

/// Reconnect attempts per command before the session is given up.
pub const MAX_BAD_CONN_RETRIES: u32 = 3;

/// One bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    /// Strings, decimals, temporal values and long data
    Bytes(Vec<u8>),
}

/// Per-statement state owned by the handler (e.g. the backend statement id).
pub type StmtContext = Box<dyn Any + Send + Sync>;

/// What a handler reports for COM_STMT_PREPARE.
pub struct Prepared {
    pub params: u16,
    pub columns: u16,
    pub context: Option<StmtContext>,
}

impl std::fmt::Debug for Prepared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prepared")
            .field("params", &self.params)
            .field("columns", &self.columns)
            .finish()
    }
}

/// A statement prepared on this session.
pub struct PreparedStatement {
    pub id: u32,
    pub query: String,
    pub params: u16,
    pub columns: u16,
    pub context: Option<StmtContext>,
    /// Two bytes per parameter (type, flags) from the last execute that
    /// bound new types.
    param_types: Vec<u8>,
    long_data: HashMap<u16, Vec<u8>>,
}

impl PreparedStatement {
    fn new(id: u32, query: String, prepared: Prepared) -> Self {
        Self {
            id,
            query,
            params: prepared.params,
            columns: prepared.columns,
            context: prepared.context,
            param_types: Vec::new(),
            long_data: HashMap::new(),
        }
    }

    /// Handler context downcast to its concrete type.
    pub fn context<T: 'static>(&self) -> Option<&T> {
        self.context.as_ref().and_then(|ctx| ctx.downcast_ref::<T>())
    }

    /// Drop long data sent since the last execute.
    pub fn reset_params(&mut self) {
        self.long_data.clear();
    }

    /// Decode the parameter block of a COM_STMT_EXECUTE.
    ///
    /// `data` starts at the NULL bitmap. Parameters with pending long data
    /// take those bytes and occupy nothing in the packet.
    fn bind_params(&mut self, data: &[u8]) -> Result<Vec<Value>> {
        let count = self.params as usize;
        if count == 0 {
            return Ok(Vec::new());
        }

        let bitmap_len = (count + 7) / 8;
        let null_bitmap = take(data, 0, bitmap_len)?;
        let mut pos = bitmap_len;

        let bound = take(data, pos, 1)?[0];
        pos += 1;
        if bound == 1 {
            self.param_types = take(data, pos, count * 2)?.to_vec();
            pos += count * 2;
        }
        if self.param_types.len() != count * 2 {
            return Err(ProxyError::Protocol("malformed packet".into()));
        }

        let mut args = Vec::with_capacity(count);
        for i in 0..count {
            if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
                args.push(Value::Null);
                continue;
            }
            if let Some(data) = self.long_data.get(&(i as u16)) {
                args.push(Value::Bytes(data.clone()));
                continue;
            }

            let field_type = self.param_types[i * 2];
            let unsigned = self.param_types[i * 2 + 1] & PARAM_UNSIGNED_FLAG != 0;
            let rest = data.get(pos..).unwrap_or_default();
            let (value, read) = decode_param(field_type, unsigned, rest)?;
            args.push(value);
            pos += read;
        }
        Ok(args)
    }
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("id", &self.id)
            .field("query", &self.query)
            .field("params", &self.params)
            .field("columns", &self.columns)
            .finish()
    }
}

fn decode_param(field_type: u8, unsigned: bool, data: &[u8]) -> Result<(Value, usize)> {
    let value = match field_type {
        MYSQL_TYPE_NULL => return Ok((Value::Null, 0)),
        MYSQL_TYPE_TINY if unsigned => (Value::UInt(parse_binary_uint8(data)? as u64), 1),
        MYSQL_TYPE_TINY => (Value::Int(parse_binary_int8(data)? as i64), 1),
        MYSQL_TYPE_SHORT | MYSQL_TYPE_YEAR if unsigned => {
            (Value::UInt(parse_binary_uint16(data)? as u64), 2)
        }
        MYSQL_TYPE_SHORT | MYSQL_TYPE_YEAR => (Value::Int(parse_binary_int16(data)? as i64), 2),
        // INT24 travels as a full 4 bytes
        MYSQL_TYPE_INT24 | MYSQL_TYPE_LONG if unsigned => {
            (Value::UInt(parse_binary_uint32(data)? as u64), 4)
        }
        MYSQL_TYPE_INT24 | MYSQL_TYPE_LONG => (Value::Int(parse_binary_int32(data)? as i64), 4),
        MYSQL_TYPE_LONGLONG if unsigned => (Value::UInt(parse_binary_uint64(data)?), 8),
        MYSQL_TYPE_LONGLONG => (Value::Int(parse_binary_int64(data)?), 8),
        MYSQL_TYPE_FLOAT => (Value::Float(parse_binary_float32(data)?), 4),
        MYSQL_TYPE_DOUBLE => (Value::Double(parse_binary_float64(data)?), 8),
        MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL | MYSQL_TYPE_VARCHAR | MYSQL_TYPE_BIT
        | MYSQL_TYPE_ENUM | MYSQL_TYPE_SET | MYSQL_TYPE_TINY_BLOB | MYSQL_TYPE_MEDIUM_BLOB
        | MYSQL_TYPE_LONG_BLOB | MYSQL_TYPE_BLOB | MYSQL_TYPE_VAR_STRING | MYSQL_TYPE_STRING
        | MYSQL_TYPE_GEOMETRY | MYSQL_TYPE_JSON | MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE
        | MYSQL_TYPE_TIMESTAMP | MYSQL_TYPE_DATETIME | MYSQL_TYPE_TIME => {
            let (value, read) = read_length_encoded_string(data)?;
            match value {
                Some(bytes) => (Value::Bytes(bytes.to_vec()), read),
                None => (Value::Null, read),
            }
        }
        other => {
            return Err(ProxyError::unknown(format!(
                "Stmt Unknown FieldType {}",
                other
            )))
        }
    };
    Ok(value)
}

/// Answers commands on behalf of a client session.
///
/// [`EmptyHandler`](crate::server::handlers::EmptyHandler) rejects
/// everything; the forwarding handler relays to the real database.
#[async_trait]
pub trait Handler: Send {
    /// COM_INIT_DB
    async fn use_db(&mut self, db: &str) -> Result<()>;

    /// COM_QUERY
    async fn handle_query(&mut self, query: &str) -> Result<QueryResult>;

    /// COM_FIELD_LIST
    async fn handle_field_list(
        &mut self,
        table: &str,
        wildcard: &str,
    ) -> Result<Vec<ColumnDefinition>>;

    async fn handle_stmt_prepare(&mut self, query: &str) -> Result<Prepared>;

    async fn handle_stmt_execute(
        &mut self,
        stmt: &PreparedStatement,
        args: &[Value],
    ) -> Result<QueryResult>;

    /// Errors are logged; COM_STMT_CLOSE has no response.
    async fn handle_stmt_close(&mut self, stmt: &PreparedStatement) -> Result<()>;

    async fn handle_stmt_reset(&mut self, _stmt: &PreparedStatement) -> Result<()> {
        Ok(())
    }

    /// Any command without a dedicated method, including COM_SET_OPTION.
    async fn handle_other_command(&mut self, cmd: u8, _data: &[u8]) -> Result<QueryResult> {
        Err(ProxyError::unknown(format!(
            "command {} is not supported now",
            cmd
        )))
    }

    /// COM_QUIT, or the session ending. May be called twice for one session.
    async fn close_conn(&mut self) -> Result<()> {
        Ok(())
    }

    /// Replace a backend connection that reported
    /// [`ProxyError::BadConnection`]. `retry` counts from 0.
    async fn reconnect(&mut self, retry: u32) -> Result<()> {
        let _ = retry;
        Err(ProxyError::BadConnection("reconnect is not supported".into()))
    }
}

/// What one command produced, before encoding.
#[derive(Debug)]
enum Response {
    Ok,
    Result(QueryResult, RowFormat),
    Fields(Vec<ColumnDefinition>),
    Prepared { id: u32, params: u16, columns: u16 },
    Eof,
    None,
}

/// Client-facing connection in the command phase.
pub struct ServerConn<S, H> {
    conn: Option<Connection<S>>,
    handler: H,
    stmts: HashMap<u32, PreparedStatement>,
    stmt_id: u32,
    peer: String,
}

impl<S, H> ServerConn<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: Handler,
{
    /// `conn` must have finished the connection phase.
    pub fn new(conn: Connection<S>, handler: H, peer: impl Into<String>) -> Self {
        Self {
            conn: Some(conn),
            handler,
            stmts: HashMap::new(),
            stmt_id: 0,
            peer: peer.into(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn statement(&self, id: u32) -> Option<&PreparedStatement> {
        self.stmts.get(&id)
    }

    pub fn statement_count(&self) -> usize {
        self.stmts.len()
    }

    /// Drop the client socket and every prepared statement.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.close().await;
        }
        self.stmts.clear();
    }

    /// Serve commands until the client quits or the session fails.
    pub async fn run(&mut self) -> Result<()> {
        let peer = self.peer.clone();
        while !self.is_closed() {
            self.handle_command(|err| {
                debug!(client = %peer, error = %err, "Command failed");
            })
            .await?;
        }
        if let Err(e) = self.handler.close_conn().await {
            debug!(client = %self.peer, error = %e, "Handler close failed");
        }
        Ok(())
    }

    /// Read, dispatch and answer one command.
    ///
    /// A failed read closes the session quietly. Non-retryable errors are
    /// passed to `on_error` and then sent to the client.
    pub async fn handle_command<F>(&mut self, mut on_error: F) -> Result<()>
    where
        F: FnMut(&ProxyError),
    {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        let data = match conn.read_packet().await {
            Ok(data) => data,
            Err(e) => {
                trace!(client = %self.peer, error = %e, "Client read failed");
                self.close().await;
                return Ok(());
            }
        };
        if data.is_empty() {
            self.close().await;
            return Err(ProxyError::Protocol("empty command packet".into()));
        }

        let mut retry = 0;
        let mut conn_err = false;
        let outcome = loop {
            match self.dispatch(&data).await {
                Err(err) if err.is_bad_connection() => {
                    if retry >= MAX_BAD_CONN_RETRIES {
                        warn!(
                            client = %self.peer,
                            retry,
                            "Backend connection retries exhausted"
                        );
                        conn_err = true;
                        break Err(err);
                    }
                    debug!(client = %self.peer, retry, error = %err, "Reconnecting backend");
                    if let Err(e) = self.handler.reconnect(retry).await {
                        warn!(client = %self.peer, retry, error = %e, "Backend reconnect failed");
                        conn_err = true;
                        break Err(e);
                    }
                    retry += 1;
                }
                Err(err) => {
                    on_error(&err);
                    conn_err = err.ends_session();
                    break Err(err);
                }
                Ok(response) => break Ok(response),
            }
        };

        let written = match self.conn.as_mut() {
            Some(conn) => {
                let written = write_response(conn, outcome).await;
                conn.reset_sequence();
                written
            }
            // QUIT closed the connection
            None => Ok(()),
        };

        if let Err(e) = written {
            debug!(client = %self.peer, error = %e, "Failed to write response");
            self.close().await;
        } else if conn_err {
            self.close().await;
        }
        Ok(())
    }

    async fn dispatch(&mut self, data: &[u8]) -> Result<Response> {
        let cmd = data[0];
        let body = &data[1..];

        match cmd {
            COM_QUIT => {
                self.handler.close_conn().await?;
                self.close().await;
                Ok(Response::None)
            }
            COM_QUERY => {
                let query = String::from_utf8_lossy(body);
                let result = self.handler.handle_query(&query).await?;
                Ok(Response::Result(result, RowFormat::Text))
            }
            COM_PING => Ok(Response::Ok),
            COM_INIT_DB => {
                self.handler.use_db(&String::from_utf8_lossy(body)).await?;
                Ok(Response::Ok)
            }
            COM_FIELD_LIST => {
                let (table, wildcard) = match body.iter().position(|&b| b == 0) {
                    Some(i) => (&body[..i], &body[i + 1..]),
                    None => (body, &[][..]),
                };
                let fields = self
                    .handler
                    .handle_field_list(
                        &String::from_utf8_lossy(table),
                        &String::from_utf8_lossy(wildcard),
                    )
                    .await?;
                Ok(Response::Fields(fields))
            }
            COM_STMT_PREPARE => self.handle_stmt_prepare(body).await,
            COM_STMT_EXECUTE => self.handle_stmt_execute(body).await,
            COM_STMT_CLOSE => {
                self.handle_stmt_close(body).await;
                Ok(Response::None)
            }
            COM_STMT_SEND_LONG_DATA => {
                self.handle_stmt_send_long_data(body);
                Ok(Response::None)
            }
            COM_STMT_RESET => self.handle_stmt_reset(body).await,
            COM_SET_OPTION => {
                self.handler.handle_other_command(cmd, body).await?;
                Ok(Response::Eof)
            }
            _ => {
                let result = self.handler.handle_other_command(cmd, body).await?;
                Ok(Response::Result(result, RowFormat::Text))
            }
        }
    }

    async fn handle_stmt_prepare(&mut self, body: &[u8]) -> Result<Response> {
        let query = String::from_utf8_lossy(body).into_owned();
        let prepared = self.handler.handle_stmt_prepare(&query).await?;

        self.stmt_id = self.stmt_id.wrapping_add(1);
        let mut stmt = PreparedStatement::new(self.stmt_id, query, prepared);
        stmt.reset_params();
        let response = Response::Prepared {
            id: stmt.id,
            params: stmt.params,
            columns: stmt.columns,
        };
        trace!(client = %self.peer, stmt_id = stmt.id, "Statement prepared");
        self.stmts.insert(stmt.id, stmt);
        Ok(response)
    }

    async fn handle_stmt_execute(&mut self, body: &[u8]) -> Result<Response> {
        if body.len() < 9 {
            return Err(ProxyError::Protocol("malformed packet".into()));
        }
        let id = read_u32_le(body)?;
        let stmt = self.stmts.get_mut(&id).ok_or(ProxyError::UnknownStatement {
            id,
            command: "stmt_execute",
        })?;

        let flags = body[4];
        // cursors are not supported
        if flags != 0 {
            return Err(ProxyError::unknown(format!("unsupported flag {}", flags)));
        }
        // iteration count (always 1) occupies body[5..9]

        let args = stmt.bind_params(&body[9..]);
        let result = match args {
            Ok(args) => self.handler.handle_stmt_execute(stmt, &args).await,
            Err(e) => Err(e),
        };
        stmt.reset_params();
        Ok(Response::Result(result?, RowFormat::Binary))
    }

    async fn handle_stmt_close(&mut self, body: &[u8]) {
        let Ok(id) = read_u32_le(body) else {
            return;
        };
        let Some(stmt) = self.stmts.remove(&id) else {
            return;
        };
        if let Err(e) = self.handler.handle_stmt_close(&stmt).await {
            if !e.is_bad_connection() {
                warn!(client = %self.peer, stmt_id = id, error = %e, "Statement close failed");
            }
        }
    }

    fn handle_stmt_send_long_data(&mut self, body: &[u8]) {
        if body.len() < 6 {
            return;
        }
        let (Ok(id), Ok(param)) = (read_u32_le(body), read_u16_le(&body[4..])) else {
            return;
        };
        match self.stmts.get_mut(&id) {
            Some(stmt) => stmt
                .long_data
                .entry(param)
                .or_default()
                .extend_from_slice(&body[6..]),
            None => debug!(client = %self.peer, stmt_id = id, "Long data for unknown statement"),
        }
    }

    async fn handle_stmt_reset(&mut self, body: &[u8]) -> Result<Response> {
        let id = read_u32_le(body).map_err(|_| ProxyError::Protocol("malformed packet".into()))?;
        let stmt = self.stmts.get_mut(&id).ok_or(ProxyError::UnknownStatement {
            id,
            command: "stmt_reset",
        })?;
        stmt.reset_params();
        self.handler.handle_stmt_reset(stmt).await?;
        Ok(Response::Ok)
    }
}

async fn write_response<S>(conn: &mut Connection<S>, outcome: Result<Response>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let capability = conn.capability();
    let response = match outcome {
        Ok(response) => response,
        Err(err) => {
            return conn
                .write_packet(&build_err_packet(&err.to_err_packet(), capability))
                .await;
        }
    };

    match response {
        Response::None => Ok(()),
        Response::Ok => {
            conn.write_packet(&build_ok_packet(&OkPacket::default(), capability))
                .await
        }
        Response::Eof => {
            conn.write_packet(&build_eof_packet(&EofPacket::default(), capability))
                .await
        }
        Response::Fields(fields) => {
            for field in &fields {
                conn.write_packet(&build_column_definition(field)).await?;
            }
            conn.write_packet(&build_eof_packet(&EofPacket::default(), capability))
                .await
        }
        Response::Prepared {
            id,
            params,
            columns,
        } => {
            conn.write_packet(&build_stmt_prepare_ok(id, columns, params, 0))
                .await?;
            let eof = build_eof_packet(&EofPacket::default(), capability);
            if params > 0 {
                let placeholder = build_column_definition(&ColumnDefinition::new("?"));
                for _ in 0..params {
                    conn.write_packet(&placeholder).await?;
                }
                conn.write_packet(&eof).await?;
            }
            if columns > 0 {
                let column = build_column_definition(&ColumnDefinition::new(""));
                for _ in 0..columns {
                    conn.write_packet(&column).await?;
                }
                conn.write_packet(&eof).await?;
            }
            Ok(())
        }
        Response::Result(result, format) => match result.encode(capability, format) {
            Ok(packets) => conn.write_packets(&packets).await,
            Err(err) => {
                conn.write_packet(&build_err_packet(&err.to_err_packet(), capability))
                    .await
            }
        },
    }
}
