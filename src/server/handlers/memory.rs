//! In-memory handler with canned results
//!
//! Serves fixed answers without any backend. Used to exercise the command
//! phase in tests and to run the proxy front end on its own.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{ProxyError, Result};
use crate::protocol::mysql::{ColumnDefinition, ErrPacket, OkPacket};
use crate::server::command::{Handler, Prepared, PreparedStatement, Value};
use crate::server::resultset::QueryResult;

/// What the in-memory handler saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    UseDb(String),
    Query(String),
    FieldList(String, String),
    Prepare(String),
    Execute(String, Vec<Value>),
    Close(String),
    Reset(String),
    Other(u8),
    Quit,
}

#[derive(Debug, Default)]
pub struct MemoryHandler {
    results: HashMap<String, QueryResult>,
    tables: HashMap<String, Vec<ColumnDefinition>>,
    databases: Vec<String>,
    current_db: Option<String>,
    calls: Vec<Call>,
}

impl MemoryHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `query` (exact text) and statements prepared from it.
    pub fn with_result(mut self, query: impl Into<String>, result: QueryResult) -> Self {
        self.results.insert(query.into(), result);
        self
    }

    /// Columns returned by COM_FIELD_LIST for `table`.
    pub fn with_table(mut self, table: impl Into<String>, columns: Vec<ColumnDefinition>) -> Self {
        self.tables.insert(table.into(), columns);
        self
    }

    /// Schemas COM_INIT_DB accepts. With none registered any name works.
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.databases.push(db.into());
        self
    }

    pub fn current_db(&self) -> Option<&str> {
        self.current_db.as_deref()
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    fn lookup(&self, query: &str) -> Result<QueryResult> {
        self.results
            .get(query)
            .cloned()
            .ok_or_else(|| no_result(query))
    }
}

#[async_trait]
impl Handler for MemoryHandler {
    async fn use_db(&mut self, db: &str) -> Result<()> {
        self.calls.push(Call::UseDb(db.to_string()));
        if !self.databases.is_empty() && !self.databases.iter().any(|d| d == db) {
            return Err(ProxyError::Server(ErrPacket::with_state(
                1049,
                *b"42000",
                format!("Unknown database '{}'", db),
            )));
        }
        self.current_db = Some(db.to_string());
        Ok(())
    }

    async fn handle_query(&mut self, query: &str) -> Result<QueryResult> {
        self.calls.push(Call::Query(query.to_string()));
        self.lookup(query)
    }

    async fn handle_field_list(
        &mut self,
        table: &str,
        wildcard: &str,
    ) -> Result<Vec<ColumnDefinition>> {
        self.calls
            .push(Call::FieldList(table.to_string(), wildcard.to_string()));
        self.tables.get(table).cloned().ok_or_else(|| {
            ProxyError::Server(ErrPacket::with_state(
                1146,
                *b"42S02",
                format!("Table '{}' doesn't exist", table),
            ))
        })
    }

    async fn handle_stmt_prepare(&mut self, query: &str) -> Result<Prepared> {
        self.calls.push(Call::Prepare(query.to_string()));
        let columns = match self.results.get(query) {
            Some(QueryResult::Rows(rs)) => rs.columns.len() as u16,
            Some(_) => 0,
            None => return Err(no_result(query)),
        };
        Ok(Prepared {
            params: query.matches('?').count() as u16,
            columns,
            context: None,
        })
    }

    async fn handle_stmt_execute(
        &mut self,
        stmt: &PreparedStatement,
        args: &[Value],
    ) -> Result<QueryResult> {
        self.calls
            .push(Call::Execute(stmt.query.clone(), args.to_vec()));
        self.lookup(&stmt.query)
    }

    async fn handle_stmt_close(&mut self, stmt: &PreparedStatement) -> Result<()> {
        self.calls.push(Call::Close(stmt.query.clone()));
        Ok(())
    }

    async fn handle_stmt_reset(&mut self, stmt: &PreparedStatement) -> Result<()> {
        self.calls.push(Call::Reset(stmt.query.clone()));
        Ok(())
    }

    async fn handle_other_command(&mut self, cmd: u8, _data: &[u8]) -> Result<QueryResult> {
        self.calls.push(Call::Other(cmd));
        Ok(QueryResult::Ok(OkPacket::default()))
    }

    async fn close_conn(&mut self) -> Result<()> {
        if self.calls.last() != Some(&Call::Quit) {
            self.calls.push(Call::Quit);
        }
        Ok(())
    }
}

fn no_result(query: &str) -> ProxyError {
    ProxyError::Server(ErrPacket::with_state(
        1064,
        *b"42000",
        format!("no canned result for '{}'", query),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::{
        build_column_definition, parse_err_packet, Connection, CLIENT_PROTOCOL_41,
        MYSQL_TYPE_LONG,
    };
    use crate::server::command::ServerConn;
    use crate::server::resultset::ResultSet;
    use tokio::io::{duplex, DuplexStream};

    fn users() -> QueryResult {
        let mut id = ColumnDefinition::new("id");
        id.column_type = MYSQL_TYPE_LONG;
        let mut rs = ResultSet::new(vec![id, ColumnDefinition::new("name")]);
        rs.push_row([Some("1"), Some("alice")]);
        QueryResult::Rows(rs)
    }

    fn session(
        handler: MemoryHandler,
    ) -> (ServerConn<DuplexStream, MemoryHandler>, Connection<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let mut server = Connection::new(a);
        server.set_capabilities(CLIENT_PROTOCOL_41);
        (ServerConn::new(server, handler, "test"), Connection::new(b))
    }

    async fn roundtrip(
        srv: &mut ServerConn<DuplexStream, MemoryHandler>,
        client: &mut Connection<DuplexStream>,
        payload: &[u8],
        replies: usize,
    ) -> Vec<Vec<u8>> {
        client.reset_sequence();
        client.write_packet(payload).await.unwrap();
        srv.handle_command(|_| {}).await.unwrap();
        let mut packets = Vec::new();
        for _ in 0..replies {
            packets.push(client.read_packet().await.unwrap());
        }
        packets
    }

    #[tokio::test]
    async fn test_prepared_statement_against_canned_rows() {
        let query = "SELECT id, name FROM users WHERE id = ?";
        let handler = MemoryHandler::new().with_result(query, users());
        let (mut srv, mut client) = session(handler);

        let mut prepare = vec![0x16];
        prepare.extend_from_slice(query.as_bytes());
        // OK, 1 param + EOF, 2 columns + EOF
        let packets = roundtrip(&mut srv, &mut client, &prepare, 6).await;
        assert_eq!(&packets[0][5..9], &[2, 0, 1, 0]);

        let mut execute = vec![0x17, 1, 0, 0, 0, 0, 1, 0, 0, 0];
        execute.extend_from_slice(&[0x00, 1, MYSQL_TYPE_LONG, 0]);
        execute.extend_from_slice(&1i32.to_le_bytes());
        let packets = roundtrip(&mut srv, &mut client, &execute, 6).await;
        // binary row: header, bitmap, LONG 1, "alice"
        assert_eq!(packets[4], b"\x00\x00\x01\x00\x00\x00\x05alice".to_vec());

        assert_eq!(
            srv.handler().calls(),
            &[
                Call::Prepare(query.to_string()),
                Call::Execute(query.to_string(), vec![Value::Int(1)]),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_query_and_table() {
        let handler = MemoryHandler::new().with_table("users", vec![ColumnDefinition::new("id")]);
        let (mut srv, mut client) = session(handler);

        let packets = roundtrip(&mut srv, &mut client, b"\x03DROP TABLE users", 1).await;
        let err = parse_err_packet(&packets[0], CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(err.error_code, 1064);

        let packets = roundtrip(&mut srv, &mut client, b"\x04users\x00", 2).await;
        assert_eq!(
            packets[0],
            build_column_definition(&ColumnDefinition::new("id"))
        );

        let packets = roundtrip(&mut srv, &mut client, b"\x04orders\x00", 1).await;
        let err = parse_err_packet(&packets[0], CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(err.error_code, 1146);
    }

    #[tokio::test]
    async fn test_init_db_checks_known_schemas() {
        let handler = MemoryHandler::new().with_database("shop");
        let (mut srv, mut client) = session(handler);

        let packets = roundtrip(&mut srv, &mut client, b"\x02shop", 1).await;
        assert_eq!(packets[0][0], 0x00);
        let packets = roundtrip(&mut srv, &mut client, b"\x02nope", 1).await;
        assert_eq!(packets[0][0], 0xFF);
        assert_eq!(srv.handler().current_db(), Some("shop"));
    }
}
