//! Handler that forwards every command to the real database
//!
//! Used in inspect mode. Each command is re-issued on the backend leg and
//! the complete response is relayed back.
//!
//! A backend leg found broken before a command goes out surfaces as
//! [`ProxyError::BadConnection`], which the dispatcher answers by calling
//! [`Handler::reconnect`] and replaying the command. Once a command has been
//! written it may already have run, so losing the response is a
//! [`ProxyError::Connection`] that ends the session instead.

use async_trait::async_trait;

use crate::client::req::{
    build_stmt_execute, write_command, write_command_buf, write_command_str,
    write_command_str_str, write_command_u32,
};
use crate::client::resp::{
    read_column_definitions, read_ok, read_prepare_ok, read_result, server_error,
    DEFAULT_MAX_RESULT_BYTES,
};
use crate::client::{BackendConnector, Mirror};
use crate::error::{ProxyError, Result};
use crate::protocol::mysql::{
    is_err_packet, ColumnDefinition, Connection, COM_FIELD_LIST, COM_INIT_DB, COM_QUERY,
    COM_QUIT, COM_STMT_CLOSE, COM_STMT_EXECUTE, COM_STMT_PREPARE, COM_STMT_RESET,
};
use crate::server::command::{Handler, Prepared, PreparedStatement, Value};
use crate::server::resultset::QueryResult;
use crate::server::stream::NetworkStream;

/// Backend statement id, stored as the statement context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BackendStmt {
    id: u32,
    /// Backend session generation the statement was prepared on
    generation: u64,
}

pub struct ForwardingHandler {
    backend: Option<Connection<NetworkStream>>,
    connector: BackendConnector,
    mirror: Mirror,
    current_db: Option<String>,
    /// Bumped on every reconnect; statements from older generations are gone
    generation: u64,
    max_result_bytes: usize,
}

impl ForwardingHandler {
    pub fn new(
        backend: Connection<NetworkStream>,
        connector: BackendConnector,
        mirror: Mirror,
    ) -> Self {
        let current_db = connector.remote().database().map(str::to_string);
        Self {
            backend: Some(backend),
            connector,
            mirror,
            current_db,
            generation: 0,
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }

    /// Cap on one buffered response; larger results become an error.
    pub fn with_max_result_bytes(mut self, max_result_bytes: usize) -> Self {
        self.max_result_bytes = max_result_bytes;
        self
    }

    fn backend(&mut self) -> Result<&mut Connection<NetworkStream>> {
        self.backend
            .as_mut()
            .ok_or_else(|| ProxyError::BadConnection("backend connection is closed".into()))
    }

    /// The backend leg, checked for a close that arrived between commands.
    async fn idle_backend(&mut self) -> Result<&mut Connection<NetworkStream>> {
        let backend = self.backend()?;
        if backend.is_peer_closed().await {
            return Err(ProxyError::BadConnection(
                "backend closed the connection between commands".into(),
            ));
        }
        Ok(backend)
    }

    fn backend_stmt(&self, stmt: &PreparedStatement, command: &'static str) -> Result<BackendStmt> {
        let backend = stmt
            .context::<BackendStmt>()
            .copied()
            .ok_or(ProxyError::UnknownStatement {
                id: stmt.id,
                command,
            })?;
        if backend.generation != self.generation {
            return Err(ProxyError::unknown(format!(
                "statement {} was lost when the backend connection was re-established",
                stmt.id
            )));
        }
        Ok(backend)
    }
}

#[async_trait]
impl Handler for ForwardingHandler {
    async fn use_db(&mut self, db: &str) -> Result<()> {
        let backend = self.idle_backend().await?;
        write_command_str(backend, COM_INIT_DB, db).await?;
        read_ok(backend).await.map_err(response_lost)?;
        self.current_db = Some(db.to_string());
        Ok(())
    }

    async fn handle_query(&mut self, query: &str) -> Result<QueryResult> {
        let limit = self.max_result_bytes;
        let backend = self.idle_backend().await?;
        write_command_str(backend, COM_QUERY, query).await?;
        let packets = read_result(backend, limit).await.map_err(response_lost)?;
        Ok(QueryResult::Packets(packets))
    }

    async fn handle_field_list(
        &mut self,
        table: &str,
        wildcard: &str,
    ) -> Result<Vec<ColumnDefinition>> {
        let backend = self.idle_backend().await?;
        write_command_str_str(backend, COM_FIELD_LIST, table, wildcard).await?;
        read_column_definitions(backend).await.map_err(response_lost)
    }

    async fn handle_stmt_prepare(&mut self, query: &str) -> Result<Prepared> {
        let generation = self.generation;
        let backend = self.idle_backend().await?;
        write_command_str(backend, COM_STMT_PREPARE, query).await?;
        let ok = read_prepare_ok(backend).await.map_err(response_lost)?;
        Ok(Prepared {
            params: ok.params,
            columns: ok.columns,
            context: Some(Box::new(BackendStmt {
                id: ok.statement_id,
                generation,
            })),
        })
    }

    async fn handle_stmt_execute(
        &mut self,
        stmt: &PreparedStatement,
        args: &[Value],
    ) -> Result<QueryResult> {
        let target = self.backend_stmt(stmt, "stmt_execute")?;
        let limit = self.max_result_bytes;
        let backend = self.idle_backend().await?;
        write_command_buf(backend, COM_STMT_EXECUTE, &build_stmt_execute(target.id, args)).await?;
        let packets = read_result(backend, limit).await.map_err(response_lost)?;
        Ok(QueryResult::Packets(packets))
    }

    async fn handle_stmt_close(&mut self, stmt: &PreparedStatement) -> Result<()> {
        let Ok(target) = self.backend_stmt(stmt, "stmt_close") else {
            return Ok(());
        };
        // no response
        write_command_u32(self.backend()?, COM_STMT_CLOSE, target.id).await
    }

    async fn handle_stmt_reset(&mut self, stmt: &PreparedStatement) -> Result<()> {
        let target = self.backend_stmt(stmt, "stmt_reset")?;
        let backend = self.idle_backend().await?;
        write_command_u32(backend, COM_STMT_RESET, target.id).await?;
        read_ok(backend).await.map_err(response_lost).map(|_| ())
    }

    async fn handle_other_command(&mut self, cmd: u8, data: &[u8]) -> Result<QueryResult> {
        let backend = self.idle_backend().await?;
        write_command_buf(backend, cmd, data).await?;
        let payload = backend.read_packet().await.map_err(response_lost)?;
        if is_err_packet(&payload) {
            return Err(server_error(&payload, backend.capability()));
        }
        Ok(QueryResult::Packets(vec![payload]))
    }

    async fn close_conn(&mut self) -> Result<()> {
        if let Some(mut backend) = self.backend.take() {
            // best effort; the backend may already be gone
            let _ = write_command(&mut backend, COM_QUIT).await;
            let _ = backend.close().await;
        }
        Ok(())
    }

    async fn reconnect(&mut self, retry: u32) -> Result<()> {
        if let Some(mut old) = self.backend.take() {
            let _ = old.close().await;
        }

        let mut backend = self.connector.connect(self.mirror).await.map_err(|e| {
            // the detail names the real account and address; log only
            warn!(retry, error = %e, "Backend reconnect failed");
            ProxyError::unknown("failed to connect to remote mysql")
        })?;

        if let Some(db) = self.current_db.as_deref() {
            if self.connector.remote().database() != Some(db) {
                write_command_str(&mut backend, COM_INIT_DB, db).await?;
                read_ok(&mut backend).await?;
            }
        }

        self.generation += 1;
        self.backend = Some(backend);
        info!(retry, "Backend connection re-established");
        Ok(())
    }
}

/// A read failure after the command reached the backend. The command may
/// have run, so it must not be replayed on a new connection.
fn response_lost(err: ProxyError) -> ProxyError {
    match err {
        ProxyError::BadConnection(detail) => {
            warn!(error = %detail, "Backend connection lost after the command was sent");
            ProxyError::Connection("lost connection to remote mysql during command".into())
        }
        other => other,
    }
}

impl std::fmt::Debug for ForwardingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingHandler")
            .field("connected", &self.backend.is_some())
            .field("connector", &self.connector)
            .field("generation", &self.generation)
            .finish()
    }
}
