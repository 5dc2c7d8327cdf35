//! Handler that accepts a session and supports nothing

use async_trait::async_trait;

use crate::error::{ProxyError, Result};
use crate::protocol::mysql::ColumnDefinition;
use crate::server::command::{Handler, Prepared, PreparedStatement, Value};
use crate::server::resultset::QueryResult;

/// Rejects every query and statement; database switches, closes and
/// pings succeed.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyHandler;

#[async_trait]
impl Handler for EmptyHandler {
    async fn use_db(&mut self, _db: &str) -> Result<()> {
        Ok(())
    }

    async fn handle_query(&mut self, query: &str) -> Result<QueryResult> {
        Err(ProxyError::unknown(format!("not supported now: {}", query)))
    }

    async fn handle_field_list(
        &mut self,
        table: &str,
        _wildcard: &str,
    ) -> Result<Vec<ColumnDefinition>> {
        Err(ProxyError::unknown(format!("not supported now: field list {}", table)))
    }

    async fn handle_stmt_prepare(&mut self, query: &str) -> Result<Prepared> {
        Err(ProxyError::unknown(format!("not supported now: prepare {}", query)))
    }

    async fn handle_stmt_execute(
        &mut self,
        stmt: &PreparedStatement,
        _args: &[Value],
    ) -> Result<QueryResult> {
        Err(ProxyError::unknown(format!(
            "not supported now: execute {}",
            stmt.query
        )))
    }

    async fn handle_stmt_close(&mut self, _stmt: &PreparedStatement) -> Result<()> {
        Ok(())
    }
}
