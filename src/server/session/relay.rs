//! Raw byte relay between an authenticated client and its backend
//!
//! Once both connection phases are done the proxy stops interpreting
//! packets. [`Session`] copies bytes in both directions on two tasks, each
//! with its own pooled buffer, and ends the whole session when the first
//! direction finishes or shutdown is signalled.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::buffer_pool::BufferPool;

/// Why a relay session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client closed its side.
    ClientDisconnect,
    /// Database closed its side.
    ServerDisconnect,
    /// No bytes in one direction for the configured idle timeout.
    IdleTimeout { duration: Duration },
    /// Process-wide shutdown.
    Shutdown,
    /// I/O error during relay.
    IoError(String),
}

impl DisconnectReason {
    pub fn message(&self) -> String {
        match self {
            Self::ClientDisconnect => "Client disconnected".to_string(),
            Self::ServerDisconnect => "Database server disconnected".to_string(),
            Self::IdleTimeout { duration } => {
                format!("Session idle timeout ({:?}) reached", duration)
            }
            Self::Shutdown => "Proxy is shutting down".to_string(),
            Self::IoError(e) => format!("I/O error: {}", e),
        }
    }

    /// True for ends caused by either peer closing normally.
    pub fn is_normal(&self) -> bool {
        matches!(self, Self::ClientDisconnect | Self::ServerDisconnect)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Self::ClientToServer => "client->server",
            Self::ServerToClient => "server->client",
        }
    }

    fn eof_reason(self) -> DisconnectReason {
        match self {
            Self::ClientToServer => DisconnectReason::ClientDisconnect,
            Self::ServerToClient => DisconnectReason::ServerDisconnect,
        }
    }
}

/// A client leg paired with exactly one backend leg.
pub struct Session<C, S> {
    client: C,
    server: S,
    pool: Arc<BufferPool>,
    /// Zero disables the timeout
    idle_timeout: Duration,
}

impl<C, S> Session<C, S>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(client: C, server: S, pool: Arc<BufferPool>) -> Self {
        Self {
            client,
            server,
            pool,
            idle_timeout: Duration::ZERO,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Relay until one direction completes or `shutdown` fires.
    ///
    /// Both copy tasks are aborted and awaited before returning, so both
    /// sockets are closed and every pooled buffer is back in the pool.
    pub async fn relay(self, mut shutdown: broadcast::Receiver<()>) -> DisconnectReason {
        debug!(idle_timeout = ?self.idle_timeout, "Starting relay session");
        let (client_read, client_write) = split(self.client);
        let (server_read, server_write) = split(self.server);

        let mut client_to_server = spawn_copy(
            client_read,
            server_write,
            Arc::clone(&self.pool),
            Direction::ClientToServer,
            self.idle_timeout,
        );
        let mut server_to_client = spawn_copy(
            server_read,
            client_write,
            Arc::clone(&self.pool),
            Direction::ServerToClient,
            self.idle_timeout,
        );

        let (reason, done) = tokio::select! {
            result = &mut client_to_server => (finished(result), Some(Direction::ClientToServer)),
            result = &mut server_to_client => (finished(result), Some(Direction::ServerToClient)),
            _ = shutdown.recv() => (DisconnectReason::Shutdown, None),
        };

        // a completed handle must not be polled again
        let pending = match done {
            Some(Direction::ClientToServer) => vec![server_to_client],
            Some(Direction::ServerToClient) => vec![client_to_server],
            None => vec![client_to_server, server_to_client],
        };
        for task in pending {
            task.abort();
            let _ = task.await;
        }

        debug!(reason = %reason, "Relay session ended");
        reason
    }
}

fn finished(result: Result<DisconnectReason, tokio::task::JoinError>) -> DisconnectReason {
    result.unwrap_or_else(|e| DisconnectReason::IoError(e.to_string()))
}

fn spawn_copy<R, W>(
    reader: R,
    writer: W,
    pool: Arc<BufferPool>,
    direction: Direction,
    idle_timeout: Duration,
) -> JoinHandle<DisconnectReason>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match copy_with_pool(reader, writer, &pool, direction, idle_timeout).await {
            Ok(total) => {
                debug!(direction = direction.label(), bytes = total, "EOF");
                direction.eof_reason()
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                debug!(direction = direction.label(), "Idle timeout ({:?})", idle_timeout);
                DisconnectReason::IdleTimeout {
                    duration: idle_timeout,
                }
            }
            Err(e) => {
                debug!(direction = direction.label(), error = %e, "Relay copy failed");
                DisconnectReason::IoError(e.to_string())
            }
        }
    })
}

/// Copy `reader` into `writer` through one pooled buffer until EOF.
async fn copy_with_pool<R, W>(
    mut reader: R,
    mut writer: W,
    pool: &Arc<BufferPool>,
    direction: Direction,
    idle_timeout: Duration,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.acquire();
    let mut total_bytes = 0u64;

    loop {
        let n = if idle_timeout.is_zero() {
            reader.read(&mut buf[..]).await?
        } else {
            timeout(idle_timeout, reader.read(&mut buf[..]))
                .await
                .map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("Idle timeout after {:?}", idle_timeout),
                    )
                })??
        };

        if n == 0 {
            break;
        }

        trace!("{}: {} bytes", direction.label(), n);
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total_bytes += n as u64;
    }

    let _ = writer.shutdown().await;
    Ok(total_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(64, 2, 2)
    }

    #[tokio::test]
    async fn test_copy_with_pool() {
        let pool = pool();
        let (mut client, server) = duplex(256);
        let data = vec![7u8; 200];
        client.write_all(&data).await.unwrap();
        drop(client);

        // several reads through a 64-byte buffer
        let bytes = copy_with_pool(
            server,
            tokio::io::sink(),
            &pool,
            Direction::ClientToServer,
            Duration::ZERO,
        )
        .await
        .unwrap();
        assert_eq!(bytes, 200);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_copy_idle_timeout() {
        let pool = pool();
        let (_client, server) = duplex(64);
        let err = copy_with_pool(
            server,
            tokio::io::sink(),
            &pool,
            Direction::ClientToServer,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_relay_both_directions_then_client_close() {
        let pool = pool();
        let (mut app, proxy_client) = duplex(1024);
        let (proxy_server, mut db) = duplex(1024);
        let (_tx, rx) = broadcast::channel(1);

        let session = Session::new(proxy_client, proxy_server, Arc::clone(&pool));
        let relay = tokio::spawn(session.relay(rx));

        app.write_all(b"\x01\x00\x00\x00\x0e").await.unwrap();
        let mut buf = [0u8; 5];
        db.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x01\x00\x00\x00\x0e");

        db.write_all(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        drop(app);
        let reason = relay.await.unwrap();
        assert_eq!(reason, DisconnectReason::ClientDisconnect);

        // backend leg is closed too
        let mut rest = Vec::new();
        db.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_relay_server_close() {
        let pool = pool();
        let (mut app, proxy_client) = duplex(1024);
        let (proxy_server, db) = duplex(1024);
        let (_tx, rx) = broadcast::channel(1);

        let session = Session::new(proxy_client, proxy_server, Arc::clone(&pool));
        let relay = tokio::spawn(session.relay(rx));
        drop(db);

        assert_eq!(relay.await.unwrap(), DisconnectReason::ServerDisconnect);
        let mut rest = Vec::new();
        app.read_to_end(&mut rest).await.unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_relay_shutdown_closes_both_legs() {
        let pool = pool();
        let (mut app, proxy_client) = duplex(1024);
        let (proxy_server, mut db) = duplex(1024);
        let (tx, rx) = broadcast::channel(1);

        let session = Session::new(proxy_client, proxy_server, Arc::clone(&pool));
        let relay = tokio::spawn(session.relay(rx));
        tx.send(()).unwrap();

        assert_eq!(relay.await.unwrap(), DisconnectReason::Shutdown);
        let mut rest = Vec::new();
        app.read_to_end(&mut rest).await.unwrap();
        db.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let pool = pool();
        let (_app, proxy_client) = duplex(256);
        let (proxy_server, _db) = duplex(256);
        let (_tx, rx) = broadcast::channel(1);

        let reason = Session::new(proxy_client, proxy_server, Arc::clone(&pool))
            .with_idle_timeout(Duration::from_millis(50))
            .relay(rx)
            .await;
        assert!(matches!(reason, DisconnectReason::IdleTimeout { .. }));
        assert!(!reason.is_normal());
        assert_eq!(pool.outstanding(), 0);
    }
}
