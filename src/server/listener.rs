//! TCP listener for incoming MySQL clients

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};

use super::connection::{ClientConnection, ProxyContext};
use crate::error::Result;

/// Listener statistics
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections rejected due to limit
    pub connections_rejected: AtomicU64,
}

/// Accept loop; one task per client.
pub struct Listener {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    stats: Arc<ListenerStats>,
    shutdown_rx: broadcast::Receiver<()>,
    /// None = unlimited
    connection_semaphore: Option<Arc<Semaphore>>,
    next_connection_id: AtomicU32,
}

impl Listener {
    /// Bind to `server.addr`.
    pub async fn bind(
        ctx: Arc<ProxyContext>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let addr = ctx.config.server.addr.clone();
        let listener = TcpListener::bind(&addr).await?;

        let max_connections = ctx.config.server.max_connections;
        let connection_semaphore = if max_connections > 0 {
            info!(
                "Listening on {} (max {} connections, {:?} mode)",
                addr, max_connections, ctx.config.server.mode
            );
            Some(Arc::new(Semaphore::new(max_connections)))
        } else {
            info!(
                "Listening on {} (unlimited connections, {:?} mode)",
                addr, ctx.config.server.mode
            );
            None
        };

        Ok(Self {
            listener,
            ctx,
            stats: Arc::new(ListenerStats::default()),
            shutdown_rx,
            connection_semaphore,
            next_connection_id: AtomicU32::new(1),
        })
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Useful when bound to port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until shutdown. The listening socket is closed
    /// on return; sessions already running keep going.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, addr)) => self.admit(stream, addr),
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping listener");
                    break;
                }
            }
        }

        info!(
            accepted = self.stats.connections_accepted.load(Ordering::Relaxed),
            active = self.stats.connections_active.load(Ordering::Relaxed),
            rejected = self.stats.connections_rejected.load(Ordering::Relaxed),
            "Listener stopped"
        );
        Ok(())
    }

    /// Spawn the session task for a new client, or drop the socket when the
    /// connection limit is reached.
    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let permit = match &self.connection_semaphore {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(
                        client = %addr,
                        max = self.ctx.config.server.max_connections,
                        "Connection rejected: max connections reached"
                    );
                    self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            },
            None => None,
        };

        debug!(client = %addr, "Accepted connection");
        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let connection = ClientConnection::new(
            stream,
            addr,
            self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            Arc::clone(&self.ctx),
            self.shutdown_rx.resubscribe(),
        );
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            // released when the session ends
            let _permit = permit;

            if let Err(e) = connection.handle().await {
                warn!(client = %addr, error = %e, "Connection ended with error");
            }
            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            debug!(client = %addr, "Connection closed");
        });
    }
}
