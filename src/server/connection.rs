//! Per-client pipeline
//!
//! One [`ClientConnection`] runs per accepted socket:
//! 1. client handshake against the fake identity
//! 2. secret lookup and backend login, mirroring the client's capabilities
//! 3. final OK (or ERR) to the client
//! 4. raw relay, or command dispatch through [`ForwardingHandler`] in
//!    inspect mode

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::Instrument;

use super::command::{Handler, ServerConn};
use super::credential::{CredentialProvider, InMemoryProvider};
use super::handlers::ForwardingHandler;
use super::handshake::ServerHandshake;
use super::session::Session;
use super::stream::NetworkStream;
use crate::buffer_pool::BufferPool;
use crate::client::{BackendConnector, Mirror};
use crate::config::{Config, RelayMode, SecretSource};
use crate::error::{ProxyError, Result};
use crate::protocol::mysql::Connection;
use crate::tls::{TlsAcceptor, TlsConnector};

/// Everything a session needs that is shared across the process.
pub struct ProxyContext {
    pub config: Arc<Config>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub secrets: SecretSource,
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    pub backend_tls: Option<Arc<TlsConnector>>,
    pub pool: Arc<BufferPool>,
}

impl ProxyContext {
    /// Build the shared state from a validated config.
    ///
    /// Registers the fake identity and sets up TLS on both legs when
    /// enabled. The secret source is not contacted here.
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let identity = &config.fake_identity;
        let credentials: Arc<dyn CredentialProvider> = Arc::new(InMemoryProvider::with_user(
            &identity.username,
            &identity.password,
        ));

        let tls_acceptor = if config.server.tls.enabled {
            Some(Arc::new(TlsAcceptor::new(&config.server.tls)?))
        } else {
            None
        };
        let backend_tls = if config.confidential.tls.enabled {
            Some(Arc::new(TlsConnector::new(&config.confidential.tls)?))
        } else {
            None
        };

        let pool_config = &config.buffer_pool;
        let pool = BufferPool::new(
            pool_config.buffer_size,
            pool_config.fast_slots,
            pool_config.overflow_slots,
        );

        Ok(Self {
            secrets: SecretSource::from_config(&config.confidential)?,
            config,
            credentials,
            tls_acceptor,
            backend_tls,
            pool,
        })
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.connect_timeout_secs)
    }
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("mode", &self.config.server.mode)
            .field("client_tls", &self.tls_acceptor.is_some())
            .field("backend_tls", &self.backend_tls.is_some())
            .finish()
    }
}

/// One accepted client socket.
pub struct ClientConnection {
    stream: TcpStream,
    client_addr: SocketAddr,
    connection_id: u32,
    ctx: Arc<ProxyContext>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ClientConnection {
    pub fn new(
        stream: TcpStream,
        client_addr: SocketAddr,
        connection_id: u32,
        ctx: Arc<ProxyContext>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            stream,
            client_addr,
            connection_id,
            ctx,
            shutdown_rx,
        }
    }

    /// Drive the connection to completion.
    pub async fn handle(self) -> Result<()> {
        let span = tracing::info_span!(
            target: "mysql_credential_proxy",
            "connection",
            client = %self.client_addr,
            id = self.connection_id
        );
        self.run().instrument(span).await
    }

    async fn run(self) -> Result<()> {
        debug!("New connection");
        let _ = self.stream.set_nodelay(true);
        let ctx = Arc::clone(&self.ctx);
        let peer = self.client_addr.to_string();

        let mut handshake = ServerHandshake::new(self.connection_id, peer.clone())
            .with_tls(ctx.tls_acceptor.is_some());
        let accepted = timeout(
            ctx.connect_timeout(),
            handshake.accept(
                Connection::new(NetworkStream::tcp(self.stream)),
                ctx.credentials.as_ref(),
                ctx.tls_acceptor.as_deref(),
            ),
        )
        .await
        .map_err(|_| ProxyError::Timeout("client handshake".into()))?;
        let mut client = accepted?;

        let mirror = Mirror::from_connection(&client);
        let (connector, backend) = match connect_backend(&ctx, mirror).await {
            Ok(pair) => {
                handshake.finish(&mut client, &Ok(())).await?;
                pair
            }
            Err(e) => {
                // the detail names the real account and address; log only
                warn!(error = %e, "Backend connection failed");
                handshake.finish(&mut client, &Err(backend_unavailable())).await?;
                let _ = client.close().await;
                return Err(e);
            }
        };

        info!(
            user = %handshake.user(),
            backend = %connector.remote().addr(),
            client_tls = client.get_ref().is_encrypted(),
            backend_tls = backend.get_ref().is_encrypted(),
            "Session established"
        );

        match ctx.config.server.mode {
            RelayMode::Relay => {
                let idle = Duration::from_secs(ctx.config.server.idle_timeout_secs);
                let session = Session::new(
                    client.into_inner(),
                    backend.into_inner(),
                    Arc::clone(&ctx.pool),
                )
                .with_idle_timeout(idle);
                let reason = session.relay(self.shutdown_rx).await;
                if reason.is_normal() {
                    info!(reason = %reason, "Session closed");
                } else {
                    warn!(reason = %reason, "Session closed");
                }
            }
            RelayMode::Inspect => {
                let handler = ForwardingHandler::new(backend, connector, mirror)
                    .with_max_result_bytes(ctx.config.server.max_result_bytes);
                let mut session = ServerConn::new(client, handler, peer);
                inspect(&mut session, self.shutdown_rx).await?;
            }
        }
        handshake.close();
        Ok(())
    }
}

/// What a client is told when its backend leg cannot be opened.
fn backend_unavailable() -> ProxyError {
    ProxyError::unknown("failed to connect to remote mysql")
}

async fn connect_backend(
    ctx: &ProxyContext,
    mirror: Mirror,
) -> Result<(BackendConnector, Connection<NetworkStream>)> {
    let remote = ctx.secrets.remote_mysql().await?;
    let mut connector = BackendConnector::new(remote, ctx.connect_timeout());
    if let Some(tls) = &ctx.backend_tls {
        connector = connector.with_tls(
            Arc::clone(tls),
            ctx.config.confidential.tls.server_name.as_deref(),
        );
    }
    let backend = connector.connect(mirror).await?;
    Ok((connector, backend))
}

/// Dispatch commands until the client leaves or shutdown fires.
async fn inspect(
    session: &mut ServerConn<NetworkStream, ForwardingHandler>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let stopped = tokio::select! {
        result = session.run() => {
            result?;
            false
        }
        _ = shutdown_rx.recv() => true,
    };
    if stopped {
        info!("Shutdown signal received, closing session");
        let _ = session.handler_mut().close_conn().await;
        session.close().await;
    } else {
        info!("Session closed");
    }
    Ok(())
}
