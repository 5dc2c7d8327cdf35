//! One socket type for plain and TLS legs
//!
//! Both the client leg (after an SSLRequest) and the backend leg (when the
//! database advertises CLIENT_SSL) may switch from TCP to TLS mid-handshake.
//! `NetworkStream` lets a [`Connection`](crate::protocol::mysql::Connection)
//! keep a single concrete stream type across that switch.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

use crate::tls::{TlsAcceptor, TlsConnector, TlsError};

/// TLS variants are boxed; a rustls session is far larger than a TcpStream.
pub enum NetworkStream {
    Tcp(TcpStream),
    /// Client leg after the proxy accepted an SSLRequest
    ServerTls(Box<ServerTlsStream<TcpStream>>),
    /// Backend leg after the proxy sent an SSLRequest
    ClientTls(Box<ClientTlsStream<TcpStream>>),
}

impl std::fmt::Debug for NetworkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            NetworkStream::Tcp(_) => "Tcp",
            NetworkStream::ServerTls(_) => "ServerTls",
            NetworkStream::ClientTls(_) => "ClientTls",
        };
        f.debug_struct("NetworkStream")
            .field("kind", &kind)
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

fn version_name(version: Option<rustls::ProtocolVersion>) -> Option<&'static str> {
    version.map(|v| match v {
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2",
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3",
        _ => "TLS (unknown version)",
    })
}

impl NetworkStream {
    pub fn tcp(stream: TcpStream) -> Self {
        NetworkStream::Tcp(stream)
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, NetworkStream::Tcp(_))
    }

    /// Negotiated TLS version, for connection logs.
    pub fn tls_version(&self) -> Option<&'static str> {
        match self {
            NetworkStream::Tcp(_) => None,
            NetworkStream::ServerTls(tls) => version_name(tls.get_ref().1.protocol_version()),
            NetworkStream::ClientTls(tls) => version_name(tls.get_ref().1.protocol_version()),
        }
    }

    fn tcp_ref(&self) -> &TcpStream {
        match self {
            NetworkStream::Tcp(stream) => stream,
            NetworkStream::ServerTls(tls) => tls.get_ref().0,
            NetworkStream::ClientTls(tls) => tls.get_ref().0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp_ref().peer_addr()
    }
}

/// Streams that can switch to TLS in the middle of a MySQL handshake.
///
/// The handshake code is generic over this so it can be driven by plain
/// sockets in production and in-memory pipes in unit tests.
#[async_trait]
pub trait TlsUpgrade: AsyncRead + AsyncWrite + Unpin + Send + Sized {
    /// Server-side upgrade after the client's SSLRequest.
    async fn accept_tls(self, acceptor: &TlsAcceptor) -> Result<Self, TlsError>;

    /// Client-side upgrade after the proxy's own SSLRequest.
    async fn connect_tls(self, connector: &TlsConnector, server_name: &str)
        -> Result<Self, TlsError>;
}

#[async_trait]
impl TlsUpgrade for NetworkStream {
    async fn accept_tls(self, acceptor: &TlsAcceptor) -> Result<Self, TlsError> {
        match self {
            NetworkStream::Tcp(tcp) => {
                let tls = acceptor.accept(tcp).await?;
                Ok(NetworkStream::ServerTls(Box::new(tls)))
            }
            _ => Err(TlsError::config("stream is already encrypted")),
        }
    }

    async fn connect_tls(
        self,
        connector: &TlsConnector,
        server_name: &str,
    ) -> Result<Self, TlsError> {
        match self {
            NetworkStream::Tcp(tcp) => {
                let tls = connector.connect(tcp, server_name).await?;
                Ok(NetworkStream::ClientTls(Box::new(tls)))
            }
            _ => Err(TlsError::config("stream is already encrypted")),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl TlsUpgrade for tokio::io::DuplexStream {
    async fn accept_tls(self, _acceptor: &TlsAcceptor) -> Result<Self, TlsError> {
        Err(TlsError::config("in-memory stream cannot be encrypted"))
    }

    async fn connect_tls(
        self,
        _connector: &TlsConnector,
        _server_name: &str,
    ) -> Result<Self, TlsError> {
        Err(TlsError::config("in-memory stream cannot be encrypted"))
    }
}

impl AsyncRead for NetworkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            NetworkStream::ServerTls(stream) => Pin::new(stream).poll_read(cx, buf),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetworkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            NetworkStream::ServerTls(stream) => Pin::new(stream).poll_write(cx, buf),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            NetworkStream::ServerTls(stream) => Pin::new(stream).poll_flush(cx),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            NetworkStream::ServerTls(stream) => Pin::new(stream).poll_shutdown(cx),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
