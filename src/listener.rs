//! The ready-to-accept listener and its connection type.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

use crate::autocert::ACME_TLS_ALPN;
use crate::socket;
use crate::tls::TlsContext;

/// A configured, ready-to-accept stream listener.
///
/// Accepted connections are tuned (keep-alive, no-delay) and, when TLS is
/// configured, handed back only after a completed handshake. Dropping the
/// listener closes the bound socket and releases the certificate
/// subsystem with it.
pub struct Listener {
    inner: TcpListener,
    nodelay: bool,
    tls: Option<TlsContext>,
}

impl Listener {
    pub(crate) fn new(inner: TcpListener, nodelay: bool, tls: Option<TlsContext>) -> Self {
        Self {
            inner,
            nodelay,
            tls,
        }
    }

    /// Accept the next connection.
    ///
    /// Failures on an individual connection (socket tuning, TLS
    /// handshake, certificate resolution) affect only that connection;
    /// the listener keeps accepting. Safe to call concurrently from
    /// multiple tasks.
    pub async fn accept(&self) -> io::Result<(Stream, SocketAddr)> {
        let (tcp, peer) = self.inner.accept().await?;
        if let Err(e) = socket::tune_stream(&tcp, self.nodelay) {
            warn!(peer = %peer, error = %e, "socket tuning failed");
        }
        match &self.tls {
            None => Ok((Stream::Plain(tcp), peer)),
            Some(tls) => {
                let stream = handshake(tls, tcp).await?;
                debug!(peer = %peer, "tls handshake completed");
                Ok((Stream::Tls(Box::new(stream)), peer))
            }
        }
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Whether accepted connections are TLS-terminated.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// The assembled TLS configuration, for inspection.
    pub fn tls_config(&self) -> Option<Arc<ServerConfig>> {
        self.tls.as_ref().map(|tls| tls.config.clone())
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.inner.local_addr().ok())
            .field("nodelay", &self.nodelay)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Run the TLS handshake for one accepted connection.
///
/// With automatic issuance configured, the ClientHello is inspected
/// first: when the requested name has no static certificate and the
/// handshake is not an `acme-tls/1` validation probe, a certificate is
/// resolved (possibly issued) before the handshake completes against the
/// shared config. Only the triggering connection waits.
async fn handshake(tls: &TlsContext, tcp: TcpStream) -> io::Result<TlsStream<TcpStream>> {
    let Some(auto) = &tls.auto else {
        return tls.acceptor.accept(tcp).await;
    };

    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), tcp).await?;
    let wanted = {
        let hello = start.client_hello();
        let challenge = hello
            .alpn()
            .map_or(false, |mut protos| protos.any(|p| p == ACME_TLS_ALPN));
        match hello.server_name() {
            Some(name) if !challenge && !tls.resolver.has_static_match(name) => {
                Some(name.to_string())
            }
            _ => None,
        }
    };
    if let Some(host) = wanted {
        auto.obtain(&host)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    }
    start.into_stream(tls.config.clone()).await
}

/// An accepted connection, plain or TLS-terminated.
pub enum Stream {
    /// Plain TCP connection.
    Plain(TcpStream),
    /// TLS-terminated connection.
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    /// The underlying TCP stream, for socket inspection.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            Stream::Tls(s) => s.get_ref().0,
        }
    }

    /// Peer address of the connection.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Whether the connection is TLS-terminated.
    pub fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("peer", &self.peer_addr().ok())
            .field("tls", &self.is_tls())
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
