//! Raw socket acquisition and tuning.
//!
//! Binds stream sockets with optional platform fast open and wraps
//! accepted connections with keep-alive and no-delay tuning.

mod fastopen;

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::ListenError;

/// Keep-alive probe time for accepted connections. Conservative enough to
/// reclaim dead peers without probing aggressively.
const KEEPALIVE_TIME: Duration = Duration::from_secs(180);

/// Listen backlog for new sockets.
const BACKLOG: i32 = 1024;

/// Bind a listening stream socket for `addr`.
///
/// An empty address means ":0". An empty host binds all interfaces,
/// preferring the IPv6 unspecified address; port 0 selects an ephemeral
/// port. Hostnames are resolved and candidate addresses tried in
/// dual-stack order.
pub(crate) async fn bind(addr: &str, fast_open: bool) -> Result<TcpListener, ListenError> {
    let candidates = resolve(addr).await?;
    let mut last_err: Option<io::Error> = None;
    for candidate in candidates {
        match bind_socket(candidate, fast_open) {
            Ok(listener) => {
                debug!(addr = %candidate, fast_open, "listener bound");
                return Ok(listener);
            }
            Err(ListenError::Bind { source, .. }) => last_err = Some(source),
            Err(e) => return Err(e),
        }
    }
    Err(ListenError::Bind {
        addr: addr.to_string(),
        source: last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address")
        }),
    })
}

/// Split and resolve the listen address into bind candidates.
async fn resolve(addr: &str) -> Result<Vec<SocketAddr>, ListenError> {
    let full = if addr.is_empty() { ":0" } else { addr };
    let (host, port) = full.rsplit_once(':').ok_or_else(|| ListenError::Address {
        addr: full.to_string(),
        reason: "missing port".to_string(),
    })?;
    let port: u16 = port.parse().map_err(|_| ListenError::Address {
        addr: full.to_string(),
        reason: format!("invalid port {port:?}"),
    })?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Ok(vec![
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        ]);
    }

    let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ListenError::Address {
            addr: full.to_string(),
            reason: e.to_string(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ListenError::Address {
            addr: full.to_string(),
            reason: "no resolved socket address".to_string(),
        });
    }
    addrs.sort_by_key(priority);
    Ok(addrs)
}

fn priority(addr: &SocketAddr) -> u8 {
    match addr {
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => 0,
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => 1,
        SocketAddr::V6(_) => 2,
        SocketAddr::V4(_) => 3,
    }
}

fn bind_socket(addr: SocketAddr, fast_open: bool) -> Result<TcpListener, ListenError> {
    let bind_err = |source: io::Error| ListenError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket =
        Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    #[cfg(unix)]
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    if fast_open {
        fastopen::enable(&socket).map_err(ListenError::FastOpen)?;
    }
    socket.listen(BACKLOG).map_err(bind_err)?;
    TcpListener::from_std(socket.into()).map_err(bind_err)
}

/// Tune an accepted connection: no-delay per configuration, keep-alive on
/// with a conservative probe time.
pub(crate) fn tune_stream(stream: &TcpStream, nodelay: bool) -> io::Result<()> {
    stream.set_nodelay(nodelay)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))?;
    Ok(())
}
