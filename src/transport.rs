//! Byte-stream transports to an IRC server.
//!
//! [`Transport`] is the established stream (plain TCP or client-side TLS);
//! [`connect_tcp`] resolves the host and opens the TCP leg, optionally bound
//! to a local source address.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::error::ConnectError;

/// TCP keepalive idle time before the first probe.
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// Interval between TCP keepalive probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// An established connection to the server.
#[allow(clippy::large_enum_variant)]
pub enum Transport {
    /// Plain TCP.
    Tcp(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Wrap a plain TCP stream, enabling keepalive.
    pub fn tcp(stream: TcpStream) -> Self {
        if let Err(e) = Self::enable_keepalive(&stream) {
            warn!("failed to enable TCP keepalive: {}", e);
        }
        Self::Tcp(stream)
    }

    /// Wrap a TLS stream, enabling keepalive on the underlying socket.
    pub fn tls(stream: TlsStream<TcpStream>) -> Self {
        if let Err(e) = Self::enable_keepalive(stream.get_ref().0) {
            warn!("failed to enable TCP keepalive: {}", e);
        }
        Self::Tls(Box::new(stream))
    }

    fn enable_keepalive(stream: &TcpStream) -> Result<()> {
        use socket2::{SockRef, TcpKeepalive};

        let sock = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_INTERVAL);

        sock.set_tcp_keepalive(&keepalive)?;
        Ok(())
    }

    /// Whether the stream is TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Address of the server end.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(stream) => stream.peer_addr(),
            Self::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Resolve `host` and open a TCP connection, trying each address in turn.
///
/// With a `source_address`, only addresses of the same family are tried and
/// the socket is bound to it before connecting.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    source_address: Option<SocketAddr>,
) -> Result<TcpStream, ConnectError> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|source| ConnectError::Resolve {
            host: host.to_string(),
            source: Arc::new(source),
        })?
        .filter(|addr| source_address.map_or(true, |src| src.is_ipv4() == addr.is_ipv4()))
        .collect();

    let mut last_error = None;
    for addr in addrs {
        debug!(%addr, "Connection attempt");
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| ConnectError::Socket(Arc::new(e)))?;

        if let Some(source) = source_address {
            socket
                .bind(source)
                .map_err(|e| ConnectError::Socket(Arc::new(e)))?;
        }

        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "Connection attempt failed");
                last_error = Some(ConnectError::Connect {
                    addr,
                    source: Arc::new(e),
                });
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ConnectError::NoAddress(host.to_string())))
}
