//! Network provider abstraction over stream and datagram transports.
//!
//! This module provides trait-based networking that allows seamless swapping
//! between real Tokio networking and test doubles. The transport layer only
//! ever talks to these traits.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Provider trait for creating network connections, listeners and sockets.
///
/// Single-core design - no Send bounds needed.
/// Clone allows sharing providers across components efficiently.
#[async_trait(?Send)]
pub trait NetworkProvider: Clone {
    /// The stream type for this provider.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + 'static;
    /// The stream listener type for this provider.
    type TcpListener: TcpListenerTrait<TcpStream = Self::TcpStream> + 'static;
    /// The datagram socket type for this provider.
    type UdpSocket: UdpSocketTrait + 'static;

    /// Create a stream listener bound to the given address.
    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener>;

    /// Connect to a remote address from a caller-chosen local address.
    ///
    /// `local_addr` may use port 0 for an ephemeral port. Returns the
    /// connected stream together with the local address actually bound.
    /// Streams come back configured for low-latency use (Nagle disabled,
    /// keep-alive on, linger off so close returns immediately).
    async fn connect(&self, local_addr: &str, addr: &str)
    -> io::Result<(Self::TcpStream, String)>;

    /// Create a datagram socket bound to the given address, its kernel
    /// buffers sized for the largest datagram the transport carries.
    async fn bind_udp(&self, addr: &str) -> io::Result<Self::UdpSocket>;
}

/// Trait for stream listeners that can accept connections.
#[async_trait(?Send)]
pub trait TcpListenerTrait {
    /// The stream type that this listener produces.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// Accept a single incoming connection.
    ///
    /// Returns the stream and the peer address.
    async fn accept(&self) -> io::Result<(Self::TcpStream, String)>;

    /// Get the local address this listener is bound to.
    fn local_addr(&self) -> io::Result<String>;
}

/// Trait for datagram sockets.
///
/// All operations take `&self` so one socket can be shared across
/// connections (the server's accept socket is shared this way).
#[async_trait(?Send)]
pub trait UdpSocketTrait {
    /// Receive a single datagram, returning its length and source address.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, String)>;

    /// Send a single datagram to an explicit destination.
    async fn send_to(&self, buf: &[u8], addr: &str) -> io::Result<usize>;

    /// Send a single datagram to the connected destination.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Lock the socket to one peer.
    ///
    /// After connecting, datagrams from any other address are rejected by
    /// the OS and `send` uses this destination.
    async fn connect(&self, addr: &str) -> io::Result<()>;

    /// Get the local address this socket is bound to.
    fn local_addr(&self) -> io::Result<String>;
}

fn parse_addr(addr: &str) -> io::Result<SocketAddr> {
    addr.parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Real Tokio networking implementation.
#[derive(Debug, Clone)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create a new Tokio network provider.
    pub fn new() -> Self {
        Self
    }
}

impl Default for TokioNetworkProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest datagram the unreliable transport carries (IPv4 UDP ceiling);
/// the kernel buffers must hold at least one.
const DATAGRAM_BUFFER_SIZE: usize = 65_507;

/// Apply the stream socket options every StageLink stream runs with.
///
/// Nagle off for latency; keep-alive on; linger disabled so close returns
/// immediately and the FIN drains in the background. Keep-alive is beyond
/// Tokio's surface, so it goes through `socket2` on the connected handle.
fn configure_stream(stream: &tokio::net::TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_linger(None)?;
    socket2::SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

/// Raise the kernel send/receive buffers so a full-size datagram never
/// gets truncated or dropped at the socket boundary.
fn configure_datagram(socket: &tokio::net::UdpSocket) -> io::Result<()> {
    let sock = socket2::SockRef::from(socket);
    sock.set_recv_buffer_size(DATAGRAM_BUFFER_SIZE)?;
    sock.set_send_buffer_size(DATAGRAM_BUFFER_SIZE)?;
    Ok(())
}

#[async_trait(?Send)]
impl NetworkProvider for TokioNetworkProvider {
    type TcpStream = tokio::net::TcpStream;
    type TcpListener = TokioTcpListener;
    type UdpSocket = TokioUdpSocket;

    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(TokioTcpListener { inner: listener })
    }

    async fn connect(
        &self,
        local_addr: &str,
        addr: &str,
    ) -> io::Result<(Self::TcpStream, String)> {
        let local = parse_addr(local_addr)?;
        let remote = parse_addr(addr)?;
        let socket = if remote.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };
        socket.bind(local)?;
        let stream = socket.connect(remote).await?;
        configure_stream(&stream)?;
        let bound = stream.local_addr()?.to_string();
        Ok((stream, bound))
    }

    async fn bind_udp(&self, addr: &str) -> io::Result<Self::UdpSocket> {
        let socket = tokio::net::UdpSocket::bind(addr).await?;
        configure_datagram(&socket)?;
        Ok(TokioUdpSocket { inner: socket })
    }
}

/// Wrapper for Tokio TcpListener to implement our trait.
#[derive(Debug)]
pub struct TokioTcpListener {
    inner: tokio::net::TcpListener,
}

#[async_trait(?Send)]
impl TcpListenerTrait for TokioTcpListener {
    type TcpStream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::TcpStream, String)> {
        let (stream, addr) = self.inner.accept().await?;
        configure_stream(&stream)?;
        Ok((stream, addr.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}

/// Wrapper for Tokio UdpSocket to implement our trait.
#[derive(Debug)]
pub struct TokioUdpSocket {
    inner: tokio::net::UdpSocket,
}

#[async_trait(?Send)]
impl UdpSocketTrait for TokioUdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, String)> {
        let (len, addr) = self.inner.recv_from(buf).await?;
        Ok((len, addr.to_string()))
    }

    async fn send_to(&self, buf: &[u8], addr: &str) -> io::Result<usize> {
        self.inner.send_to(buf, parse_addr(addr)?).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.send(buf).await
    }

    async fn connect(&self, addr: &str) -> io::Result<()> {
        self.inner.connect(parse_addr(addr)?).await
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}
