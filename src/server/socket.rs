//! TCP sockets with non-blocking readiness probes.
//!
//! The listening side walks through explicit states
//! ([`UnboundSocket`] → [`BoundSocket`] → [`ListenSocket`]) so that create,
//! bind and listen failures surface as distinct errors. Accepted and
//! connected streams are wrapped in [`Socket`], whose operations all take
//! `&self` so a connection worker and the registry can share one handle.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::trace;

use super::error::SocketError;

/// Upper bound of a single receive.
pub const RECEIVE_CHUNK: usize = 1024;

pub struct UnboundSocket {
    inner: TcpSocket,
}

impl UnboundSocket {
    /// Creates a socket of the same family as `addr`, with `SO_REUSEADDR`
    /// and `SO_KEEPALIVE` enabled.
    pub fn for_addr(addr: &SocketAddr) -> Result<Self, SocketError> {
        let inner = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(SocketError::Create)?;

        inner.set_reuseaddr(true).map_err(SocketError::Create)?;
        inner.set_keepalive(true).map_err(SocketError::Create)?;
        trace!("socket created");

        Ok(Self { inner })
    }

    pub fn bind(self, addr: SocketAddr) -> Result<BoundSocket, SocketError> {
        self.inner
            .bind(addr)
            .map_err(|source| SocketError::Bind { addr, source })?;
        trace!(addr = %addr, "socket bound");

        Ok(BoundSocket { inner: self.inner })
    }
}

pub struct BoundSocket {
    inner: TcpSocket,
}

impl BoundSocket {
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.inner.local_addr().map_err(SocketError::Listen)
    }

    pub fn listen(self, backlog: u32) -> Result<ListenSocket, SocketError> {
        let inner = self.inner.listen(backlog).map_err(SocketError::Listen)?;
        trace!(backlog, "socket listening");

        Ok(ListenSocket { inner })
    }
}

pub struct ListenSocket {
    inner: TcpListener,
}

impl ListenSocket {
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.inner.local_addr().map_err(SocketError::Accept)
    }

    /// Waits for the next client. Every accepted stream is a new,
    /// independently owned [`Socket`].
    pub async fn accept(&self) -> Result<Socket, SocketError> {
        let (stream, peer_addr) = self.inner.accept().await.map_err(SocketError::Accept)?;
        stream.set_nodelay(true).map_err(SocketError::Accept)?;
        let local_addr = stream.local_addr().map_err(SocketError::Accept)?;
        trace!(peer = %peer_addr, "socket accepted");

        Ok(Socket::new(stream, local_addr, peer_addr))
    }
}

/// Outcome of a single non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Data(Vec<u8>),
    WouldBlock,
    Closed,
}

#[derive(Debug)]
pub struct Socket {
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    // Peer shut down its sending side; writes may still succeed.
    read_closed: AtomicBool,
    // An I/O call failed; the stream is unusable.
    broken: AtomicBool,
}

impl Socket {
    fn new(stream: TcpStream, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            local_addr,
            peer_addr,
            read_closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        }
    }

    /// Connects to `addr:port` in client mode.
    pub async fn connect(addr: &str, port: u16) -> Result<Self, SocketError> {
        let ip: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| SocketError::Address(addr.to_string()))?;
        let target = SocketAddr::new(ip, port);

        let stream = TcpStream::connect(target)
            .await
            .map_err(|source| SocketError::Connect {
                addr: target,
                source,
            })?;
        let local_addr = stream.local_addr().map_err(|source| SocketError::Connect {
            addr: target,
            source,
        })?;

        Ok(Self::new(stream, local_addr, target))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Raw OS handle of the stream, used to derive connection identifiers.
    /// Only unique while the socket stays open.
    #[cfg(unix)]
    pub fn identifier_seed(&self) -> u64 {
        use std::os::fd::AsRawFd;

        self.stream.as_raw_fd() as u64
    }

    #[cfg(windows)]
    pub fn identifier_seed(&self) -> u64 {
        use std::os::windows::io::AsRawSocket;

        self.stream.as_raw_socket()
    }

    /// Non-blocking hangup/error probe.
    ///
    /// A peer that only shut down its sending side is still connected: it
    /// can keep reading. A full close is reported once the kernel sees the
    /// hangup, usually after the next write draws a reset.
    pub async fn is_connected(&self) -> bool {
        if self.broken.load(Ordering::Acquire) {
            return false;
        }

        match self.probe(Interest::READABLE | Interest::WRITABLE).await {
            Some(Ok(ready)) => !ready.is_write_closed(),
            Some(Err(_)) => false,
            None => true,
        }
    }

    /// Non-blocking readability probe.
    ///
    /// A positive answer does not promise that the next read yields data: an
    /// end-of-stream also reports readable, and readiness may be stale. Use
    /// [`Socket::try_receive`] when the answer matters.
    pub async fn is_data_waiting(&self) -> bool {
        match self.probe(Interest::READABLE).await {
            Some(Ok(ready)) => ready.is_readable(),
            _ => false,
        }
    }

    /// Whether the peer has shut down its sending side.
    pub fn is_read_closed(&self) -> bool {
        self.read_closed.load(Ordering::Acquire)
    }

    /// Reads at most one chunk without waiting. Once end-of-stream was seen,
    /// returns [`Received::Closed`] without touching the stream.
    pub fn try_receive(&self) -> Result<Received, SocketError> {
        if self.is_read_closed() {
            return Ok(Received::Closed);
        }
        let mut buf = [0u8; RECEIVE_CHUNK];

        match self.stream.try_read(&mut buf) {
            Ok(0) => {
                self.read_closed.store(true, Ordering::Release);
                Ok(Received::Closed)
            }
            Ok(n) => Ok(Received::Data(buf[..n].to_vec())),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Received::WouldBlock),
            Err(err) => {
                self.broken.store(true, Ordering::Release);
                Err(SocketError::Receive(err))
            }
        }
    }

    /// Waits until the stream is readable and returns up to one chunk. An
    /// empty buffer means the peer shut down its sending side.
    pub async fn receive(&self) -> Result<Vec<u8>, SocketError> {
        loop {
            self.stream.readable().await.map_err(SocketError::Receive)?;

            match self.try_receive()? {
                Received::Data(data) => return Ok(data),
                Received::Closed => return Ok(Vec::new()),
                Received::WouldBlock => continue,
            }
        }
    }

    /// Writes `data` in a single call. A partial write is reported as
    /// [`SocketError::ShortWrite`] and never resumed.
    pub async fn send(&self, data: &[u8]) -> Result<(), SocketError> {
        loop {
            self.stream.writable().await.map_err(SocketError::Send)?;

            match self.stream.try_write(data) {
                Ok(n) if n == data.len() => return Ok(()),
                Ok(n) => {
                    return Err(SocketError::ShortWrite {
                        sent: n,
                        expected: data.len(),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => {
                    self.broken.store(true, Ordering::Release);
                    return Err(SocketError::Send(err));
                }
            }
        }
    }

    async fn probe(&self, interest: Interest) -> Option<io::Result<Ready>> {
        tokio::select! {
            biased;
            ready = self.stream.ready(interest) => Some(ready),
            _ = std::future::ready(()) => None,
        }
    }
}
