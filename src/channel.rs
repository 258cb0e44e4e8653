use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{info, trace};

/// The raw socket operations a channel is built on, introduced to facilitate
///  mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    async fn readable(&self) -> io::Result<()>;

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, to).await
    }

    async fn readable(&self) -> io::Result<()> {
        UdpSocket::readable(self).await
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::try_recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// One datagram off the wire. `truncated` means the sender's datagram was
///  larger than the receive limit and `payload` holds only the first part;
///  this is distinct from a short datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub payload: Bytes,
    pub truncated: bool,
    pub from: SocketAddr,
}

/// Outcome of waiting for a channel to become readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    TimedOut,
}

/// A bound, optionally connected UDP socket with single-owner semantics:
///  created by a prober or reflector, used from one flow of control, closed
///  on drop.
///
/// Address resolution happens before a channel is constructed; the channel
///  never re-resolves.
pub struct DatagramChannel {
    socket: Arc<dyn DatagramSocket>,
    peer: Option<SocketAddr>,
}

impl DatagramChannel {
    /// A channel bound to an ephemeral local address and connected to `peer`;
    ///  replies from other sources are filtered by the kernel.
    pub async fn connected(peer: SocketAddr) -> anyhow::Result<DatagramChannel> {
        let socket = UdpSocket::bind(any_addr_for(peer)).await?;
        socket.connect(peer).await?;
        info!("connected {:?} -> {:?}", socket.local_addr()?, peer);

        Ok(DatagramChannel {
            socket: Arc::new(socket),
            peer: None,
        })
    }

    /// A channel bound to an ephemeral local address, sending to `peer`
    ///  without connecting.
    pub async fn unconnected(peer: SocketAddr) -> anyhow::Result<DatagramChannel> {
        let socket = UdpSocket::bind(any_addr_for(peer)).await?;
        info!("bound {:?}, sending to {:?}", socket.local_addr()?, peer);

        Ok(DatagramChannel {
            socket: Arc::new(socket),
            peer: Some(peer),
        })
    }

    /// A listening channel for the reflector side.
    pub async fn bound(addr: SocketAddr) -> anyhow::Result<DatagramChannel> {
        let socket = UdpSocket::bind(addr).await?;
        info!("bound receive socket to {:?}", socket.local_addr()?);

        Ok(DatagramChannel {
            socket: Arc::new(socket),
            peer: None,
        })
    }

    pub fn from_parts(socket: Arc<dyn DatagramSocket>, peer: Option<SocketAddr>) -> DatagramChannel {
        DatagramChannel { socket, peer }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one datagram: plain send on a connected channel, send-to the
    ///  pre-resolved peer otherwise. Errors are returned, not logged - the
    ///  caller decides whether to count or abort.
    pub async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        match self.peer {
            Some(to) => self.socket.send_to(payload, to).await,
            None => self.socket.send(payload).await,
        }
    }

    /// Send one datagram to an explicit destination, regardless of how the
    ///  channel was constructed. The reflector uses this to reply to the
    ///  exact source of each received datagram.
    pub async fn send_to(&self, payload: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(payload, to).await
    }

    /// Receive one datagram, blocking until one arrives. At most `max_len`
    ///  bytes are delivered; anything beyond that is reported as truncation.
    pub async fn recv(&self, max_len: usize) -> io::Result<Received> {
        loop {
            self.socket.readable().await?;
            match self.try_recv(max_len)? {
                Some(received) => return Ok(received),
                None => continue,
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is pending. Interrupted
    ///  system calls are retried transparently.
    pub fn try_recv(&self, max_len: usize) -> io::Result<Option<Received>> {
        // one spare byte so oversize datagrams are distinguishable from
        // datagrams of exactly max_len
        let mut buf = BytesMut::zeroed(max_len + 1);
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    let truncated = n > max_len;
                    buf.truncate(n.min(max_len));
                    trace!("received {} octets from {:?}", n, from);
                    return Ok(Some(Received {
                        payload: buf.freeze(),
                        truncated,
                        from,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// The single suspension point: wait until the channel is readable, an
    ///  error occurs, or the timeout elapses. `None` waits forever.
    pub async fn readiness(&self, timeout: Option<Duration>) -> io::Result<Readiness> {
        match timeout {
            None => {
                self.socket.readable().await?;
                Ok(Readiness::Readable)
            }
            Some(t) => match time::timeout(t, self.socket.readable()).await {
                Ok(Ok(())) => Ok(Readiness::Readable),
                Ok(Err(e)) => Err(e),
                Err(_) => Ok(Readiness::TimedOut),
            },
        }
    }
}

fn any_addr_for(peer: SocketAddr) -> SocketAddr {
    if peer.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    }
}
