use socket2::{Domain, Type};
use std::io;
use std::net::SocketAddr;
use tracing::debug;

/// Receive buffer size: comfortably above the largest armored packet.
pub const MAX_DATAGRAM: usize = 2048;

/// Bound UDP socket for a skein host. Thin wrapper over tokio's socket
/// that applies address reuse at bind time so restarted nodes can rebind
/// promptly.
pub struct UdpSocket {
    inner: tokio::net::UdpSocket,
}

impl UdpSocket {
    /// Bind to `addr`, falling back to an ephemeral port if `addr`'s port
    /// is taken.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        match Self::bind_exact(addr).await {
            Ok(sock) => Ok(sock),
            Err(e) if addr.port() != 0 => {
                debug!(%addr, error = %e, "requested port unavailable, binding ephemeral");
                let mut any = addr;
                any.set_port(0);
                Self::bind_exact(any).await
            }
            Err(e) => Err(e),
        }
    }

    async fn bind_exact(addr: SocketAddr) -> io::Result<Self> {
        let domain = Domain::for_address(addr);
        let socket = socket2::Socket::new(domain, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        let std_sock: std::net::UdpSocket = socket.into();
        std_sock.set_nonblocking(true)?;
        let inner = tokio::net::UdpSocket::from_std(std_sock)?;
        debug!(local = %inner.local_addr()?, "udp socket bound");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, dst).await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }
}
