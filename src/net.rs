//! Concrete UDP socket layer: non-blocking datagrams with raised buffer
//! sizes and a `poll(2)`-based readiness wait.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::error::{Error, Result};

/// A non-blocking UDP endpoint, IPv4 only, with send/receive buffers raised
/// to the configured size on a best-effort basis.
pub struct UdpTransport {
    socket: UdpSocket,
    /// Debug-mode outgoing packet drop probability. Only consulted when the
    /// crate is built with the `chaos` feature.
    drop_rate: f32,
}

impl UdpTransport {
    /// Binds a socket to `addr`, sets non-blocking mode, and tries to raise
    /// both socket buffers to `buf_bytes` (logging a warning, not failing,
    /// if the OS refuses). `drop_rate` is consulted at the send boundary
    /// only under the `chaos` feature.
    pub fn bind(addr: SocketAddr, buf_bytes: usize, drop_rate: f32) -> Result<Self> {
        if !addr.is_ipv4() {
            return Err(Error::AddrInvalid);
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(|e| {
            log::error!("failed to create UDP socket: {e}");
            Error::SocketCreate
        })?;

        if let Err(e) = socket.set_recv_buffer_size(buf_bytes) {
            log::warn!("failed to raise receive buffer to {buf_bytes} bytes: {e}");
        }
        if let Err(e) = socket.set_send_buffer_size(buf_bytes) {
            log::warn!("failed to raise send buffer to {buf_bytes} bytes: {e}");
        }

        socket.bind(&addr.into()).map_err(|e| {
            log::error!("failed to bind {addr}: {e}");
            Error::SocketBind
        })?;
        socket.set_nonblocking(true).map_err(|e| {
            log::warn!("failed to set non-blocking mode: {e}");
            Error::SocketCreate
        })?;

        Ok(Self {
            socket: socket.into(),
            drop_rate: drop_rate.clamp(0.0, 1.0),
        })
    }

    /// Sends one datagram. A would-block error is not logged — callers
    /// surface it as `Error::Busy`, a transient condition distinct from a
    /// real socket failure.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        #[cfg(feature = "chaos")]
        if crate::clock::DropSimulator::new(self.drop_rate).should_drop() {
            log::debug!("chaos: simulated drop of outgoing packet to {addr}");
            return Ok(buf.len());
        }

        match self.socket.send_to(buf, addr) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::Busy),
            Err(e) => {
                log::warn!("send_to {addr} failed: {e}");
                Err(Error::SocketSend)
            }
        }
    }

    /// Receives one datagram without blocking. Returns `Ok(None)` on
    /// would-block — the normal "no data yet" case at the poll surface.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((n, addr)) => Ok(Some((n, addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                log::warn!("recv_from failed: {e}");
                Err(Error::SocketRecv)
            }
        }
    }

    /// Blocks up to `timeout` for the socket to become readable, using
    /// `poll(2)` the way the C original uses `poll()`/`select()` in its
    /// handshake and poll-loop waits. `timeout = 0` returns immediately.
    pub fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        use std::os::unix::io::AsRawFd;

        let fd = self.socket.as_raw_fd();
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };

        let timeout_ms: i32 = timeout.as_millis().min(i32::MAX as u128) as i32;
        let ret = unsafe { libc::poll(&mut pollfd as *mut libc::pollfd, 1, timeout_ms) };
        match ret {
            n if n < 0 => {
                let e = io::Error::last_os_error();
                log::warn!("poll() failed: {e}");
                Err(Error::IoFailed)
            }
            0 => Ok(false),
            _ => Ok(pollfd.revents & libc::POLLIN != 0),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_rejects_ipv6() {
        let addr: SocketAddr = "[::1]:0".parse().unwrap();
        assert_eq!(
            UdpTransport::bind(addr, 4096, 0.0).unwrap_err(),
            Error::AddrInvalid
        );
    }

    #[test]
    fn loopback_round_trip() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 4096, 0.0).unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 4096, 0.0).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"hello", b_addr).unwrap();
        assert!(b.wait_readable(Duration::from_millis(200)).unwrap());

        let mut buf = [0u8; 16];
        let (n, _) = b.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn recv_from_would_block_is_none() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 4096, 0.0).unwrap();
        let mut buf = [0u8; 16];
        assert!(a.recv_from(&mut buf).unwrap().is_none());
    }
}
