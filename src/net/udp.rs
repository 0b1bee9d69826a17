//! The sending UDP socket.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use crate::error::Result;

/// One pre-opened IPv4 UDP socket used for every outgoing datagram.
///
/// Bound to an ephemeral local port; the send thread is its only user, so
/// no locking is needed.
pub struct UdpSender {
    socket: UdpSocket,
}

impl UdpSender {
    /// Open and bind the socket.
    pub fn new() -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        Ok(Self { socket })
    }

    /// Send one datagram to `target`. Blocks until the kernel accepts it.
    #[inline]
    pub fn send(&self, payload: &[u8], target: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, target)?)
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_to_localhost() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = receiver.local_addr().unwrap();

        let sender = UdpSender::new().unwrap();
        let sent = sender.send(b"seven ts", target).unwrap();
        assert_eq!(sent, 8);

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"seven ts");
    }
}
