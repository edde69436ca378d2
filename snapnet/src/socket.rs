//! Non-blocking UDP socket wrapper with statistics tracking.
use std::io::ErrorKind;
use std::net::UdpSocket as StdUdpSocket;

use crate::address::{resolve_hostname, NetAddress};
use crate::packet::PACKET_MTU;
use crate::stats::SocketStats;

/// Errors that can occur during socket operations.
#[derive(Debug)]
pub enum SocketError {
    Io(std::io::Error),
    BindFailed { port: u16, attempts: u16 },
    InvalidAddress,
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketError::Io(e) => write!(f, "IO error: {}", e),
            SocketError::BindFailed { port, attempts } => {
                write!(f, "No bindable port in {}..{}", port, port + attempts)
            }
            SocketError::InvalidAddress => write!(f, "Invalid address"),
        }
    }
}

impl std::error::Error for SocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SocketError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SocketError {
    fn from(err: std::io::Error) -> Self {
        SocketError::Io(err)
    }
}

/// Non-blocking UDP socket bound to a local [`NetAddress`].
///
/// Receive never blocks: an empty wire surfaces as `None` and the caller
/// retries next tick.
pub struct UdpSocket {
    socket: StdUdpSocket,
    address: NetAddress,
    recv_buffer: Box<[u8; PACKET_MTU]>,
    stats: SocketStats,
}

impl UdpSocket {
    /// Binds to the first local address on `port`, walking up through
    /// `port + attempt_range` until one binds.
    pub fn bind(port: u16, attempt_range: u16) -> Result<Self, SocketError> {
        let mut attempt_port = port;
        let mut attempts_left = attempt_range.max(1);

        while attempts_left > 0 {
            let candidates = resolve_hostname("", attempt_port, true)
                .map_err(|_| SocketError::InvalidAddress)?;
            let bind_addr = candidates[0];

            match StdUdpSocket::bind(bind_addr.to_socket_addr()) {
                Ok(socket) => {
                    socket.set_nonblocking(true)?;
                    let local = socket
                        .local_addr()
                        .ok()
                        .and_then(NetAddress::from_socket_addr)
                        .ok_or(SocketError::InvalidAddress)?;
                    return Ok(Self {
                        socket,
                        address: local,
                        recv_buffer: Box::new([0u8; PACKET_MTU]),
                        stats: SocketStats::default(),
                    });
                }
                Err(_) => {
                    attempts_left -= 1;
                    attempt_port = attempt_port.wrapping_add(1);
                }
            }
        }

        Err(SocketError::BindFailed {
            port,
            attempts: attempt_range,
        })
    }

    /// The local address this socket is bound to.
    pub fn address(&self) -> NetAddress {
        self.address
    }

    /// Sends a datagram, returning the byte count actually submitted.
    pub fn send_to(&mut self, data: &[u8], addr: NetAddress) -> Result<usize, SocketError> {
        let sent = self.socket.send_to(data, addr.to_socket_addr())?;
        self.stats.bytes_sent += sent as u64;
        self.stats.packets_sent += 1;
        Ok(sent)
    }

    /// Receives one datagram if any is pending. Would-block is not an error.
    pub fn recv_from(&mut self) -> Result<Option<(&[u8], NetAddress)>, SocketError> {
        match self.socket.recv_from(&mut self.recv_buffer[..]) {
            Ok((len, from)) => {
                let Some(from) = NetAddress::from_socket_addr(from) else {
                    return Ok(None);
                };
                self.stats.bytes_received += len as u64;
                self.stats.packets_received += 1;
                Ok(Some((&self.recv_buffer[..len], from)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn stats(&self) -> &SocketStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral() {
        let socket = UdpSocket::bind(0, 1).unwrap();
        assert_ne!(socket.address().port, 0);
    }

    #[test]
    fn test_recv_would_block_is_none() {
        let mut socket = UdpSocket::bind(0, 1).unwrap();
        assert!(socket.recv_from().unwrap().is_none());
    }

    #[test]
    fn test_send_and_receive_datagram() {
        let mut a = UdpSocket::bind(0, 1).unwrap();
        let mut b = UdpSocket::bind(0, 1).unwrap();
        let b_addr = NetAddress::new(0x7F000001, b.address().port);

        a.send_to(b"snapnet", b_addr).unwrap();

        let mut received = None;
        for _ in 0..50 {
            if let Some((data, _from)) = b.recv_from().unwrap() {
                received = Some(data.to_vec());
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(received.as_deref(), Some(&b"snapnet"[..]));
        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(b.stats().packets_received, 1);
    }

    #[test]
    fn test_bind_range_walks_forward() {
        let first = UdpSocket::bind(0, 1).unwrap();
        let taken = first.address().port;
        // Binding the taken port with a range should land on a later port.
        let second = UdpSocket::bind(taken, 32).unwrap();
        assert_ne!(second.address().port, taken);
    }
}
