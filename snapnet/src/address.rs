//! IPv4 endpoint addressing and hostname resolution.
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

/// Errors produced while parsing or resolving addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    MalformedAddress(String),
    InvalidPort(String),
    ResolutionFailed(String),
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::MalformedAddress(s) => write!(f, "Malformed address: {}", s),
            AddressError::InvalidPort(s) => write!(f, "Invalid port: {}", s),
            AddressError::ResolutionFailed(s) => write!(f, "Could not resolve: {}", s),
        }
    }
}

impl std::error::Error for AddressError {}

/// An IPv4 endpoint: host address in host byte order plus port.
///
/// Equality is pair-equality over both fields. The string form is
/// `a.b.c.d:p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetAddress {
    pub ip: u32,
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    /// Parses an `a.b.c.d:p` string by splitting on `:`.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MalformedAddress(s.to_string()))?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressError::InvalidPort(port_str.to_string()))?;
        if port == 0 {
            return Err(AddressError::InvalidPort(port_str.to_string()));
        }

        let addresses = resolve_hostname(host, port, false)?;
        addresses
            .first()
            .copied()
            .ok_or_else(|| AddressError::ResolutionFailed(s.to_string()))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Self {
                ip: u32::from(*v4.ip()),
                port: v4.port(),
            }),
            SocketAddr::V6(_) => None,
        }
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port))
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", Ipv4Addr::from(self.ip), self.port)
    }
}

/// Resolves a hostname to the IPv4 endpoints it names.
///
/// An empty hostname with `bindable` set means "any local address"; callers
/// pick the first returned entry.
pub fn resolve_hostname(
    hostname: &str,
    port: u16,
    bindable: bool,
) -> Result<Vec<NetAddress>, AddressError> {
    if hostname.is_empty() {
        if bindable {
            return Ok(vec![NetAddress::new(u32::from(Ipv4Addr::UNSPECIFIED), port)]);
        }
        return Err(AddressError::ResolutionFailed(String::from(
            "empty hostname is only valid for binding",
        )));
    }

    // Fast path for dotted-quad literals so tests never touch a resolver.
    if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
        return Ok(vec![NetAddress::new(u32::from(ip), port)]);
    }

    let resolved = (hostname, port)
        .to_socket_addrs()
        .map_err(|e| AddressError::ResolutionFailed(format!("{}: {}", hostname, e)))?;

    let addresses: Vec<NetAddress> = resolved
        .filter(|a| matches!(a.ip(), IpAddr::V4(_)))
        .filter_map(NetAddress::from_socket_addr)
        .collect();

    if addresses.is_empty() {
        Err(AddressError::ResolutionFailed(hostname.to_string()))
    } else {
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotted_quad() {
        let addr = NetAddress::parse("127.0.0.1:1919").unwrap();
        assert_eq!(addr.ip, 0x7F000001);
        assert_eq!(addr.port, 1919);
        assert_eq!(addr.to_string(), "127.0.0.1:1919");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(NetAddress::parse("127.0.0.1").is_err());
        assert!(NetAddress::parse("127.0.0.1:notaport").is_err());
        assert!(NetAddress::parse("127.0.0.1:0").is_err());
    }

    #[test]
    fn test_equality_is_pair_equality() {
        let a = NetAddress::new(0x7F000001, 1919);
        let b = NetAddress::new(0x7F000001, 1919);
        let c = NetAddress::new(0x7F000001, 1920);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_socket_addr_round_trip() {
        let addr = NetAddress::new(0xC0A80001, 7777);
        let sock = addr.to_socket_addr();
        assert_eq!(NetAddress::from_socket_addr(sock), Some(addr));
    }

    #[test]
    fn test_bindable_empty_hostname_means_any() {
        let addrs = resolve_hostname("", 1919, true).unwrap();
        assert_eq!(addrs[0], NetAddress::new(0, 1919));
        assert!(resolve_hostname("", 1919, false).is_err());
    }
}
