use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

/// The address namespace a [`crate::Connection`] was constructed for.
///
/// Chosen at construction time and immutable thereafter: every socket the
/// `Connection` later opens (TCP, UDP, or local-domain) is created in this
/// family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4.
    Inet,
    /// IPv6.
    Inet6,
    /// POSIX local-domain ("UNIX domain") stream sockets. Not available on
    /// Windows.
    #[cfg(unix)]
    Unix,
}

impl AddressFamily {
    /// Parse `addr` as a numeric address in this family's representation.
    ///
    /// IPv4 addresses are dotted-quad, IPv6 addresses are RFC 5952. Name
    /// resolution is explicitly out of scope: a hostname is rejected with
    /// `InvalidArgument`, never resolved.
    pub fn parse_numeric(self, addr: &str) -> Result<IpAddr> {
        match self {
            AddressFamily::Inet => addr
                .parse::<Ipv4Addr>()
                .map(IpAddr::V4)
                .map_err(|_| Error::invalid_argument("not a numeric IPv4 address")),
            AddressFamily::Inet6 => addr
                .parse::<Ipv6Addr>()
                .map(IpAddr::V6)
                .map_err(|_| Error::invalid_argument("not a numeric IPv6 address")),
            #[cfg(unix)]
            AddressFamily::Unix => Err(Error::invalid_argument(
                "numeric host addresses do not apply to the local-domain family",
            )),
        }
    }

    /// The wildcard bind address for this family (`0.0.0.0` / `::`).
    pub fn wildcard(self) -> IpAddr {
        match self {
            AddressFamily::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            #[cfg(unix)]
            AddressFamily::Unix => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// The numeric (address string, port) pair captured for a TCP peer or the
/// most recent UDP sender.
///
/// Formatted according to the owning `Connection`'s address family, never
/// hard-coded to IPv4 (the original C implementation's `inet_ntop` call
/// passed `AF_INET` even for IPv6 sockets on some paths); this type's
/// constructor takes the real `SocketAddr` and never guesses the family.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerInfo {
    addr: String,
    port: u16,
}

impl PeerInfo {
    /// An empty peer info, as held before a connection is established.
    pub fn empty() -> PeerInfo {
        PeerInfo::default()
    }

    /// Capture the numeric address and port from a resolved socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> PeerInfo {
        PeerInfo {
            addr: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    /// The numeric address, formatted per RFC 5952 for IPv6.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_v4() {
        let ip = AddressFamily::Inet.parse_numeric("127.0.0.1").unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn rejects_hostname() {
        assert!(AddressFamily::Inet.parse_numeric("localhost").is_err());
    }

    #[test]
    fn rejects_v4_in_v6_family() {
        assert!(AddressFamily::Inet6.parse_numeric("127.0.0.1").is_err());
    }

    #[test]
    fn peer_info_formats_v6_by_family() {
        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        let info = PeerInfo::from_socket_addr(addr);
        assert_eq!(info.addr(), "::1");
        assert_eq!(info.port(), 9000);
    }
}
