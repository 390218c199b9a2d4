//! Endpoint addressing.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// An (address, port) pair observed on a socket.
///
/// IPv4-mapped IPv6 addresses are canonicalized to plain IPv4 so a peer
/// on a dual-stack listener renders the same string as the peer that
/// connected over IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self(SocketAddr::new(addr.ip().to_canonical(), addr.port()))
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for Endpoint {
    /// `1.2.3.4:5` for IPv4 and `[::1]:5` for IPv6.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_ipv4_is_canonicalized() {
        let mapped: SocketAddr = "[::ffff:127.0.0.1]:4000".parse().unwrap();
        let plain: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(Endpoint::new(mapped), Endpoint::new(plain));
        assert_eq!(Endpoint::new(mapped).to_string(), "127.0.0.1:4000");
    }

    #[test]
    fn ipv6_renders_with_brackets() {
        let addr: SocketAddr = "[::1]:50000".parse().unwrap();
        assert_eq!(Endpoint::from(addr).to_string(), "[::1]:50000");
    }
}
