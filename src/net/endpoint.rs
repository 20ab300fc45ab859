//! Endpoint addressing and IP mode handling.
//!
//! # Responsibilities
//! - Pair a socket address with the IP mode it must be used under
//! - Translate addresses for dual-stack sockets (IPv4-mapped IPv6)
//! - Validate that an address matches the address family of a mode

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// Address family a socket operates under.
///
/// Fixed for the lifetime of the listener or connection that uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IpMode {
    /// IPv4 only.
    #[default]
    IPv4,
    /// IPv6 only (dual-stack off).
    IPv6,
    /// IPv6 socket that also carries IPv4 traffic as IPv4-mapped addresses.
    Dual,
}

impl IpMode {
    /// The wildcard address for this mode.
    pub fn unspecified(self, port: u16) -> SocketAddr {
        match self {
            IpMode::IPv4 => SocketAddr::from(([0, 0, 0, 0], port)),
            IpMode::IPv6 | IpMode::Dual => SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        }
    }

    /// Whether `addr` can be used on a socket of this mode.
    pub fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            IpMode::IPv4 => addr.is_ipv4(),
            IpMode::IPv6 => addr.is_ipv6(),
            IpMode::Dual => true,
        }
    }

    /// Rewrite `addr` into the form the socket of this mode expects.
    ///
    /// Only dual mode rewrites: IPv4 addresses become IPv4-mapped IPv6
    /// addresses, and the IPv4 wildcard becomes the IPv6 wildcard.
    pub fn normalize(self, addr: SocketAddr) -> SocketAddr {
        match (self, addr) {
            (IpMode::Dual, SocketAddr::V4(v4)) => {
                let ip = if v4.ip().is_unspecified() {
                    Ipv6Addr::UNSPECIFIED
                } else {
                    v4.ip().to_ipv6_mapped()
                };
                SocketAddr::V6(SocketAddrV6::new(ip, v4.port(), 0, 0))
            }
            _ => addr,
        }
    }
}

impl fmt::Display for IpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpMode::IPv4 => write!(f, "ipv4"),
            IpMode::IPv6 => write!(f, "ipv6"),
            IpMode::Dual => write!(f, "dual"),
        }
    }
}

/// An immutable (address, IP mode) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionEndpoint {
    addr: SocketAddr,
    ip_mode: IpMode,
}

impl ConnectionEndpoint {
    pub fn new(addr: SocketAddr, ip_mode: IpMode) -> Self {
        Self { addr, ip_mode }
    }

    /// Endpoint whose IP mode is inferred from the address family.
    pub fn from_addr(addr: SocketAddr) -> Self {
        let ip_mode = match addr.ip() {
            IpAddr::V4(_) => IpMode::IPv4,
            IpAddr::V6(_) => IpMode::IPv6,
        };
        Self { addr, ip_mode }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip_mode(&self) -> IpMode {
        self.ip_mode
    }

    /// The address in the form a socket of this endpoint's mode expects.
    pub fn socket_addr(&self) -> SocketAddr {
        self.ip_mode.normalize(self.addr)
    }
}

impl fmt::Display for ConnectionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, self.ip_mode)
    }
}

impl From<SocketAddr> for ConnectionEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::from_addr(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_mode_maps_ipv4() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mapped = IpMode::Dual.normalize(addr);
        assert_eq!(mapped, "[::ffff:127.0.0.1]:4000".parse::<SocketAddr>().unwrap());
        assert_eq!(IpMode::IPv4.normalize(addr), addr);
    }

    #[test]
    fn dual_mode_maps_wildcard_to_ipv6_wildcard() {
        let addr: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(IpMode::Dual.normalize(addr), IpMode::Dual.unspecified(4000));
    }

    #[test]
    fn family_checks() {
        let v4: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let v6: SocketAddr = "[::1]:1".parse().unwrap();
        assert!(IpMode::IPv4.accepts(&v4));
        assert!(!IpMode::IPv4.accepts(&v6));
        assert!(!IpMode::IPv6.accepts(&v4));
        assert!(IpMode::Dual.accepts(&v4) && IpMode::Dual.accepts(&v6));
    }

    #[test]
    fn ip_mode_from_toml_string() {
        #[derive(Deserialize)]
        struct Holder {
            mode: IpMode,
        }
        let holder: Holder = toml::from_str("mode = \"dual\"").unwrap();
        assert_eq!(holder.mode, IpMode::Dual);
    }
}
