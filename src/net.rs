//! Address families and destination resolution.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use tracing::debug;

/// One of the two address families a socket can belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// Address family preference for name resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    V4Only,
    V6Only,
    #[default]
    Any,
}

impl std::str::FromStr for AddressFamily {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "4" | "v4" | "ipv4" => Ok(Self::V4Only),
            "6" | "v6" | "ipv6" => Ok(Self::V6Only),
            "any" | "both" | "dual" => Ok(Self::Any),
            _ => Err(()),
        }
    }
}

impl AddressFamily {
    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Self::V4Only => addr.is_ipv4(),
            Self::V6Only => addr.is_ipv6(),
            Self::Any => true,
        }
    }
}

/// A resolved endpoint and the name it was resolved from.
///
/// The canonical name is what a TLS peer certificate is checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub addr: SocketAddr,
    pub canonical_name: String,
}

impl Destination {
    pub fn new(addr: SocketAddr, canonical_name: impl Into<String>) -> Self {
        Self {
            addr,
            canonical_name: canonical_name.into(),
        }
    }

    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    /// Same destination on another port
    pub fn with_port(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.addr.ip(), port)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.canonical_name, self.addr)
    }
}

/// Resolve `host` with the system resolver.
///
/// Every returned destination keeps `host` as its canonical name.
pub fn resolve_destination(
    host: &str,
    port: u16,
    family: AddressFamily,
) -> io::Result<Vec<Destination>> {
    // Zone ids are not understood by ToSocketAddrs
    let lookup = host.split('%').next().unwrap_or(host);

    let addrs: Vec<SocketAddr> = if let Ok(ip) = lookup.parse::<IpAddr>() {
        vec![SocketAddr::new(ip, port)]
    } else {
        (lookup, port).to_socket_addrs()?.collect()
    };

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        ));
    }

    let destinations: Vec<Destination> = addrs
        .into_iter()
        .filter(|a| family.accepts(a))
        .map(|addr| Destination::new(addr, lookup))
        .collect();

    if destinations.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("No matching addresses found for host: {}", host),
        ));
    }

    debug!("Resolved {} to {} address(es)", host, destinations.len());
    Ok(destinations)
}

/// Convert IPv4-mapped IPv6 to IPv4 if applicable
pub fn normalize_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        _ => addr,
    }
}
