//! Canonical TCP endpoint addresses.
//!
//! Every address the engine stores, compares or gossips is the canonical
//! rendering of a resolved endpoint (`tcp://ip:port`), so string equality,
//! map ordering and wire round-trips all agree on what "the same address"
//! means. Hostnames are resolved once, at the edge, and never stored.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use thiserror::Error;

/// Scheme prefix of every canonical address.
pub const TCP_SCHEME: &str = "tcp";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("unsupported scheme in '{0}': expected tcp://")]
    Scheme(String),
    #[error("'{0}' is not a valid tcp endpoint")]
    Malformed(String),
    #[error("cannot resolve '{0}'")]
    Unresolvable(String),
}

/// A resolved TCP endpoint in canonical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(SocketAddr);

impl Addr {
    /// Resolve `host:port` through the system resolver and canonicalize the
    /// first result.
    pub fn resolve(host: &str, port: u16) -> Result<Self, AddrError> {
        // Bracketed IPv6 literals come in from URL authorities.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let mut found = (host, port)
            .to_socket_addrs()
            .map_err(|_| AddrError::Unresolvable(format!("{host}:{port}")))?;
        found
            .next()
            .map(Addr)
            .ok_or_else(|| AddrError::Unresolvable(format!("{host}:{port}")))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        Addr(addr)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", TCP_SCHEME, self.0)
    }
}

impl FromStr for Addr {
    type Err = AddrError;

    /// Accepts canonical forms only: `tcp://` followed by a numeric IP and
    /// port. Anything needing resolution goes through [`Addr::resolve`].
    fn from_str(s: &str) -> Result<Self, AddrError> {
        let rest = s
            .strip_prefix(TCP_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| AddrError::Scheme(s.to_string()))?;
        rest.parse::<SocketAddr>()
            .map(Addr)
            .map_err(|_| AddrError::Malformed(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_round_trip() {
        let addr: Addr = "tcp://127.0.0.1:4567".parse().unwrap();
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:4567");
        assert_eq!(addr.port(), 4567);
    }

    #[test]
    fn ipv6_round_trip() {
        let addr: Addr = "tcp://[::1]:4567".parse().unwrap();
        assert_eq!(addr.to_string(), "tcp://[::1]:4567");
        assert_eq!(addr, addr.to_string().parse().unwrap());
    }

    #[test]
    fn rejects_wrong_scheme() {
        assert!(matches!(
            "udp://127.0.0.1:4567".parse::<Addr>(),
            Err(AddrError::Scheme(_))
        ));
    }

    #[test]
    fn rejects_missing_port() {
        assert!(matches!(
            "tcp://127.0.0.1".parse::<Addr>(),
            Err(AddrError::Malformed(_))
        ));
    }

    #[test]
    fn resolve_loopback() {
        let addr = Addr::resolve("127.0.0.1", 4567).unwrap();
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:4567");
    }

    #[test]
    fn resolve_bracketed_ipv6() {
        let addr = Addr::resolve("[::1]", 4567).unwrap();
        assert_eq!(addr.to_string(), "tcp://[::1]:4567");
    }

    #[test]
    fn resolve_unknown_host_fails() {
        assert!(Addr::resolve("no-such-host.invalid", 4567).is_err());
    }

    #[test]
    fn equality_is_canonical() {
        let a: Addr = "tcp://10.0.0.1:4567".parse().unwrap();
        let b = Addr::resolve("10.0.0.1", 4567).unwrap();
        assert_eq!(a, b);
    }
}
