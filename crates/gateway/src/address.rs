//! Network addresses and the policy deriving the gateway's own address.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A `host:port` string identifying a reachable endpoint.
///
/// Equality is exact string equality: `localhost:9981` and
/// `127.0.0.1:9981` are different addresses. IPv6 hosts are bracketed,
/// as in `[::1]:9981`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetAddress(String);

impl NetAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Join a host and port, bracketing IPv6 literals.
    pub fn from_host_port(host: &str, port: u16) -> Self {
        if host.contains(':') {
            Self(format!("[{host}]:{port}"))
        } else {
            Self(format!("{host}:{port}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part without IPv6 brackets. Empty when the address is malformed.
    pub fn host(&self) -> &str {
        split_host_port(&self.0).map_or("", |(host, _)| host)
    }

    /// Port part as written. Empty when the address is malformed.
    pub fn port(&self) -> &str {
        split_host_port(&self.0).map_or("", |(_, port)| port)
    }

    /// Numeric port, if the port part is well formed.
    pub fn port_number(&self) -> Option<u16> {
        self.port().parse().ok()
    }

    /// Require a non-empty host and a numeric port.
    pub fn validate(&self) -> Result<()> {
        let Some((host, port)) = split_host_port(&self.0) else {
            return Err(Error::Validation(format!(
                "address {:?} is not of the form host:port",
                self.0
            )));
        };
        if host.is_empty() {
            return Err(Error::Validation(format!("address {:?} has no host", self.0)));
        }
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) || port.parse::<u16>().is_err()
        {
            return Err(Error::Validation(format!(
                "address {:?} has an invalid port",
                self.0
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Parsed host IP, if the host is an IP literal.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host().parse().ok()
    }

    /// `localhost` or a loopback IP.
    pub fn is_loopback(&self) -> bool {
        is_loopback_host(self.host())
    }

    /// Whether the host is `ip`, or a name that resolves to it.
    pub async fn resolves_to(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        if let Some(own) = self.ip() {
            return own.to_canonical() == ip;
        }
        match tokio::net::lookup_host(self.as_str()).await {
            Ok(mut addrs) => addrs.any(|a| a.ip().to_canonical() == ip),
            Err(_) => false,
        }
    }
}

fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        return Some((host, port));
    }
    let (host, port) = addr.rsplit_once(':')?;
    // An unbracketed colon in the host means a bare IPv6 literal.
    if host.contains(':') {
        return None;
    }
    Some((host, port))
}

fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost") || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NetAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&NetAddress> for NetAddress {
    fn from(addr: &NetAddress) -> Self {
        addr.clone()
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

// ── Resolver ─────────────────────────────────────────────────────────────────

/// Derives the address the gateway advertises once its listener is bound.
pub trait AddressResolver: Send + Sync {
    /// `requested` is the listen address as configured; `bound` is what the
    /// listener actually got (the real port when `requested` asked for 0).
    fn resolve(&self, requested: &str, bound: SocketAddr) -> Result<NetAddress>;
}

/// Advertise the bound socket address itself.
///
/// A wildcard bound IP is replaced with the loopback address of the same
/// family so the result stays dialable.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalResolver;

impl AddressResolver for LocalResolver {
    fn resolve(&self, requested: &str, bound: SocketAddr) -> Result<NetAddress> {
        let ip = match bound.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        let resolved = NetAddress::from(SocketAddr::new(ip, bound.port()));

        let requested_host = split_host_port(requested).map_or("", |(host, _)| host);
        if is_loopback_host(requested_host) && !ip.is_loopback() {
            return Err(Error::Validation(format!(
                "listener for loopback address {requested:?} bound to non-loopback {bound}"
            )));
        }
        Ok(resolved)
    }
}

/// Advertise a fixed external host with the bound port.
#[derive(Debug, Clone)]
pub struct AnnouncedResolver {
    host: String,
}

impl AnnouncedResolver {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl AddressResolver for AnnouncedResolver {
    fn resolve(&self, _requested: &str, bound: SocketAddr) -> Result<NetAddress> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let addr = NetAddress::from_host_port(host, bound.port());
        addr.validate()?;
        Ok(addr)
    }
}
