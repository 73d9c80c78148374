// src/config.rs
//! Agent configuration.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// ICE agent role (RFC 8445 Section 6.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceRole {
    /// Initiates nomination.
    Controlling,
    /// Selects whatever the peer nominates.
    Controlled,
}

impl IceRole {
    pub fn flipped(&self) -> Self {
        match self {
            Self::Controlling => Self::Controlled,
            Self::Controlled => Self::Controlling,
        }
    }

    pub fn is_controlling(&self) -> bool {
        matches!(self, Self::Controlling)
    }
}

impl fmt::Display for IceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Controlling => write!(f, "controlling"),
            Self::Controlled => write!(f, "controlled"),
        }
    }
}

/// Predicate deciding which local addresses become host candidates.
pub type IpFilter = Arc<dyn Fn(&IpAddr) -> bool + Send + Sync>;

/// ICE agent configuration.
#[derive(Clone)]
pub struct IceConfig {
    /// Agent role. Required; there is no sensible default between peers.
    pub role: IceRole,

    /// Resolved STUN server addresses used for server-reflexive gathering.
    pub stun_servers: Vec<SocketAddr>,

    /// Which local addresses to use for host candidates. The default
    /// accepts every non-loopback address.
    pub ip_filter: IpFilter,

    /// Explicit host addresses. When non-empty, interface discovery is
    /// skipped and these are bound directly (still subject to `ip_filter`).
    pub host_addresses: Vec<IpAddr>,

    /// Pacing interval between outbound checks (RFC 8445 Ta, default 50 ms).
    pub check_interval: Duration,

    /// Keepalive cadence on the selected pair.
    pub keepalive_interval: Duration,
}

impl IceConfig {
    pub fn new(role: IceRole) -> Self {
        Self {
            role,
            stun_servers: Vec::new(),
            ip_filter: Arc::new(|ip: &IpAddr| !ip.is_loopback()),
            host_addresses: Vec::new(),
            check_interval: Duration::from_millis(50),
            keepalive_interval: Duration::from_secs(15),
        }
    }

    /// Parse and resolve `stun:<host>:<port>` URIs. Unparseable or
    /// unresolvable entries are dropped with a warning; they are never
    /// fatal.
    pub fn with_stun_uris(mut self, uris: &[&str]) -> Self {
        for uri in uris {
            match parse_stun_uri(uri) {
                Some(addr) => self.stun_servers.push(addr),
                None => warn!("ignoring unparseable STUN URI {:?}", uri),
            }
        }
        self
    }

    pub fn with_ip_filter(mut self, filter: impl Fn(&IpAddr) -> bool + Send + Sync + 'static) -> Self {
        self.ip_filter = Arc::new(filter);
        self
    }

    pub fn with_host_addresses(mut self, addrs: Vec<IpAddr>) -> Self {
        self.host_addresses = addrs;
        self
    }
}

impl fmt::Debug for IceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceConfig")
            .field("role", &self.role)
            .field("stun_servers", &self.stun_servers)
            .field("check_interval", &self.check_interval)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}

fn parse_stun_uri(uri: &str) -> Option<SocketAddr> {
    let rest = uri.strip_prefix("stun:")?;
    let (host, port) = rest.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }

    // Literal addresses first (IPv6 literals come bracketed), then DNS.
    let literal = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port));
    }
    (host, port).to_socket_addrs().ok()?.next()
}
