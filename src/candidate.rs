// src/candidate.rs
//! ICE candidate representation and SDP attribute parsing (RFC 8445, RFC 8839).

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::IceError;
use crate::foundation;
use crate::priority::{self, COMPONENT_ID, DEFAULT_LOCAL_PREFERENCE};

/// ICE candidate type (RFC 8445 Section 5.1.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CandidateType {
    /// Host candidate (local interface address)
    Host,
    /// Server reflexive (discovered via STUN)
    ServerReflexive,
    /// Peer reflexive (discovered during connectivity checks)
    PeerReflexive,
    /// Relayed candidate (from TURN)
    Relay,
}

impl CandidateType {
    /// String form used in SDP.
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }

    /// Type preference (RFC 8445 Section 5.1.2.2).
    pub fn preference(&self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay => 0,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(Self::Host),
            "srflx" => Some(Self::ServerReflexive),
            "prflx" => Some(Self::PeerReflexive),
            "relay" => Some(Self::Relay),
            _ => None,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

/// Handle to a sending transport owned by the agent. Host candidates own a
/// socket; srflx/prflx candidates carry the underlying host's handle so
/// sends reuse the NAT binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub usize);

/// An ICE candidate. Immutable once created.
///
/// Two candidates compare equal when their transport address *and* base
/// address agree; type, foundation and priority do not participate in
/// equality (a prflx re-discovery of a known address is the same candidate).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub candidate_type: CandidateType,
    /// Observed transport address.
    pub addr: SocketAddr,
    /// The local address the agent actually sends from. Equals `addr` for
    /// host candidates; the underlying host address for srflx/prflx.
    pub base: SocketAddr,
    pub foundation: String,
    pub priority: u32,
    /// Sending transport; `None` for candidates learned from the peer.
    pub socket: Option<SocketId>,
}

impl Candidate {
    /// Create a host candidate for a bound local address.
    pub fn host(addr: SocketAddr, socket: SocketId) -> Self {
        Self {
            candidate_type: CandidateType::Host,
            addr,
            base: addr,
            foundation: foundation::foundation(CandidateType::Host, &addr.ip(), None),
            priority: priority::candidate_priority(
                CandidateType::Host,
                DEFAULT_LOCAL_PREFERENCE,
                COMPONENT_ID,
            ),
            socket: Some(socket),
        }
    }

    /// Create a server-reflexive candidate discovered through `stun_server`,
    /// sharing the host candidate's socket.
    pub fn server_reflexive(
        addr: SocketAddr,
        base: SocketAddr,
        socket: SocketId,
        stun_server: SocketAddr,
    ) -> Self {
        Self {
            candidate_type: CandidateType::ServerReflexive,
            addr,
            base,
            foundation: foundation::foundation(
                CandidateType::ServerReflexive,
                &base.ip(),
                Some(&stun_server),
            ),
            priority: priority::candidate_priority(
                CandidateType::ServerReflexive,
                DEFAULT_LOCAL_PREFERENCE,
                COMPONENT_ID,
            ),
            socket: Some(socket),
        }
    }

    /// Create a local peer-reflexive candidate discovered from the
    /// XOR-MAPPED-ADDRESS of a connectivity-check response.
    pub fn peer_reflexive_local(addr: SocketAddr, base: SocketAddr, socket: SocketId) -> Self {
        Self {
            candidate_type: CandidateType::PeerReflexive,
            addr,
            base,
            foundation: foundation::foundation(CandidateType::PeerReflexive, &base.ip(), None),
            priority: priority::candidate_priority(
                CandidateType::PeerReflexive,
                DEFAULT_LOCAL_PREFERENCE,
                COMPONENT_ID,
            ),
            socket: Some(socket),
        }
    }

    /// Create a remote peer-reflexive candidate from the source address of an
    /// unexpected binding request. The priority comes from the request's
    /// PRIORITY attribute.
    pub fn peer_reflexive_remote(addr: SocketAddr, priority: u32) -> Self {
        Self {
            candidate_type: CandidateType::PeerReflexive,
            addr,
            base: addr,
            foundation: foundation::foundation(CandidateType::PeerReflexive, &addr.ip(), None),
            priority,
            socket: None,
        }
    }

    /// Address family.
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Equality / pruning key: `(addr, base)`.
    pub fn key(&self) -> (SocketAddr, SocketAddr) {
        (self.addr, self.base)
    }

    /// Serialise to the SDP `candidate` attribute value (RFC 8839):
    /// `foundation component transport priority address port typ <type>
    /// [raddr addr rport port]`.
    pub fn marshal(&self) -> String {
        let mut out = format!(
            "{} {} udp {} {} {} typ {}",
            self.foundation,
            COMPONENT_ID,
            self.priority,
            self.addr.ip(),
            self.addr.port(),
            self.candidate_type,
        );

        if self.candidate_type != CandidateType::Host && self.base != self.addr {
            out.push_str(&format!(" raddr {} rport {}", self.base.ip(), self.base.port()));
        }

        out
    }

    /// Parse a candidate from its SDP attribute value. Candidates produced
    /// this way represent the remote peer: they carry no socket handle and
    /// their base defaults to the transport address when `raddr`/`rport` are
    /// absent.
    pub fn unmarshal(s: &str) -> Result<Self, IceError> {
        let s = s.trim();
        let s = s.strip_prefix("candidate:").unwrap_or(s);
        let tokens: Vec<&str> = s.split_whitespace().collect();

        if tokens.len() < 8 {
            return Err(IceError::InvalidCandidate(format!(
                "expected at least 8 fields, got {}",
                tokens.len()
            )));
        }

        let foundation = tokens[0].to_string();
        let _component: u32 = tokens[1]
            .parse()
            .map_err(|_| IceError::InvalidCandidate("bad component id".into()))?;

        if !tokens[2].eq_ignore_ascii_case("udp") {
            return Err(IceError::InvalidCandidate(format!(
                "unsupported transport {:?}",
                tokens[2]
            )));
        }

        let priority: u32 = tokens[3]
            .parse()
            .map_err(|_| IceError::InvalidCandidate("bad priority".into()))?;
        let ip: IpAddr = tokens[4]
            .parse()
            .map_err(|_| IceError::InvalidCandidate("bad address".into()))?;
        let port: u16 = tokens[5]
            .parse()
            .map_err(|_| IceError::InvalidCandidate("bad port".into()))?;

        if tokens[6] != "typ" {
            return Err(IceError::InvalidCandidate("missing typ field".into()));
        }
        let candidate_type = CandidateType::parse(tokens[7])
            .ok_or_else(|| IceError::InvalidCandidate(format!("unknown type {:?}", tokens[7])))?;

        let addr = SocketAddr::new(ip, port);
        let mut base = addr;

        // Optional raddr/rport trailer.
        let mut rest = tokens[8..].iter();
        let mut raddr: Option<IpAddr> = None;
        let mut rport: Option<u16> = None;
        while let Some(token) = rest.next() {
            match *token {
                "raddr" => {
                    let value = rest
                        .next()
                        .ok_or_else(|| IceError::InvalidCandidate("raddr without value".into()))?;
                    raddr = Some(
                        value
                            .parse()
                            .map_err(|_| IceError::InvalidCandidate("bad raddr".into()))?,
                    );
                }
                "rport" => {
                    let value = rest
                        .next()
                        .ok_or_else(|| IceError::InvalidCandidate("rport without value".into()))?;
                    rport = Some(
                        value
                            .parse()
                            .map_err(|_| IceError::InvalidCandidate("bad rport".into()))?,
                    );
                }
                // Unknown extension attributes are skipped pairwise.
                _ => {
                    rest.next();
                }
            }
        }
        if let (Some(ip), Some(port)) = (raddr, rport) {
            base = SocketAddr::new(ip, port);
        }

        Ok(Self {
            candidate_type,
            addr,
            base,
            foundation,
            priority,
            socket: None,
        })
    }
}

impl FromStr for Candidate {
    type Err = IceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::unmarshal(s)
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Candidate {}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} prio {}", self.candidate_type, self.addr, self.priority)?;
        if self.base != self.addr {
            write!(f, " base {}", self.base)?;
        }
        Ok(())
    }
}
