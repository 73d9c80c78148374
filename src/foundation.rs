// src/foundation.rs
//! Candidate foundation derivation (RFC 8445 Section 5.1.1.3).
//!
//! Two candidates share a foundation when they have the same type, the same
//! base address, and were obtained from the same STUN server. The value is
//! opaque; we hash the inputs and keep 8 hex characters.

use std::net::{IpAddr, SocketAddr};

use sha2::{Digest, Sha256};

use crate::candidate::CandidateType;

/// Derive the foundation string for a candidate.
pub fn foundation(
    typ: CandidateType,
    base_ip: &IpAddr,
    stun_server: Option<&SocketAddr>,
) -> String {
    let mut hasher = Sha256::new();

    hasher.update(typ.to_str().as_bytes());
    hasher.update(b":");
    hasher.update(base_ip.to_string().as_bytes());
    hasher.update(b":udp");

    if let Some(server) = stun_server {
        hasher.update(b":");
        hasher.update(server.to_string().as_bytes());
    }

    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_foundation_stable() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100));

        let f1 = foundation(CandidateType::Host, &ip, None);
        let f2 = foundation(CandidateType::Host, &ip, None);
        assert_eq!(f1, f2);
        assert_eq!(f1.len(), 8);
    }

    #[test]
    fn test_foundation_distinguishes_type_and_server() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100));
        let server: SocketAddr = "198.51.100.1:3478".parse().unwrap();
        let other_server: SocketAddr = "198.51.100.2:3478".parse().unwrap();

        let host = foundation(CandidateType::Host, &ip, None);
        let srflx = foundation(CandidateType::ServerReflexive, &ip, Some(&server));
        let srflx2 = foundation(CandidateType::ServerReflexive, &ip, Some(&other_server));

        assert_ne!(host, srflx);
        assert_ne!(srflx, srflx2);
    }
}
