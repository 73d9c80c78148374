// src/priority.rs
//! ICE priority formulas (RFC 8445 Sections 5.1.2 and 6.1.2.3).

use crate::candidate::CandidateType;

/// Local preference for the single-homed default case (RFC 8445
/// recommends 65535 when there is only one interface per address family).
pub const DEFAULT_LOCAL_PREFERENCE: u32 = 65535;

/// Component ID of the data component. The agent negotiates a single
/// component.
pub const COMPONENT_ID: u32 = 1;

/// Candidate priority:
/// `(2^24)*type_pref + (2^8)*local_pref + (256 - component_id)`.
pub fn candidate_priority(typ: CandidateType, local_preference: u32, component_id: u32) -> u32 {
    let type_preference = typ.preference();
    let local_pref = local_preference.min(65535);
    let component = component_id.clamp(1, 256);

    (type_preference << 24) + (local_pref << 8) + (256 - component)
}

/// Pair priority: `2^32*MIN(G,D) + 2*MAX(G,D) + (G>D ? 1 : 0)` where G is
/// the controlling agent's candidate priority and D the controlled one's.
/// Both sides compute the same value for the same underlying pair.
pub fn pair_priority(controlling: bool, local_priority: u32, remote_priority: u32) -> u64 {
    let (g, d) = if controlling {
        (local_priority as u64, remote_priority as u64)
    } else {
        (remote_priority as u64, local_priority as u64)
    };

    (1u64 << 32) * g.min(d) + 2 * g.max(d) + if g > d { 1 } else { 0 }
}
