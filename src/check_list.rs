// src/check_list.rs
//! The checklist: a priority-ordered collection of candidate pairs with
//! pruning, foundation-based freezing and state queries (RFC 8445
//! Section 6.1.2).

use std::collections::HashSet;
use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::pair::{CandidatePair, PairId, PairKey, PairState};

/// Ordered collection of candidate pairs for the single data component.
#[derive(Debug, Default)]
pub struct CheckList {
    pairs: Vec<CandidatePair>,
    next_id: u64,
}

impl CheckList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next pair id. Ids are monotonically increasing for the
    /// lifetime of the agent.
    pub fn next_pair_id(&mut self) -> PairId {
        let id = PairId(self.next_id);
        self.next_id += 1;
        id
    }

    /// The initial state a new pair gets on insertion: `Frozen` when the
    /// checklist already holds a pair with the same foundation tuple,
    /// `Waiting` otherwise.
    pub fn initial_state(&self, pair: &CandidatePair) -> PairState {
        let foundations = pair.foundations();
        if self.pairs.iter().any(|p| p.foundations() == foundations) {
            PairState::Frozen
        } else {
            PairState::Waiting
        }
    }

    /// Insert a pair formed from candidate pairing, then re-sort and prune.
    /// Duplicates (by candidate-equality key) are dropped.
    pub fn insert(&mut self, pair: CandidatePair) {
        if self.find(&pair.key()).is_some() {
            trace!("dropping duplicate pair {}", pair);
            return;
        }

        debug!("inserting pair {}", pair);
        self.pairs.push(pair);
        self.sort();
        self.prune();
    }

    /// Append a valid pair discovered by a connectivity check. Valid pairs
    /// bypass pruning: they may legitimately share a base with the check
    /// pair that discovered them.
    pub fn add_valid(&mut self, pair: CandidatePair) {
        debug!("adding valid pair {}", pair);
        self.pairs.push(pair);
        self.sort();
    }

    /// Look up the unique pair matching a candidate-equality key.
    pub fn find(&self, key: &PairKey) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.key() == *key)
    }

    pub fn find_mut(&mut self, key: &PairKey) -> Option<&mut CandidatePair> {
        self.pairs.iter_mut().find(|p| p.key() == *key)
    }

    pub fn get(&self, id: PairId) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: PairId) -> Option<&mut CandidatePair> {
        self.pairs.iter_mut().find(|p| p.id == id)
    }

    /// Highest-priority pair in the given state. The list is kept sorted,
    /// so the first match wins; ties resolve by insertion id.
    pub fn highest(&self, state: PairState) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.state == state)
    }

    pub fn any(&self, state: PairState) -> bool {
        self.pairs.iter().any(|p| p.state == state)
    }

    /// The valid pair discovered by a check on `id`, or the pair itself.
    /// Used when nomination lands on a conn-check pair whose valid pair is
    /// a peer-reflexive discovery.
    pub fn valid_pair_for(&self, id: PairId) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .find(|p| p.discovered_by == Some(id))
            .or_else(|| self.get(id))
    }

    /// Move every frozen pair sharing `foundations` to waiting. Called when
    /// a pair with that foundation tuple succeeds (RFC 8445
    /// Section 7.2.5.3.3, single checklist).
    pub fn unfreeze_foundation(&mut self, foundations: &(String, String)) {
        for pair in &mut self.pairs {
            if pair.state == PairState::Frozen && pair.foundations() == *foundations {
                trace!("unfreezing pair {}", pair);
                pair.state = PairState::Waiting;
            }
        }
    }

    /// Recompute all pair priorities after a role switch and restore the
    /// ordering invariant.
    pub fn recompute_priorities(&mut self, controlling: bool) {
        for pair in &mut self.pairs {
            pair.recompute_priority(controlling);
        }
        self.sort();
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidatePair> {
        self.pairs.iter()
    }

    /// All pairs are terminal failures (non-empty list).
    pub fn all_failed(&self) -> bool {
        !self.pairs.is_empty() && self.pairs.iter().all(|p| p.state == PairState::Failed)
    }

    fn sort(&mut self) {
        self.pairs
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    }

    /// Keep only the highest-priority pair per `(local base, remote)` key
    /// (RFC 8445 Section 6.1.2.4). Valid pairs and pairs whose checks have
    /// already launched are exempt: evicting them would orphan in-flight
    /// transactions. Assumes the list is sorted by descending priority.
    fn prune(&mut self) {
        let mut seen: HashSet<(SocketAddr, (SocketAddr, SocketAddr))> = HashSet::new();
        self.pairs.retain(|pair| {
            let first = seen.insert(pair.prune_key());
            if pair.valid || matches!(pair.state, PairState::InProgress | PairState::Succeeded) {
                return true;
            }
            if !first {
                trace!("pruning redundant pair {}", pair);
            }
            first
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Candidate, SocketId};

    fn remote_host(addr: &str) -> Candidate {
        let sa: std::net::SocketAddr = addr.parse().unwrap();
        Candidate::unmarshal(&format!("rf00 1 udp 2130706431 {} {} typ host", sa.ip(), sa.port()))
            .unwrap()
    }

    fn make_pair(list: &mut CheckList, local: Candidate, remote: Candidate) -> CandidatePair {
        let id = list.next_pair_id();
        let mut pair = CandidatePair::new(id, local, remote, true, PairState::Waiting);
        pair.state = list.initial_state(&pair);
        pair
    }

    #[test]
    fn test_insert_orders_by_priority() {
        let mut list = CheckList::new();
        let host = Candidate::host("192.168.1.100:5000".parse().unwrap(), SocketId(0));
        let srflx = Candidate::server_reflexive(
            "203.0.113.1:6000".parse().unwrap(),
            "192.168.1.101:5000".parse().unwrap(),
            SocketId(1),
            "198.51.100.1:3478".parse().unwrap(),
        );
        let remote = remote_host("192.168.1.200:5000");

        let low = make_pair(&mut list, srflx, remote.clone());
        list.insert(low);
        let high = make_pair(&mut list, host, remote);
        list.insert(high);

        assert_eq!(list.len(), 2);
        let priorities: Vec<u64> = list.iter().map(|p| p.priority).collect();
        assert!(priorities[0] >= priorities[1]);
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut list = CheckList::new();
        let host = Candidate::host("192.168.1.100:5000".parse().unwrap(), SocketId(0));
        let remote = remote_host("192.168.1.200:5000");

        let a = make_pair(&mut list, host.clone(), remote.clone());
        list.insert(a);
        let b = make_pair(&mut list, host, remote);
        list.insert(b);

        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_prune_same_base_keeps_highest() {
        let mut list = CheckList::new();
        let base: std::net::SocketAddr = "192.168.1.100:5000".parse().unwrap();
        let host = Candidate::host(base, SocketId(0));
        // An srflx candidate on the same socket: checks from it are
        // indistinguishable from the host pair's.
        let srflx = Candidate::server_reflexive(
            "203.0.113.1:6000".parse().unwrap(),
            base,
            SocketId(0),
            "198.51.100.1:3478".parse().unwrap(),
        );
        let remote = remote_host("192.168.1.200:5000");

        let host_pair = make_pair(&mut list, host, remote.clone());
        list.insert(host_pair);
        let srflx_pair = make_pair(&mut list, srflx, remote);
        list.insert(srflx_pair);

        // Same (base, remote) key: only the host pair (higher priority)
        // survives.
        assert_eq!(list.len(), 1);
        assert_eq!(
            list.iter().next().unwrap().local.candidate_type,
            crate::candidate::CandidateType::Host
        );
    }

    #[test]
    fn test_initial_state_foundation_freezing() {
        let mut list = CheckList::new();
        let host = Candidate::host("192.168.1.100:5000".parse().unwrap(), SocketId(0));
        let remote_a = remote_host("192.168.1.200:5000");
        let remote_b = {
            // Same remote foundation, different port.
            let mut c = remote_host("192.168.1.200:5001");
            c.foundation = remote_a.foundation.clone();
            c
        };

        let first = make_pair(&mut list, host.clone(), remote_a);
        assert_eq!(first.state, PairState::Waiting);
        list.insert(first);

        let second = make_pair(&mut list, host, remote_b);
        assert_eq!(second.state, PairState::Frozen);
        list.insert(second);

        // Invariant: a frozen pair shares its foundation tuple with some
        // other pair in the list.
        for pair in list.iter() {
            if pair.state == PairState::Frozen {
                assert!(list
                    .iter()
                    .any(|p| p.id != pair.id && p.foundations() == pair.foundations()));
            }
        }
    }

    #[test]
    fn test_unfreeze_foundation() {
        let mut list = CheckList::new();
        let host = Candidate::host("192.168.1.100:5000".parse().unwrap(), SocketId(0));
        let remote_a = remote_host("192.168.1.200:5000");
        let mut remote_b = remote_host("192.168.1.200:5001");
        remote_b.foundation = remote_a.foundation.clone();

        let first = make_pair(&mut list, host.clone(), remote_a);
        let foundations = first.foundations();
        list.insert(first);
        let second = make_pair(&mut list, host, remote_b);
        list.insert(second);

        assert!(list.any(PairState::Frozen));
        list.unfreeze_foundation(&foundations);
        assert!(!list.any(PairState::Frozen));
    }

    #[test]
    fn test_highest_waiting() {
        let mut list = CheckList::new();
        let host = Candidate::host("192.168.1.100:5000".parse().unwrap(), SocketId(0));
        let srflx = Candidate::server_reflexive(
            "203.0.113.1:6000".parse().unwrap(),
            "192.168.1.101:5000".parse().unwrap(),
            SocketId(1),
            "198.51.100.1:3478".parse().unwrap(),
        );
        let remote = remote_host("192.168.1.200:5000");

        let a = make_pair(&mut list, srflx, remote.clone());
        list.insert(a);
        let b = make_pair(&mut list, host, remote);
        list.insert(b);

        let top = list.highest(PairState::Waiting).unwrap();
        assert_eq!(top.local.candidate_type, crate::candidate::CandidateType::Host);
        assert!(list.highest(PairState::Succeeded).is_none());
    }

    #[test]
    fn test_valid_pair_back_reference() {
        let mut list = CheckList::new();
        let host = Candidate::host("192.168.1.100:5000".parse().unwrap(), SocketId(0));
        let remote = remote_host("192.168.1.200:5000");

        let check_pair = make_pair(&mut list, host.clone(), remote.clone());
        let check_id = check_pair.id;
        list.insert(check_pair);

        let prflx = Candidate::peer_reflexive_local(
            "203.0.113.9:7000".parse().unwrap(),
            "192.168.1.100:5000".parse().unwrap(),
            SocketId(0),
        );
        let valid_id = list.next_pair_id();
        let mut valid = CandidatePair::new(valid_id, prflx, remote, true, PairState::Succeeded);
        valid.valid = true;
        valid.discovered_by = Some(check_id);
        list.add_valid(valid);

        assert_eq!(list.valid_pair_for(check_id).unwrap().id, valid_id);
        // A pair without a discovery points at itself.
        assert_eq!(list.valid_pair_for(valid_id).unwrap().id, valid_id);
    }
}
