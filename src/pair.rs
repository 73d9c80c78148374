// src/pair.rs
//! Candidate pairs and their check state (RFC 8445 Section 6.1.2).

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::candidate::Candidate;
use crate::priority::pair_priority;

/// Stable identifier of a pair within its checklist. Back-references between
/// pairs hold ids, never pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairId(pub u64);

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pair check state (RFC 8445 Section 6.1.2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairState {
    /// Another pair with the same foundation tuple is ahead of this one.
    Frozen,
    /// Ready for a connectivity check.
    Waiting,
    /// A check is in flight.
    InProgress,
    /// A check produced a valid symmetric response.
    Succeeded,
    /// Checks exhausted or response invalid.
    Failed,
}

/// Equality key for pairs: local and remote candidate keys. Used both for
/// checklist deduplication and for matching inbound traffic to pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub local: (SocketAddr, SocketAddr),
    pub remote: (SocketAddr, SocketAddr),
}

/// A local/remote candidate pairing with shared check state.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub id: PairId,
    pub local: Candidate,
    pub remote: Candidate,
    pub state: PairState,
    /// Role-dependent pair priority; recomputed if the agent switches role.
    pub priority: u64,
    /// A check on this pair produced a valid response.
    pub valid: bool,
    /// The agent intends to nominate this pair: its next check carries
    /// USE-CANDIDATE (controlling), or nomination fires when its own check
    /// succeeds (controlled).
    pub nominate: bool,
    /// Nomination has completed on this pair.
    pub nominated: bool,
    /// For valid pairs created by peer-reflexive discovery: the conn-check
    /// pair whose check discovered this one.
    pub discovered_by: Option<PairId>,
}

impl CandidatePair {
    pub fn new(
        id: PairId,
        local: Candidate,
        remote: Candidate,
        controlling: bool,
        state: PairState,
    ) -> Self {
        let priority = pair_priority(controlling, local.priority, remote.priority);
        Self {
            id,
            local,
            remote,
            state,
            priority,
            valid: false,
            nominate: false,
            nominated: false,
            discovered_by: None,
        }
    }

    /// Equality / lookup key.
    pub fn key(&self) -> PairKey {
        PairKey {
            local: self.local.key(),
            remote: self.remote.key(),
        }
    }

    /// Pruning key: pairs whose checks would be indistinguishable on the
    /// wire share `(local base, remote)` (RFC 8445 Section 6.1.2.4).
    pub fn prune_key(&self) -> (SocketAddr, (SocketAddr, SocketAddr)) {
        (self.local.base, self.remote.key())
    }

    /// The foundation tuple used for freezing decisions.
    pub fn foundations(&self) -> (String, String) {
        (self.local.foundation.clone(), self.remote.foundation.clone())
    }

    /// Recompute the role-dependent priority after a role switch.
    pub fn recompute_priority(&mut self, controlling: bool) {
        self.priority = pair_priority(controlling, self.local.priority, self.remote.priority);
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, PairState::Failed)
    }
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} [{:?}] prio {}",
            self.id, self.local, self.remote, self.state, self.priority
        )
    }
}
