// src/conn_check.rs
//! Connectivity-check engine (RFC 8445 Section 7).
//!
//! Builds and transmits authenticated STUN binding requests, correlates
//! responses with in-flight transactions, enforces response symmetry,
//! discovers peer-reflexive candidates, and applies the valid-pair and
//! role-conflict rules. Scheduling (which pair to check when) belongs to
//! the agent's Ta tick; this module owns everything per-transaction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::candidate::{Candidate, CandidateType, SocketId};
use crate::check_list::CheckList;
use crate::config::IceRole;
use crate::error::IceResult;
use crate::pair::{CandidatePair, PairId, PairKey, PairState};
use crate::priority::{candidate_priority, COMPONENT_ID, DEFAULT_LOCAL_PREFERENCE};
use crate::stun::{self, Attribute, Message, TransactionId, ERROR_ROLE_CONFLICT};
use crate::transport::SocketMap;

/// Initial retransmission timeout (RFC 5389 Section 7.2.1).
pub const RTO_INITIAL: Duration = Duration::from_millis(500);

/// Maximum number of transmissions per transaction (Rc).
pub const MAX_TRANSMITS: u32 = 7;

/// Multiplier for the final wait after the last transmission (Rm).
pub const RM: u32 = 16;

/// Per-transaction retransmission schedule: doubling intervals, Rc
/// transmissions, then a final wait of Rm x RTO before the transaction is
/// declared dead.
#[derive(Debug, Clone, Copy)]
pub struct Rto {
    sent_at: Instant,
    transmits: u32,
    current: Duration,
}

impl Rto {
    pub fn new(now: Instant) -> Self {
        Self {
            sent_at: now,
            transmits: 1,
            current: RTO_INITIAL,
        }
    }

    /// A retransmission is due.
    pub fn due(&self, now: Instant) -> bool {
        self.transmits < MAX_TRANSMITS && now >= self.sent_at + self.current
    }

    /// All transmissions spent and the final wait has elapsed.
    pub fn exhausted(&self, now: Instant) -> bool {
        self.transmits >= MAX_TRANSMITS && now >= self.sent_at + RTO_INITIAL * RM
    }

    pub fn record_retransmit(&mut self, now: Instant) {
        self.transmits += 1;
        self.current *= 2;
        self.sent_at = now;
    }

    pub fn transmits(&self) -> u32 {
        self.transmits
    }
}

/// Short-term ICE credentials (RFC 8445 Section 5.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    /// Generate fresh credentials: 4-char ufrag, 22-char password, drawn
    /// from the base64 alphabet.
    pub fn generate() -> Self {
        Self {
            ufrag: random_ice_chars(4),
            pwd: random_ice_chars(22),
        }
    }

    pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        Self {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        }
    }
}

fn random_ice_chars(len: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789+/";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// An in-flight connectivity check.
#[derive(Debug)]
struct InFlightCheck {
    pair_id: PairId,
    socket: SocketId,
    dest: SocketAddr,
    /// Retransmissions resend the identical datagram.
    payload: Bytes,
    use_candidate: bool,
    rto: Rto,
}

/// Mutable agent state the engine operates on. All fields live in the actor
/// task; the engine never stores references.
pub struct EngineCtx<'a> {
    pub role: &'a mut IceRole,
    pub tie_breaker: u64,
    pub local_creds: &'a IceCredentials,
    pub remote_creds: Option<&'a IceCredentials>,
    pub local_candidates: &'a mut Vec<Candidate>,
    pub remote_candidates: &'a mut Vec<Candidate>,
    pub checklist: &'a mut CheckList,
    pub sockets: &'a SocketMap,
}

/// What the engine observed; the agent maps these to upward events and to
/// the selection policy.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A pair became valid for the first time.
    PairValidated(PairId),
    /// A pair completed nomination; run the selection policy on it.
    NominationReady(PairId),
    /// A new local (peer-reflexive) candidate was discovered.
    LocalCandidate(Candidate),
    /// A role conflict forced a role switch.
    RoleSwitched(IceRole),
    /// A check definitively failed its pair.
    PairFailed(PairId),
}

/// The connectivity-check engine: the in-flight transaction table plus the
/// request/response protocol logic.
#[derive(Debug, Default)]
pub struct CheckEngine {
    conn_checks: HashMap<TransactionId, InFlightCheck>,
}

impl CheckEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> usize {
        self.conn_checks.len()
    }

    /// Build, transmit and register a connectivity check for `pair`
    /// (RFC 8445 Section 7.2.4). The pair moves to `InProgress`.
    pub async fn send_check(
        &mut self,
        pair: &mut CandidatePair,
        local_creds: &IceCredentials,
        remote_creds: &IceCredentials,
        role: IceRole,
        tie_breaker: u64,
        sockets: &SocketMap,
    ) -> IceResult<()> {
        let use_candidate = role.is_controlling() && pair.nominate;
        let tid = TransactionId::new();

        let mut request = Message::binding_request(tid);
        request.add_attribute(Attribute::Username(format!(
            "{}:{}",
            remote_creds.ufrag, local_creds.ufrag
        )));
        // PRIORITY: what our candidate's priority would be as peer-reflexive
        // (RFC 8445 Section 7.1.1).
        request.add_attribute(Attribute::Priority(candidate_priority(
            CandidateType::PeerReflexive,
            DEFAULT_LOCAL_PREFERENCE,
            COMPONENT_ID,
        )));
        match role {
            IceRole::Controlling => {
                request.add_attribute(Attribute::IceControlling(tie_breaker));
                if use_candidate {
                    request.add_attribute(Attribute::UseCandidate);
                }
            }
            IceRole::Controlled => {
                request.add_attribute(Attribute::IceControlled(tie_breaker));
            }
        }

        let payload = request.encode(Some(remote_creds.pwd.as_bytes()), true)?;

        let socket = pair
            .local
            .socket
            .expect("local candidates always carry a socket");
        let dest = pair.remote.addr;

        debug!(
            "sending check on {} (use_candidate={}, tid={})",
            pair, use_candidate, tid
        );

        if let Err(e) = sockets.send_to(socket, dest, &payload).await {
            warn!("check transmission failed for {}: {}", pair, e);
            pair.state = PairState::Failed;
            return Err(e);
        }

        pair.state = PairState::InProgress;
        self.conn_checks.insert(
            tid,
            InFlightCheck {
                pair_id: pair.id,
                socket,
                dest,
                payload,
                use_candidate,
                rto: Rto::new(Instant::now()),
            },
        );

        Ok(())
    }

    /// Retransmit due checks and expire exhausted ones. Returns the pairs
    /// whose transactions died; the caller marks them failed.
    pub async fn retransmit_sweep(&mut self, now: Instant, sockets: &SocketMap) -> Vec<PairId> {
        let mut dead = Vec::new();
        let mut resend = Vec::new();

        for (tid, check) in &mut self.conn_checks {
            if check.rto.exhausted(now) {
                dead.push((*tid, check.pair_id));
            } else if check.rto.due(now) {
                check.rto.record_retransmit(now);
                resend.push((*tid, check.socket, check.dest, check.payload.clone()));
            }
        }

        for (tid, socket, dest, payload) in resend {
            trace!("retransmitting check {}", tid);
            if let Err(e) = sockets.send_to(socket, dest, &payload).await {
                warn!("retransmit of {} failed: {}", tid, e);
                if let Some(check) = self.conn_checks.get(&tid) {
                    dead.push((tid, check.pair_id));
                }
            }
        }

        let mut failed = Vec::new();
        for (tid, pair_id) in dead {
            self.conn_checks.remove(&tid);
            debug!("check {} for pair {} timed out", tid, pair_id);
            failed.push(pair_id);
        }
        failed
    }

    /// Drop any in-flight transactions belonging to a pair that left the
    /// `InProgress` state.
    pub fn forget_pair(&mut self, pair_id: PairId) {
        self.conn_checks.retain(|_, c| c.pair_id != pair_id);
    }

    /// Whether a transaction id belongs to an in-flight connectivity check.
    pub fn owns_transaction(&self, tid: &TransactionId) -> bool {
        self.conn_checks.contains_key(tid)
    }

    /// Handle an inbound STUN binding request on one of our sockets
    /// (RFC 8445 Section 7.3; we are the responder).
    pub async fn handle_binding_request(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        socket: SocketId,
        src: SocketAddr,
        raw: &[u8],
        msg: &Message,
    ) -> IceResult<Vec<EngineEvent>> {
        let mut events = Vec::new();

        // Authentication: fingerprint, then integrity under our password,
        // then the username prefix. Any failure drops the request silently.
        if !stun::verify_fingerprint(raw) {
            debug!("dropping request from {}: bad fingerprint", src);
            return Ok(events);
        }
        if !stun::verify_message_integrity(raw, ctx.local_creds.pwd.as_bytes()) {
            debug!("dropping request from {}: bad integrity", src);
            return Ok(events);
        }
        match msg.username().and_then(|u| u.split_once(':')) {
            Some((local_part, _)) if local_part == ctx.local_creds.ufrag => {}
            _ => {
                debug!("dropping request from {}: bad username", src);
                return Ok(events);
            }
        }

        // Role conflict resolution (RFC 8445 Section 7.3.1.1).
        match (*ctx.role, msg.ice_controlling(), msg.ice_controlled()) {
            (IceRole::Controlling, Some(their_tb), _) => {
                if ctx.tie_breaker >= their_tb {
                    self.send_role_conflict(ctx, socket, src, msg.transaction_id).await?;
                    return Ok(events);
                }
                self.switch_role(ctx, &mut events);
            }
            (IceRole::Controlled, _, Some(their_tb)) => {
                if ctx.tie_breaker >= their_tb {
                    self.switch_role(ctx, &mut events);
                } else {
                    self.send_role_conflict(ctx, socket, src, msg.transaction_id).await?;
                    return Ok(events);
                }
            }
            _ => {}
        }

        // Always answer with a success response carrying the observed
        // source address.
        let mut response = Message::binding_success(msg.transaction_id);
        response.add_attribute(Attribute::XorMappedAddress(src));
        let encoded = response.encode(Some(ctx.local_creds.pwd.as_bytes()), true)?;
        ctx.sockets.send_to(socket, src, &encoded).await?;

        // The pair's local side is the host candidate bound to this socket.
        let Some(local) = ctx
            .local_candidates
            .iter()
            .find(|c| c.socket == Some(socket) && c.candidate_type == CandidateType::Host)
            .cloned()
        else {
            warn!("request on socket {:?} with no host candidate", socket);
            return Ok(events);
        };

        // Unknown source: synthesise a peer-reflexive remote candidate with
        // the priority the request advertised (RFC 8445 Section 7.3.1.3).
        let remote = match ctx.remote_candidates.iter().find(|c| c.addr == src) {
            Some(c) => c.clone(),
            None => {
                let priority = msg.priority().unwrap_or_else(|| {
                    candidate_priority(
                        CandidateType::PeerReflexive,
                        DEFAULT_LOCAL_PREFERENCE,
                        COMPONENT_ID,
                    )
                });
                let prflx = Candidate::peer_reflexive_remote(src, priority);
                debug!("discovered remote prflx candidate {}", prflx);
                ctx.remote_candidates.push(prflx.clone());
                prflx
            }
        };

        let mut use_candidate = msg.has_use_candidate();
        if use_candidate && ctx.role.is_controlling() {
            // Only the controlling agent may nominate. Be lenient: ignore
            // the attribute rather than failing the pair.
            warn!("peer sent USE-CANDIDATE while we are controlling; ignoring");
            use_candidate = false;
        }

        let key = PairKey {
            local: local.key(),
            remote: remote.key(),
        };

        match ctx.checklist.find(&key).map(|p| (p.id, p.state)) {
            None => {
                let id = ctx.checklist.next_pair_id();
                let mut pair = CandidatePair::new(
                    id,
                    local,
                    remote,
                    ctx.role.is_controlling(),
                    PairState::Waiting,
                );
                pair.nominate = use_candidate;
                ctx.checklist.insert(pair);
            }
            Some((id, PairState::Succeeded)) if use_candidate => {
                // Nomination of a pair we already validated: promote the
                // valid pair it discovered (or itself).
                if let Some(valid_id) = ctx.checklist.valid_pair_for(id).map(|p| p.id) {
                    let pair = ctx.checklist.get_mut(valid_id).expect("pair exists");
                    if !pair.nominated {
                        pair.nominated = true;
                        pair.nominate = false;
                        events.push(EngineEvent::NominationReady(valid_id));
                    }
                }
            }
            Some((id, _)) if use_candidate => {
                // Not yet succeeded: record the intent; nomination fires
                // when this pair's own check succeeds.
                let pair = ctx.checklist.get_mut(id).expect("pair exists");
                pair.nominate = true;
            }
            Some(_) => {
                // Keepalive or retransmit of a known check: state unchanged.
                trace!("request for known pair from {}: no-op", src);
            }
        }

        Ok(events)
    }

    /// Handle an inbound binding success response to one of our checks
    /// (RFC 8445 Section 7.2.5).
    pub async fn handle_binding_response(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        socket: SocketId,
        src: SocketAddr,
        raw: &[u8],
        msg: &Message,
    ) -> IceResult<Vec<EngineEvent>> {
        let mut events = Vec::new();
        let tid = msg.transaction_id;

        if !self.conn_checks.contains_key(&tid) {
            warn!("response from {} for unknown transaction {}", src, tid);
            return Ok(events);
        }

        // Responses are protected with the same password as the request we
        // sent, i.e. the remote one. Leave the transaction alive on
        // authentication failure so retransmissions continue.
        let Some(remote_creds) = ctx.remote_creds else {
            return Ok(events);
        };
        if !stun::verify_fingerprint(raw)
            || !stun::verify_message_integrity(raw, remote_creds.pwd.as_bytes())
        {
            debug!("dropping response from {}: failed authentication", src);
            return Ok(events);
        }

        let check = self.conn_checks.remove(&tid).expect("checked above");
        let Some(pair) = ctx.checklist.get(check.pair_id).map(|p| p.clone()) else {
            warn!("response for vanished pair {}", check.pair_id);
            return Ok(events);
        };

        // Symmetry: the response must come from the address we sent to and
        // arrive on the socket we sent from (RFC 8445 Section 7.2.5.2.1).
        if src != check.dest || socket != check.socket {
            debug!(
                "asymmetric response for {}: from {} on {:?}, expected {} on {:?}",
                pair, src, socket, check.dest, check.socket
            );
            self.fail_pair(ctx.checklist, check.pair_id, &mut events);
            return Ok(events);
        }

        let Some(mapped) = msg.xor_mapped_address() else {
            debug!("response for {} lacks XOR-MAPPED-ADDRESS", pair);
            self.fail_pair(ctx.checklist, check.pair_id, &mut events);
            return Ok(events);
        };

        // Discover the local side of the valid pair (RFC 8445
        // Section 7.2.5.3.1): peer-reflexive if the mapped address is new.
        let local_for_mapped = match ctx.local_candidates.iter().find(|c| c.addr == mapped) {
            Some(c) => c.clone(),
            None => {
                let prflx = Candidate::peer_reflexive_local(
                    mapped,
                    pair.local.base,
                    check.socket,
                );
                debug!("discovered local prflx candidate {}", prflx);
                ctx.local_candidates.push(prflx.clone());
                events.push(EngineEvent::LocalCandidate(prflx.clone()));
                prflx
            }
        };

        // Fold the valid pair into the checklist (RFC 8445
        // Section 7.2.5.3.2).
        let valid_key = PairKey {
            local: local_for_mapped.key(),
            remote: pair.remote.key(),
        };

        let target_id = if valid_key == pair.key() {
            // The check pair itself is the valid pair.
            let p = ctx.checklist.get_mut(pair.id).expect("pair exists");
            p.state = PairState::Succeeded;
            if !p.valid {
                p.valid = true;
                events.push(EngineEvent::PairValidated(p.id));
            }
            pair.id
        } else if let Some(existing_id) = ctx.checklist.find(&valid_key).map(|p| p.id) {
            // The valid pair already exists in the checklist.
            {
                let p = ctx.checklist.get_mut(pair.id).expect("pair exists");
                p.state = PairState::Succeeded;
            }
            let e = ctx.checklist.get_mut(existing_id).expect("pair exists");
            e.state = PairState::Succeeded;
            if !e.valid {
                e.valid = true;
                events.push(EngineEvent::PairValidated(existing_id));
            }
            if e.discovered_by.is_none() {
                e.discovered_by = Some(pair.id);
            }
            existing_id
        } else {
            // Brand-new valid pair, appended without pruning.
            {
                let p = ctx.checklist.get_mut(pair.id).expect("pair exists");
                p.state = PairState::Succeeded;
            }
            let id = ctx.checklist.next_pair_id();
            let mut valid = CandidatePair::new(
                id,
                local_for_mapped,
                pair.remote.clone(),
                ctx.role.is_controlling(),
                PairState::Succeeded,
            );
            valid.valid = true;
            valid.discovered_by = Some(pair.id);
            ctx.checklist.add_valid(valid);
            events.push(EngineEvent::PairValidated(id));
            id
        };

        // Succeeding unfreezes same-foundation pairs (Section 7.2.5.3.3).
        ctx.checklist.unfreeze_foundation(&pair.foundations());

        // Nomination bookkeeping. The controlled side nominates when its
        // own check on a peer-nominated pair succeeds; the controlling side
        // when its USE-CANDIDATE check comes back.
        let intent = pair.nominate
            || check.use_candidate
            || ctx.checklist.get(target_id).map(|p| p.nominate).unwrap_or(false);
        if intent {
            let completes = check.use_candidate || !ctx.role.is_controlling();
            let target = ctx.checklist.get_mut(target_id).expect("pair exists");
            if completes && !target.nominated {
                target.nominated = true;
                target.nominate = false;
                events.push(EngineEvent::NominationReady(target_id));
            } else if !completes && !target.nominated {
                // Controlling: re-check the valid pair with USE-CANDIDATE on
                // a subsequent Ta tick.
                target.nominate = true;
            }
        }

        Ok(events)
    }

    /// Handle an inbound binding error response (RFC 8445 Section 7.2.5.1).
    pub async fn handle_binding_error(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        src: SocketAddr,
        raw: &[u8],
        msg: &Message,
    ) -> IceResult<Vec<EngineEvent>> {
        let mut events = Vec::new();
        let tid = msg.transaction_id;

        if !self.conn_checks.contains_key(&tid) {
            warn!("error response from {} for unknown transaction {}", src, tid);
            return Ok(events);
        }

        let Some(remote_creds) = ctx.remote_creds else {
            return Ok(events);
        };
        if !stun::verify_fingerprint(raw)
            || !stun::verify_message_integrity(raw, remote_creds.pwd.as_bytes())
        {
            debug!("dropping error response from {}: failed authentication", src);
            return Ok(events);
        }

        let check = self.conn_checks.remove(&tid).expect("checked above");

        match msg.error_code() {
            Some(ERROR_ROLE_CONFLICT) => {
                // Switch role, recompute priorities, and give the pair
                // another chance under the new role.
                self.switch_role(ctx, &mut events);
                if let Some(pair) = ctx.checklist.get_mut(check.pair_id) {
                    pair.state = PairState::Waiting;
                }
            }
            code => {
                debug!(
                    "check on pair {} rejected with {:?}; failing pair",
                    check.pair_id, code
                );
                self.fail_pair(ctx.checklist, check.pair_id, &mut events);
            }
        }

        Ok(events)
    }

    fn fail_pair(&mut self, checklist: &mut CheckList, pair_id: PairId, events: &mut Vec<EngineEvent>) {
        if let Some(pair) = checklist.get_mut(pair_id) {
            pair.state = PairState::Failed;
        }
        self.forget_pair(pair_id);
        events.push(EngineEvent::PairFailed(pair_id));
    }

    fn switch_role(&mut self, ctx: &mut EngineCtx<'_>, events: &mut Vec<EngineEvent>) {
        let new_role = ctx.role.flipped();
        warn!("role conflict: switching to {}", new_role);
        *ctx.role = new_role;
        ctx.checklist.recompute_priorities(new_role.is_controlling());
        events.push(EngineEvent::RoleSwitched(new_role));
    }

    async fn send_role_conflict(
        &self,
        ctx: &EngineCtx<'_>,
        socket: SocketId,
        src: SocketAddr,
        tid: TransactionId,
    ) -> IceResult<()> {
        debug!("role conflict: answering {} with 487", src);
        let mut response = Message::binding_error(tid);
        response.add_attribute(Attribute::ErrorCode {
            code: ERROR_ROLE_CONFLICT,
            reason: "Role Conflict".to_string(),
        });
        let encoded = response.encode(Some(ctx.local_creds.pwd.as_bytes()), true)?;
        ctx.sockets.send_to(socket, src, &encoded).await
    }
}
