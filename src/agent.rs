// src/agent.rs
//! The ICE agent: a single-task actor owning all negotiation state.
//!
//! Every externally visible operation and every internal event (UDP
//! datagram, Ta tick, gathering reply) is delivered to the actor task as a
//! message and processed atomically; between messages no other task
//! observes intermediate state. Socket reader tasks only forward raw
//! datagrams into the mailbox.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Gathering -> Checking -> Completed
//!                          \-> Failed
//! ```
//!
//! The Ta tick (50 ms) paces one new transmission per firing: first any
//! waiting gathering transaction, otherwise the highest-priority waiting
//! pair's connectivity check. It stops once a pair is selected; a slower
//! keepalive timer takes over on the selected pair.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::candidate::{Candidate, CandidateType, SocketId};
use crate::check_list::CheckList;
use crate::config::{IceConfig, IceRole};
use crate::conn_check::{CheckEngine, EngineCtx, EngineEvent, IceCredentials};
use crate::error::{IceError, IceResult};
use crate::gathering::{self, GatherState};
use crate::pair::{CandidatePair, PairId, PairState};
use crate::stun::{self, Message, MessageType, TransactionId};
use crate::transport::SocketMap;

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Idle,
    Gathering,
    Checking,
    Completed,
    Failed,
    Closed,
}

/// The pair the agent settled on.
#[derive(Debug, Clone)]
pub struct SelectedPair {
    pub local: Candidate,
    pub remote: Candidate,
    pub priority: u64,
}

/// Events emitted to the controlling process.
#[derive(Debug, Clone)]
pub enum IceEvent {
    /// Local short-term credentials, emitted once after `run`.
    LocalCredentials { ufrag: String, pwd: String },
    /// A newly gathered or discovered local candidate, in SDP form.
    NewCandidate { candidate: String },
    /// Every gathering transaction finished.
    GatheringComplete,
    /// Some pair became valid.
    Connected,
    /// The selection changed.
    SelectedPair(SelectedPair),
    /// No usable path exists.
    Failed,
}

/// Agent counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceStats {
    pub state: AgentState,
    pub role: IceRole,
    pub candidates_gathered: u32,
    pub checks_sent: u32,
    pub checks_received: u32,
    pub responses_received: u32,
    pub pairs_succeeded: u32,
    pub pairs_failed: u32,
    pub role_conflicts: u32,
    pub selected_pair: Option<u64>,
}

impl IceStats {
    fn new(role: IceRole) -> Self {
        Self {
            state: AgentState::Idle,
            role,
            candidates_gathered: 0,
            checks_sent: 0,
            checks_received: 0,
            responses_received: 0,
            pairs_succeeded: 0,
            pairs_failed: 0,
            role_conflicts: 0,
            selected_pair: None,
        }
    }
}

enum AgentMsg {
    Run(oneshot::Sender<IceResult<()>>),
    SetRemoteCredentials(String, String, oneshot::Sender<IceResult<()>>),
    GatherCandidates(oneshot::Sender<IceResult<()>>),
    AddRemoteCandidate(String, oneshot::Sender<IceResult<()>>),
    EndOfCandidates(oneshot::Sender<IceResult<()>>),
    Stats(oneshot::Sender<IceStats>),
    Selected(oneshot::Sender<Option<SelectedPair>>),
    Datagram {
        socket: SocketId,
        src: SocketAddr,
        data: Vec<u8>,
    },
    Close,
}

/// Handle to a spawned ICE agent. All methods post messages into the
/// agent's mailbox; the actor task processes them in arrival order.
#[derive(Clone)]
pub struct IceAgent {
    tx: mpsc::UnboundedSender<AgentMsg>,
}

impl IceAgent {
    /// Spawn the agent actor. Must be called within a tokio runtime.
    /// Returns the handle and the upward event stream.
    pub fn spawn(config: IceConfig) -> (Self, mpsc::UnboundedReceiver<IceEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let actor = AgentActor::new(config, event_tx, msg_tx.clone(), shutdown_tx);
        tokio::spawn(actor.run_loop(msg_rx));

        (Self { tx: msg_tx }, event_rx)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> AgentMsg) -> IceResult<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| IceError::AgentClosed)?;
        rx.await.map_err(|_| IceError::AgentClosed)
    }

    /// Generate credentials, gather candidates, and start the Ta ticker.
    pub async fn run(&self) -> IceResult<()> {
        self.request(AgentMsg::Run).await?
    }

    /// Install the peer's ufrag and password.
    pub async fn set_remote_credentials(&self, ufrag: &str, pwd: &str) -> IceResult<()> {
        let (ufrag, pwd) = (ufrag.to_string(), pwd.to_string());
        self.request(|tx| AgentMsg::SetRemoteCredentials(ufrag, pwd, tx))
            .await?
    }

    /// Trigger an additional gathering pass (new interfaces, new servers).
    pub async fn gather_candidates(&self) -> IceResult<()> {
        self.request(AgentMsg::GatherCandidates).await?
    }

    /// Feed one remote candidate in SDP attribute form.
    pub async fn add_remote_candidate(&self, sdp: &str) -> IceResult<()> {
        let sdp = sdp.to_string();
        self.request(|tx| AgentMsg::AddRemoteCandidate(sdp, tx)).await?
    }

    /// The peer will send no further candidates.
    pub async fn end_of_candidates(&self) -> IceResult<()> {
        self.request(AgentMsg::EndOfCandidates).await?
    }

    pub async fn stats(&self) -> IceResult<IceStats> {
        self.request(AgentMsg::Stats).await
    }

    pub async fn selected_pair(&self) -> IceResult<Option<SelectedPair>> {
        self.request(AgentMsg::Selected).await
    }

    /// Shut the agent down. Pending mailbox messages are discarded.
    pub fn close(&self) {
        let _ = self.tx.send(AgentMsg::Close);
    }
}

struct AgentActor {
    config: IceConfig,
    state: AgentState,
    role: IceRole,
    tie_breaker: u64,
    local_creds: IceCredentials,
    remote_creds: Option<IceCredentials>,
    sockets: SocketMap,
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    checklist: CheckList,
    engine: CheckEngine,
    gather: GatherState,
    end_of_candidates: bool,
    selected: Option<PairId>,
    gathering_done: bool,
    started: bool,
    events: mpsc::UnboundedSender<IceEvent>,
    msg_tx: mpsc::UnboundedSender<AgentMsg>,
    shutdown: watch::Sender<bool>,
    stats: IceStats,
}

impl AgentActor {
    fn new(
        config: IceConfig,
        events: mpsc::UnboundedSender<IceEvent>,
        msg_tx: mpsc::UnboundedSender<AgentMsg>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        let role = config.role;
        Self {
            config,
            state: AgentState::Idle,
            role,
            tie_breaker: rand::random(),
            local_creds: IceCredentials::generate(),
            remote_creds: None,
            sockets: SocketMap::new(),
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            checklist: CheckList::new(),
            engine: CheckEngine::new(),
            gather: GatherState::new(),
            end_of_candidates: false,
            selected: None,
            gathering_done: false,
            started: false,
            events,
            msg_tx,
            shutdown,
            stats: IceStats::new(role),
        }
    }

    async fn run_loop(mut self, mut rx: mpsc::UnboundedReceiver<AgentMsg>) {
        let mut ta = interval(self.config.check_interval);
        ta.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keepalive = interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_msg = rx.recv() => {
                    match maybe_msg {
                        None | Some(AgentMsg::Close) => break,
                        Some(msg) => self.handle_msg(msg).await,
                    }
                }
                _ = ta.tick(), if self.ta_active() => {
                    self.on_ta_tick().await;
                }
                _ = keepalive.tick(), if self.keepalive_active() => {
                    self.send_keepalive().await;
                }
            }
        }

        info!("ICE agent shutting down");
        self.state = AgentState::Closed;
        let _ = self.shutdown.send(true);
    }

    fn ta_active(&self) -> bool {
        matches!(self.state, AgentState::Gathering | AgentState::Checking)
            && self.selected.is_none()
    }

    fn keepalive_active(&self) -> bool {
        self.state == AgentState::Completed && self.selected.is_some()
    }

    async fn handle_msg(&mut self, msg: AgentMsg) {
        match msg {
            AgentMsg::Run(resp) => {
                let result = self.handle_run().await;
                let _ = resp.send(result);
            }
            AgentMsg::SetRemoteCredentials(ufrag, pwd, resp) => {
                debug!("remote credentials set (ufrag={})", ufrag);
                self.remote_creds = Some(IceCredentials::new(ufrag, pwd));
                let _ = resp.send(Ok(()));
            }
            AgentMsg::GatherCandidates(resp) => {
                let result = if self.started {
                    self.do_gather().await
                } else {
                    Err(IceError::Configuration("agent not started".into()))
                };
                let _ = resp.send(result);
            }
            AgentMsg::AddRemoteCandidate(sdp, resp) => {
                let _ = resp.send(self.handle_add_remote_candidate(&sdp));
            }
            AgentMsg::EndOfCandidates(resp) => {
                self.handle_end_of_candidates();
                let _ = resp.send(Ok(()));
            }
            AgentMsg::Stats(resp) => {
                let mut stats = self.stats.clone();
                stats.state = self.state;
                stats.role = self.role;
                let _ = resp.send(stats);
            }
            AgentMsg::Selected(resp) => {
                let _ = resp.send(self.selected_info());
            }
            AgentMsg::Datagram { socket, src, data } => {
                self.handle_datagram(socket, src, data).await;
            }
            AgentMsg::Close => unreachable!("handled by the loop"),
        }
    }

    async fn handle_run(&mut self) -> IceResult<()> {
        if self.started {
            return Err(IceError::Configuration("agent already started".into()));
        }
        self.started = true;

        info!("starting ICE agent ({})", self.role);
        let _ = self.events.send(IceEvent::LocalCredentials {
            ufrag: self.local_creds.ufrag.clone(),
            pwd: self.local_creds.pwd.clone(),
        });

        self.state = AgentState::Gathering;
        self.do_gather().await
    }

    /// Bind a socket per accepted local address, create host candidates,
    /// and queue one srflx gathering transaction per (server, host) pair.
    async fn do_gather(&mut self) -> IceResult<()> {
        let ips: Vec<_> = if self.config.host_addresses.is_empty() {
            gathering::discover_local_ips(&self.config.ip_filter)
        } else {
            self.config
                .host_addresses
                .iter()
                .filter(|ip| (*self.config.ip_filter)(ip))
                .cloned()
                .collect()
        };

        for ip in ips {
            let already_bound = self
                .local_candidates
                .iter()
                .any(|c| c.candidate_type == CandidateType::Host && c.addr.ip() == ip);
            if already_bound {
                continue;
            }

            // Bind failure at startup is the one fatal resource error.
            let socket = Arc::new(UdpSocket::bind(SocketAddr::new(ip, 0)).await?);
            let addr = socket.local_addr()?;
            let id = self.sockets.register(socket.clone());
            self.spawn_reader(id, socket);

            let host = Candidate::host(addr, id);
            info!("host candidate {}", host);
            self.note_local_candidate(host);

            for server in self.config.stun_servers.clone() {
                if server.is_ipv4() == addr.is_ipv4() {
                    self.gather.enqueue(id, addr, server)?;
                }
            }
        }

        self.check_gathering_complete();
        Ok(())
    }

    fn spawn_reader(&self, id: SocketId, socket: Arc<UdpSocket>) {
        let tx = self.msg_tx.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((n, src)) => {
                            let msg = AgentMsg::Datagram {
                                socket: id,
                                src,
                                data: buf[..n].to_vec(),
                            };
                            if tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("socket {:?} read error: {}", id, e);
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Record a new local candidate: stats, upward event, pair formation.
    fn note_local_candidate(&mut self, candidate: Candidate) {
        self.stats.candidates_gathered += 1;
        let _ = self.events.send(IceEvent::NewCandidate {
            candidate: candidate.marshal(),
        });
        self.local_candidates.push(candidate.clone());

        let remotes = self.remote_candidates.clone();
        for remote in remotes {
            self.insert_pair(candidate.clone(), remote);
        }
    }

    /// Pair a local and remote candidate if their families match, with the
    /// frozen/waiting initial state rule applied.
    fn insert_pair(&mut self, local: Candidate, remote: Candidate) {
        if local.is_ipv4() != remote.is_ipv4() {
            return;
        }
        let id = self.checklist.next_pair_id();
        let mut pair = CandidatePair::new(
            id,
            local,
            remote,
            self.role.is_controlling(),
            PairState::Waiting,
        );
        pair.state = self.checklist.initial_state(&pair);
        self.checklist.insert(pair);
    }

    fn handle_add_remote_candidate(&mut self, sdp: &str) -> IceResult<()> {
        let candidate = Candidate::unmarshal(sdp)?;

        if self.remote_candidates.iter().any(|c| *c == candidate) {
            trace!("remote candidate {} already known", candidate);
            return Ok(());
        }

        debug!("remote candidate {}", candidate);
        self.remote_candidates.push(candidate.clone());

        let locals = self.local_candidates.clone();
        for local in locals {
            self.insert_pair(local, candidate.clone());
        }
        Ok(())
    }

    fn handle_end_of_candidates(&mut self) {
        debug!("end of remote candidates");
        self.end_of_candidates = true;

        // The controlled side only records the fact; the controlling side
        // may now have to nominate or give up.
        if self.role.is_controlling() {
            self.nominate_or_fail(true);
        }
    }

    /// One Ta firing: retransmissions first, then exactly one new
    /// transmission (gathering request or connectivity check).
    async fn on_ta_tick(&mut self) {
        let now = Instant::now();

        let timed_out = self.engine.retransmit_sweep(now, &self.sockets).await;
        for pair_id in timed_out {
            if let Some(pair) = self.checklist.get_mut(pair_id) {
                debug!("pair {} failed: retransmissions exhausted", pair);
                pair.state = PairState::Failed;
            }
            self.stats.pairs_failed += 1;
        }
        self.gather.retransmit_sweep(now, &self.sockets).await;
        self.check_gathering_complete();

        // Gathering transactions share the pacing budget and go first.
        if self.gather.any_waiting() {
            self.gather.advance_one(&self.sockets).await;
            return;
        }

        // Connectivity checks need the peer's credentials.
        if self.remote_creds.is_none() {
            return;
        }

        if let Some(pair_id) = self.checklist.highest(PairState::Waiting).map(|p| p.id) {
            self.launch_check(pair_id).await;
            return;
        }

        // Nothing waiting: unfreeze one frozen pair whose foundation has no
        // check in flight (RFC 8445 Section 6.1.4.2).
        if self.checklist.any(PairState::Frozen) {
            let in_progress: HashSet<_> = self
                .checklist
                .iter()
                .filter(|p| p.state == PairState::InProgress)
                .map(|p| p.foundations())
                .collect();
            let unfreeze = self
                .checklist
                .iter()
                .find(|p| p.state == PairState::Frozen && !in_progress.contains(&p.foundations()))
                .map(|p| p.id);
            if let Some(id) = unfreeze {
                if let Some(pair) = self.checklist.get_mut(id) {
                    pair.state = PairState::Waiting;
                }
                return;
            }
        }

        if self.checklist.any(PairState::InProgress) {
            return;
        }

        // Queue drained. The controlling agent nominates its best succeeded
        // pair; with nothing succeeded, both roles give up once there is
        // nothing left that could succeed.
        if self.role.is_controlling() {
            self.nominate_or_fail(self.end_of_candidates);
        } else if self.checklist.all_failed() && self.gather.all_done() {
            self.fail();
        }
    }

    /// Promote the best succeeded pair for nomination, or declare failure.
    fn nominate_or_fail(&mut self, fail_when_empty: bool) {
        if self.selected.is_some() {
            return;
        }
        if self.checklist.any(PairState::Waiting) || self.checklist.any(PairState::InProgress) {
            return;
        }

        if let Some((id, nominated)) = self
            .checklist
            .highest(PairState::Succeeded)
            .map(|p| (p.id, p.nominated))
        {
            if !nominated {
                let pair = self.checklist.get_mut(id).expect("pair exists");
                pair.nominate = true;
                pair.state = PairState::Waiting;
                debug!("promoting pair {} for nomination", id);
            }
        } else if self.checklist.all_failed() || (fail_when_empty && self.checklist.is_empty()) {
            self.fail();
        }
    }

    async fn launch_check(&mut self, pair_id: PairId) {
        if self.state == AgentState::Gathering {
            self.state = AgentState::Checking;
        }

        let local_creds = self.local_creds.clone();
        let remote_creds = self.remote_creds.clone().expect("checked by caller");
        let role = self.role;
        let tie_breaker = self.tie_breaker;

        self.stats.checks_sent += 1;
        let pair = self.checklist.get_mut(pair_id).expect("pair exists");
        if self
            .engine
            .send_check(pair, &local_creds, &remote_creds, role, tie_breaker, &self.sockets)
            .await
            .is_err()
        {
            self.stats.pairs_failed += 1;
        }
    }

    async fn handle_datagram(&mut self, socket: SocketId, src: SocketAddr, data: Vec<u8>) {
        if !stun::is_stun_datagram(&data) {
            trace!("non-STUN datagram from {} ignored", src);
            return;
        }

        let msg = match Message::decode(&data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("undecodable STUN datagram from {}: {}", src, e);
                return;
            }
        };

        match msg.message_type {
            MessageType::BindingRequest => {
                self.stats.checks_received += 1;
                let result = {
                    let mut ctx = EngineCtx {
                        role: &mut self.role,
                        tie_breaker: self.tie_breaker,
                        local_creds: &self.local_creds,
                        remote_creds: self.remote_creds.as_ref(),
                        local_candidates: &mut self.local_candidates,
                        remote_candidates: &mut self.remote_candidates,
                        checklist: &mut self.checklist,
                        sockets: &self.sockets,
                    };
                    self.engine
                        .handle_binding_request(&mut ctx, socket, src, &data, &msg)
                        .await
                };
                match result {
                    Ok(events) => self.process_engine_events(events),
                    Err(e) => debug!("binding request from {} not handled: {}", src, e),
                }
            }
            MessageType::BindingSuccess => {
                self.stats.responses_received += 1;

                // Gathering transactions are matched before connectivity
                // checks; their responses carry no credentials.
                if let Some((tx_socket, base, server)) = self
                    .gather
                    .complete(&msg.transaction_id)
                    .map(|tx| (tx.socket, tx.base, tx.server))
                {
                    self.handle_gather_success(tx_socket, base, server, &msg);
                    self.check_gathering_complete();
                    return;
                }

                let result = {
                    let mut ctx = EngineCtx {
                        role: &mut self.role,
                        tie_breaker: self.tie_breaker,
                        local_creds: &self.local_creds,
                        remote_creds: self.remote_creds.as_ref(),
                        local_candidates: &mut self.local_candidates,
                        remote_candidates: &mut self.remote_candidates,
                        checklist: &mut self.checklist,
                        sockets: &self.sockets,
                    };
                    self.engine
                        .handle_binding_response(&mut ctx, socket, src, &data, &msg)
                        .await
                };
                match result {
                    Ok(events) => self.process_engine_events(events),
                    Err(e) => debug!("binding response from {} not handled: {}", src, e),
                }
            }
            MessageType::BindingError => {
                if self.engine.owns_transaction(&msg.transaction_id) {
                    let result = {
                        let mut ctx = EngineCtx {
                            role: &mut self.role,
                            tie_breaker: self.tie_breaker,
                            local_creds: &self.local_creds,
                            remote_creds: self.remote_creds.as_ref(),
                            local_candidates: &mut self.local_candidates,
                            remote_candidates: &mut self.remote_candidates,
                            checklist: &mut self.checklist,
                            sockets: &self.sockets,
                        };
                        self.engine
                            .handle_binding_error(&mut ctx, src, &data, &msg)
                            .await
                    };
                    match result {
                        Ok(events) => self.process_engine_events(events),
                        Err(e) => debug!("binding error from {} not handled: {}", src, e),
                    }
                } else {
                    warn!(
                        "error response from {} for unknown transaction {}",
                        src, msg.transaction_id
                    );
                }
            }
            MessageType::BindingIndication => {
                trace!("keepalive indication from {}", src);
            }
        }
    }

    /// A STUN server reported our reflexive address: create the srflx
    /// candidate unless it collapses into a known one.
    fn handle_gather_success(
        &mut self,
        socket: SocketId,
        base: SocketAddr,
        server: SocketAddr,
        msg: &Message,
    ) {
        let Some(mapped) = msg.xor_mapped_address() else {
            debug!("gathering response from {} lacks XOR-MAPPED-ADDRESS", server);
            return;
        };

        let srflx = Candidate::server_reflexive(mapped, base, socket, server);
        if self.local_candidates.iter().any(|c| *c == srflx) {
            debug!("reflexive address {} already covered", mapped);
            return;
        }

        info!("server-reflexive candidate {}", srflx);
        self.note_local_candidate(srflx);
    }

    fn check_gathering_complete(&mut self) {
        if self.started && !self.gathering_done && self.gather.all_done() {
            self.gathering_done = true;
            info!("candidate gathering complete");
            let _ = self.events.send(IceEvent::GatheringComplete);
        }
    }

    fn process_engine_events(&mut self, events: Vec<EngineEvent>) {
        for event in events {
            match event {
                EngineEvent::PairValidated(id) => {
                    debug!("pair {} is valid", id);
                    self.stats.pairs_succeeded += 1;
                    let _ = self.events.send(IceEvent::Connected);
                }
                EngineEvent::LocalCandidate(candidate) => {
                    self.stats.candidates_gathered += 1;
                    let _ = self.events.send(IceEvent::NewCandidate {
                        candidate: candidate.marshal(),
                    });
                }
                EngineEvent::NominationReady(id) => {
                    self.select_if_better(id);
                }
                EngineEvent::RoleSwitched(role) => {
                    self.stats.role_conflicts += 1;
                    self.stats.role = role;
                }
                EngineEvent::PairFailed(_) => {
                    self.stats.pairs_failed += 1;
                }
            }
        }
    }

    /// Selection policy: first nomination wins; later nominations replace
    /// the selection only with strictly higher priority.
    fn select_if_better(&mut self, id: PairId) {
        let Some(pair) = self.checklist.get(id) else {
            return;
        };

        let replace = match self.selected {
            None => true,
            Some(current) => self
                .checklist
                .get(current)
                .map(|c| pair.priority > c.priority)
                .unwrap_or(true),
        };

        if replace {
            info!("selected pair {}", pair);
            let info = SelectedPair {
                local: pair.local.clone(),
                remote: pair.remote.clone(),
                priority: pair.priority,
            };
            self.selected = Some(id);
            self.stats.selected_pair = Some(id.0);
            self.state = AgentState::Completed;
            let _ = self.events.send(IceEvent::SelectedPair(info));
        }
    }

    fn selected_info(&self) -> Option<SelectedPair> {
        let pair = self.checklist.get(self.selected?)?;
        Some(SelectedPair {
            local: pair.local.clone(),
            remote: pair.remote.clone(),
            priority: pair.priority,
        })
    }

    fn fail(&mut self) {
        if matches!(
            self.state,
            AgentState::Failed | AgentState::Completed | AgentState::Closed
        ) {
            return;
        }
        warn!("ICE failed: no usable candidate pair");
        self.state = AgentState::Failed;
        let _ = self.events.send(IceEvent::Failed);
    }

    /// Hold the NAT binding open on the selected pair with a binding
    /// indication (RFC 8445 Section 11).
    async fn send_keepalive(&mut self) {
        let Some(pair) = self.selected.and_then(|id| self.checklist.get(id)) else {
            return;
        };
        let Some(socket) = pair.local.socket else {
            return;
        };

        trace!("keepalive on selected pair {}", pair.id);
        let indication = Message::binding_indication(TransactionId::new());
        if let Ok(payload) = indication.encode(None, true) {
            if let Err(e) = self.sockets.send_to(socket, pair.remote.addr, &payload).await {
                warn!("keepalive send on selected pair {} failed: {}", pair.id, e);
            }
        }
    }
}
