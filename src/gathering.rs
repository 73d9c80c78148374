// src/gathering.rs
//! Candidate gathering: host address discovery and server-reflexive
//! gathering transactions (RFC 8445 Section 5.1.1).
//!
//! Host enumeration keeps to the default-route source-address trick: a UDP
//! socket is "connected" to a well-known public address (no packet leaves
//! the host) and the kernel reports which local address it would route
//! from. Srflx gathering runs one STUN binding transaction per
//! (STUN server, host candidate) combination, paced by the agent's Ta tick
//! and retransmitted on the same schedule as connectivity checks.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::candidate::SocketId;
use crate::config::IpFilter;
use crate::conn_check::Rto;
use crate::error::IceResult;
use crate::stun::{Message, TransactionId};
use crate::transport::SocketMap;

/// State of a server-reflexive gathering transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherTxState {
    /// Queued; not yet sent.
    Waiting,
    /// Request sent, awaiting the server's response.
    InProgress,
    /// Response received and processed.
    Completed,
    /// Retransmissions exhausted or send failed.
    Failed,
}

/// One STUN binding transaction towards one server from one host socket.
#[derive(Debug)]
pub struct GatherTx {
    pub tid: TransactionId,
    pub socket: SocketId,
    /// The host candidate's address: base of the srflx candidate to come.
    pub base: SocketAddr,
    pub server: SocketAddr,
    pub state: GatherTxState,
    payload: Bytes,
    rto: Option<Rto>,
}

/// The set of gathering transactions for this agent.
#[derive(Debug, Default)]
pub struct GatherState {
    txs: Vec<GatherTx>,
}

impl GatherState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a gathering transaction. The binding request towards a STUN
    /// server carries no authentication.
    pub fn enqueue(&mut self, socket: SocketId, base: SocketAddr, server: SocketAddr) -> IceResult<()> {
        let tid = TransactionId::new();
        let payload = Message::binding_request(tid).encode(None, false)?;
        self.txs.push(GatherTx {
            tid,
            socket,
            base,
            server,
            state: GatherTxState::Waiting,
            payload,
            rto: None,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn any_waiting(&self) -> bool {
        self.txs.iter().any(|t| t.state == GatherTxState::Waiting)
    }

    /// Every transaction reached a terminal state.
    pub fn all_done(&self) -> bool {
        self.txs
            .iter()
            .all(|t| matches!(t.state, GatherTxState::Completed | GatherTxState::Failed))
    }

    /// Advance exactly one waiting transaction to in-progress by sending its
    /// binding request (one per Ta tick, RFC 8445 Section 5.1.1).
    pub async fn advance_one(&mut self, sockets: &SocketMap) -> bool {
        let Some(tx) = self.txs.iter_mut().find(|t| t.state == GatherTxState::Waiting) else {
            return false;
        };

        debug!("gathering: querying {} from {}", tx.server, tx.base);
        match sockets.send_to(tx.socket, tx.server, &tx.payload).await {
            Ok(()) => {
                tx.state = GatherTxState::InProgress;
                tx.rto = Some(Rto::new(Instant::now()));
            }
            Err(e) => {
                warn!("gathering send to {} failed: {}", tx.server, e);
                tx.state = GatherTxState::Failed;
            }
        }
        true
    }

    /// Match a response transaction id. Marks the transaction completed and
    /// returns it.
    pub fn complete(&mut self, tid: &TransactionId) -> Option<&GatherTx> {
        let tx = self
            .txs
            .iter_mut()
            .find(|t| t.tid == *tid && t.state == GatherTxState::InProgress)?;
        tx.state = GatherTxState::Completed;
        tx.rto = None;
        Some(tx)
    }

    /// Retransmit due requests, expire exhausted ones.
    pub async fn retransmit_sweep(&mut self, now: Instant, sockets: &SocketMap) {
        for tx in &mut self.txs {
            if tx.state != GatherTxState::InProgress {
                continue;
            }
            let Some(rto) = tx.rto.as_mut() else { continue };

            if rto.exhausted(now) {
                debug!("gathering transaction to {} timed out", tx.server);
                tx.state = GatherTxState::Failed;
                tx.rto = None;
            } else if rto.due(now) {
                rto.record_retransmit(now);
                trace!("retransmitting gathering request to {}", tx.server);
                if sockets.send_to(tx.socket, tx.server, &tx.payload).await.is_err() {
                    tx.state = GatherTxState::Failed;
                    tx.rto = None;
                }
            }
        }
    }
}

/// Discover local addresses suitable for host candidates, subject to the
/// configured filter. Loopback is offered to the filter too so tests can
/// opt in.
pub fn discover_local_ips(filter: &IpFilter) -> Vec<IpAddr> {
    let mut ips: Vec<IpAddr> = Vec::new();

    // Route-selected source addresses. connect() on UDP sends nothing; it
    // only asks the kernel for a route.
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:53").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                ips.push(addr.ip());
            }
        }
    }
    if let Ok(socket) = std::net::UdpSocket::bind("[::]:0") {
        if socket.connect("[2001:4860:4860::8888]:53").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                ips.push(addr.ip());
            }
        }
    }

    ips.push(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));

    ips.sort();
    ips.dedup();
    ips.retain(|ip| (**filter)(ip));
    ips
}
