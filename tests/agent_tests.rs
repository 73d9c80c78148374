//! End-to-end agent scenarios over loopback UDP.
//!
//! A scripted fake peer (and fake STUN server) is built on the crate's own
//! STUN codec; no test touches a real network.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use ice_agent::stun::{self, Attribute, Message, MessageType};
use ice_agent::{CandidateType, IceAgent, IceConfig, IceEvent, IceRole};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(role: IceRole) -> IceConfig {
    IceConfig::new(role)
        .with_ip_filter(|_| true)
        .with_host_addresses(vec!["127.0.0.1".parse().unwrap()])
}

/// Wait for the first event matching the predicate, discarding others.
async fn wait_for(
    events: &mut UnboundedReceiver<IceEvent>,
    mut pred: impl FnMut(&IceEvent) -> bool,
) -> IceEvent {
    timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Pull everything currently queued without waiting.
fn drain(events: &mut UnboundedReceiver<IceEvent>) -> Vec<IceEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

async fn local_credentials(events: &mut UnboundedReceiver<IceEvent>) -> (String, String) {
    match wait_for(events, |e| matches!(e, IceEvent::LocalCredentials { .. })).await {
        IceEvent::LocalCredentials { ufrag, pwd } => (ufrag, pwd),
        _ => unreachable!(),
    }
}

/// The remote side of the session, scripted by each test.
struct FakePeer {
    socket: UdpSocket,
    ufrag: String,
    pwd: String,
}

impl FakePeer {
    async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            ufrag: "peer".to_string(),
            pwd: "peerpasswordpeerpasswd".to_string(),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn host_candidate_sdp(&self) -> String {
        format!(
            "peerfnd 1 udp 2130706431 {} {} typ host",
            self.addr().ip(),
            self.addr().port()
        )
    }

    /// Receive the next authenticated binding request from the agent.
    async fn recv_request(&self) -> (Message, SocketAddr) {
        loop {
            let mut buf = [0u8; 1500];
            let (n, src) = timeout(EVENT_TIMEOUT, self.socket.recv_from(&mut buf))
                .await
                .expect("timed out waiting for agent datagram")
                .unwrap();
            let raw = &buf[..n];
            if !stun::is_stun_datagram(raw) {
                continue;
            }
            let msg = Message::decode(raw).unwrap();
            if msg.message_type == MessageType::BindingRequest {
                assert!(stun::verify_fingerprint(raw));
                assert!(stun::verify_message_integrity(raw, self.pwd.as_bytes()));
                return (msg, src);
            }
        }
    }

    /// Answer a check with a success response. `mapped` overrides the
    /// reported reflexive address (defaults to the observed source).
    async fn respond_success(&self, request: &Message, src: SocketAddr, mapped: Option<SocketAddr>) {
        let mut response = Message::binding_success(request.transaction_id);
        response.add_attribute(Attribute::XorMappedAddress(mapped.unwrap_or(src)));
        let payload = response.encode(Some(self.pwd.as_bytes()), true).unwrap();
        self.socket.send_to(&payload, src).await.unwrap();
    }

    /// Send a connectivity check of our own towards the agent.
    async fn send_check(
        &self,
        dest: SocketAddr,
        agent_ufrag: &str,
        agent_pwd: &str,
        controlling: bool,
        tie_breaker: u64,
        use_candidate: bool,
    ) -> Message {
        let mut request = Message::binding_request(stun::TransactionId::new());
        request.add_attribute(Attribute::Username(format!("{}:{}", agent_ufrag, self.ufrag)));
        request.add_attribute(Attribute::Priority(0x6e7f_1eff));
        if controlling {
            request.add_attribute(Attribute::IceControlling(tie_breaker));
            if use_candidate {
                request.add_attribute(Attribute::UseCandidate);
            }
        } else {
            request.add_attribute(Attribute::IceControlled(tie_breaker));
        }
        let payload = request.encode(Some(agent_pwd.as_bytes()), true).unwrap();
        self.socket.send_to(&payload, dest).await.unwrap();
        request
    }

    /// Serve success responses forever (echoing the observed source).
    fn serve(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let mut buf = [0u8; 1500];
                let Ok((n, src)) = self.socket.recv_from(&mut buf).await else {
                    return;
                };
                let raw = &buf[..n];
                if !stun::is_stun_datagram(raw) {
                    continue;
                }
                let Ok(msg) = Message::decode(raw) else { continue };
                if msg.message_type == MessageType::BindingRequest {
                    self.respond_success(&msg, src, None).await;
                }
            }
        })
    }
}

#[tokio::test]
async fn controlling_happy_path_selects_exactly_once() {
    let (agent, mut events) = IceAgent::spawn(test_config(IceRole::Controlling));
    agent.run().await.unwrap();
    let _creds = local_credentials(&mut events).await;

    let peer = FakePeer::bind().await;
    agent.set_remote_credentials(&peer.ufrag, &peer.pwd).await.unwrap();
    let sdp = peer.host_candidate_sdp();
    agent.add_remote_candidate(&sdp).await.unwrap();
    // Feeding the same candidate twice must not change the outcome.
    agent.add_remote_candidate(&sdp).await.unwrap();

    let peer_addr = peer.addr();
    peer.serve();

    wait_for(&mut events, |e| matches!(e, IceEvent::Connected)).await;
    let selected = wait_for(&mut events, |e| matches!(e, IceEvent::SelectedPair(_))).await;
    match selected {
        IceEvent::SelectedPair(pair) => {
            assert_eq!(pair.remote.addr, peer_addr);
            assert_eq!(pair.local.candidate_type, CandidateType::Host);
        }
        _ => unreachable!(),
    }

    // Exactly one selection.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let extra = drain(&mut events);
    assert!(
        !extra.iter().any(|e| matches!(e, IceEvent::SelectedPair(_))),
        "selection must not change: {:?}",
        extra
    );

    let stats = agent.stats().await.unwrap();
    assert!(stats.selected_pair.is_some());
    assert!(stats.pairs_succeeded >= 1);
    agent.close();
}

#[tokio::test]
async fn controlled_defers_nomination_until_own_check_succeeds() {
    let (agent, mut events) = IceAgent::spawn(test_config(IceRole::Controlled));
    agent.run().await.unwrap();
    let (agent_ufrag, agent_pwd) = local_credentials(&mut events).await;

    let agent_addr = match wait_for(&mut events, |e| matches!(e, IceEvent::NewCandidate { .. })).await
    {
        IceEvent::NewCandidate { candidate } => {
            let parsed = ice_agent::Candidate::unmarshal(&candidate).unwrap();
            parsed.addr
        }
        _ => unreachable!(),
    };

    let peer = FakePeer::bind().await;
    agent.set_remote_credentials(&peer.ufrag, &peer.pwd).await.unwrap();

    // Nomination request arrives before any pair has succeeded. The agent
    // learns the peer address itself as a prflx remote candidate.
    peer.send_check(agent_addr, &agent_ufrag, &agent_pwd, true, 99, true)
        .await;

    // The agent answers and schedules its own check; leave it unanswered.
    let (_first, _) = peer.recv_request().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let early = drain(&mut events);
    assert!(
        !early.iter().any(|e| matches!(e, IceEvent::SelectedPair(_))),
        "must not select before the pair's own check succeeds"
    );

    // Answer the next (re)transmission; now the pair succeeds and the
    // deferred nomination completes immediately.
    let (request, src) = peer.recv_request().await;
    peer.respond_success(&request, src, None).await;

    wait_for(&mut events, |e| matches!(e, IceEvent::Connected)).await;
    wait_for(&mut events, |e| matches!(e, IceEvent::SelectedPair(_))).await;
    agent.close();
}

#[tokio::test]
async fn peer_reflexive_local_candidate_is_discovered() {
    let (agent, mut events) = IceAgent::spawn(test_config(IceRole::Controlling));
    agent.run().await.unwrap();
    let _creds = local_credentials(&mut events).await;

    let peer = FakePeer::bind().await;
    agent.set_remote_credentials(&peer.ufrag, &peer.pwd).await.unwrap();
    agent.add_remote_candidate(&peer.host_candidate_sdp()).await.unwrap();

    // The "NAT" rewrites our source: the peer reports a mapped address that
    // is not any local candidate.
    let mapped: SocketAddr = "198.51.100.7:40001".parse().unwrap();
    tokio::spawn(async move {
        loop {
            let (request, src) = peer.recv_request().await;
            peer.respond_success(&request, src, Some(mapped)).await;
        }
    });

    let prflx = wait_for(&mut events, |e| {
        matches!(e, IceEvent::NewCandidate { candidate } if candidate.contains("prflx"))
    })
    .await;
    match prflx {
        IceEvent::NewCandidate { candidate } => {
            let parsed = ice_agent::Candidate::unmarshal(&candidate).unwrap();
            assert_eq!(parsed.addr, mapped);
            assert_eq!(parsed.candidate_type, CandidateType::PeerReflexive);
        }
        _ => unreachable!(),
    }

    wait_for(&mut events, |e| matches!(e, IceEvent::Connected)).await;

    // Nomination lands on the discovered valid pair.
    let selected = wait_for(&mut events, |e| matches!(e, IceEvent::SelectedPair(_))).await;
    match selected {
        IceEvent::SelectedPair(pair) => {
            assert_eq!(pair.local.candidate_type, CandidateType::PeerReflexive);
            assert_eq!(pair.local.addr, mapped);
        }
        _ => unreachable!(),
    }
    agent.close();
}

#[tokio::test]
async fn asymmetric_response_fails_the_pair() {
    let (agent, mut events) = IceAgent::spawn(test_config(IceRole::Controlling));
    agent.run().await.unwrap();
    let _creds = local_credentials(&mut events).await;

    let peer = FakePeer::bind().await;
    agent.set_remote_credentials(&peer.ufrag, &peer.pwd).await.unwrap();
    agent.add_remote_candidate(&peer.host_candidate_sdp()).await.unwrap();
    agent.end_of_candidates().await.unwrap();

    // Answer from a different source address: valid credentials, wrong
    // 4-tuple.
    let rogue = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (request, src) = peer.recv_request().await;
    let mut response = Message::binding_success(request.transaction_id);
    response.add_attribute(Attribute::XorMappedAddress(src));
    let payload = response.encode(Some(peer.pwd.as_bytes()), true).unwrap();
    rogue.send_to(&payload, src).await.unwrap();

    // The lone pair fails; with end-of-candidates seen, the agent gives up.
    let failed = wait_for(&mut events, |e| {
        matches!(e, IceEvent::Failed | IceEvent::Connected)
    })
    .await;
    assert!(matches!(failed, IceEvent::Failed), "pair must not validate");
    agent.close();
}

#[tokio::test]
async fn end_of_candidates_without_pairs_fails() {
    let (agent, mut events) = IceAgent::spawn(test_config(IceRole::Controlling));
    agent.run().await.unwrap();
    let _creds = local_credentials(&mut events).await;

    agent.set_remote_credentials("u", "p").await.unwrap();
    agent.end_of_candidates().await.unwrap();

    wait_for(&mut events, |e| matches!(e, IceEvent::Failed)).await;

    let stats = agent.stats().await.unwrap();
    assert_eq!(stats.state, ice_agent::AgentState::Failed);
    agent.close();
}

#[tokio::test]
async fn role_conflict_switches_the_loser() {
    let (agent, mut events) = IceAgent::spawn(test_config(IceRole::Controlled));
    agent.run().await.unwrap();
    let (agent_ufrag, agent_pwd) = local_credentials(&mut events).await;

    let agent_addr = match wait_for(&mut events, |e| matches!(e, IceEvent::NewCandidate { .. })).await
    {
        IceEvent::NewCandidate { candidate } => {
            ice_agent::Candidate::unmarshal(&candidate).unwrap().addr
        }
        _ => unreachable!(),
    };

    let peer = FakePeer::bind().await;
    agent.set_remote_credentials(&peer.ufrag, &peer.pwd).await.unwrap();

    // Both sides claim the controlled role; our tie-breaker of 0 always
    // loses, so the agent must switch to controlling.
    peer.send_check(agent_addr, &agent_ufrag, &agent_pwd, false, 0, false)
        .await;

    let peer_addr = peer.addr();
    peer.serve();

    wait_for(&mut events, |e| matches!(e, IceEvent::SelectedPair(_))).await;

    let stats = agent.stats().await.unwrap();
    assert_eq!(stats.role_conflicts, 1);
    assert_eq!(stats.role, IceRole::Controlling);
    let selected = agent.selected_pair().await.unwrap().unwrap();
    assert_eq!(selected.remote.addr, peer_addr);
    agent.close();
}

#[tokio::test]
async fn srflx_gathering_through_fake_stun_server() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let mapped: SocketAddr = "203.0.113.5:7000".parse().unwrap();

    tokio::spawn(async move {
        loop {
            let mut buf = [0u8; 1500];
            let Ok((n, src)) = server.recv_from(&mut buf).await else { return };
            let Ok(msg) = Message::decode(&buf[..n]) else { continue };
            if msg.message_type == MessageType::BindingRequest {
                let mut response = Message::binding_success(msg.transaction_id);
                response.add_attribute(Attribute::XorMappedAddress(mapped));
                let payload = response.encode(None, false).unwrap();
                let _ = server.send_to(&payload, src).await;
            }
        }
    });

    let mut config = test_config(IceRole::Controlling);
    config.stun_servers.push(server_addr);
    let (agent, mut events) = IceAgent::spawn(config);
    agent.run().await.unwrap();

    let srflx = wait_for(&mut events, |e| {
        matches!(e, IceEvent::NewCandidate { candidate } if candidate.contains("srflx"))
    })
    .await;
    match srflx {
        IceEvent::NewCandidate { candidate } => {
            assert!(candidate.contains("raddr"));
            let parsed = ice_agent::Candidate::unmarshal(&candidate).unwrap();
            assert_eq!(parsed.addr, mapped);
        }
        _ => unreachable!(),
    }

    wait_for(&mut events, |e| matches!(e, IceEvent::GatheringComplete)).await;
    agent.close();
}
