//! Interactive Connectivity Establishment (ICE) agent core, RFC 8445.
//!
//! This crate implements the heart of an ICE agent for a single UDP data
//! component: candidate representation and pairing, the priority-ordered
//! checklist with pruning and foundation-based freezing, authenticated STUN
//! connectivity checks with retransmission, peer-reflexive candidate
//! discovery, role-conflict resolution, and regular nomination.
//!
//! Out of scope, by design: TURN relay allocation, aggressive nomination,
//! multi-component streams, and the signalling channel that carries
//! candidates between peers (the embedding application owns it).
//!
//! # Overview
//!
//! ```text
//! signalling               IceAgent (actor task)                    peer
//!     │   add_remote_candidate   │                                   │
//!     ├──────────────────────────►  pair formation → CheckList       │
//!     │                          │       │ Ta tick (50 ms)           │
//!     │                          │       ▼                           │
//!     │                          │  CheckEngine ──binding request───►│
//!     │                          │       ▲                           │
//!     │      IceEvent stream     │       └──────response/request─────┤
//!     ◄──────────────────────────┤  valid pairs → nomination →       │
//!     │                          │  selected pair                    │
//! ```
//!
//! The agent is an actor: one spawned task owns every piece of mutable
//! state, fed by a mailbox carrying API calls, inbound datagrams and timer
//! ticks. See [`IceAgent::spawn`].
//!
//! # Example
//!
//! ```no_run
//! use ice_agent::{IceAgent, IceConfig, IceEvent, IceRole};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IceConfig::new(IceRole::Controlling)
//!     .with_stun_uris(&["stun:stun.l.google.com:19302"]);
//! let (agent, mut events) = IceAgent::spawn(config);
//!
//! agent.run().await?;
//! agent.set_remote_credentials("peerufrag", "peerpassword").await?;
//! agent.add_remote_candidate("abcd 1 udp 2130706431 192.0.2.7 50000 typ host").await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         IceEvent::SelectedPair(pair) => {
//!             println!("using {} -> {}", pair.local, pair.remote);
//!             break;
//!         }
//!         IceEvent::Failed => return Err("no path".into()),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod candidate;
pub mod check_list;
pub mod config;
pub mod conn_check;
pub mod error;
pub mod foundation;
pub mod gathering;
pub mod pair;
pub mod priority;
pub mod stun;
pub mod transport;

pub use agent::{AgentState, IceAgent, IceEvent, IceStats, SelectedPair};
pub use candidate::{Candidate, CandidateType, SocketId};
pub use check_list::CheckList;
pub use config::{IceConfig, IceRole, IpFilter};
pub use conn_check::{CheckEngine, IceCredentials};
pub use error::{IceError, IceResult, StunError};
pub use pair::{CandidatePair, PairId, PairState};
pub use priority::{candidate_priority, pair_priority};
