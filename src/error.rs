// src/error.rs
//! Error types for the ICE agent.

use std::io;
use thiserror::Error;

/// Result type for ICE operations.
pub type IceResult<T> = Result<T, IceError>;

/// Main ICE error type.
#[derive(Error, Debug)]
pub enum IceError {
    /// STUN codec errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Network I/O errors
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Candidate parsing errors
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// The agent mailbox is gone (agent closed or crashed)
    #[error("agent is closed")]
    AgentClosed,
}

/// STUN-specific error types. Authentication failures are not errors at
/// this level: unauthenticated datagrams are dropped silently by the
/// handlers, so the verify functions in [`crate::stun::auth`] return plain
/// booleans.
#[derive(Error, Debug)]
pub enum StunError {
    /// Invalid magic cookie in STUN message
    #[error("invalid magic cookie: 0x{0:08X}")]
    InvalidMagicCookie(u32),

    /// Message shorter than the fixed header or truncated attributes
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Invalid address family in an address attribute
    #[error("invalid address family: {0}")]
    InvalidAddressFamily(u8),

    /// Unknown or unsupported message type
    #[error("unsupported message type: 0x{0:04X}")]
    UnsupportedMessageType(u16),
}
