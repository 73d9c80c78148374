// src/stun/mod.rs
//! STUN codec (RFC 5389) with the ICE extension attributes (RFC 8445).
//!
//! This is the wire collaborator of the agent: message encoding/decoding,
//! short-term-credential MESSAGE-INTEGRITY and FINGERPRINT handling. It
//! knows nothing about candidates, pairs, or checklists.

pub mod auth;
pub mod message;

pub use auth::{fingerprint, message_integrity, verify_fingerprint, verify_message_integrity};
pub use message::{
    is_stun_datagram, Attribute, AttributeType, Message, MessageType, TransactionId,
    ERROR_ROLE_CONFLICT, HEADER_SIZE, MAGIC_COOKIE,
};
