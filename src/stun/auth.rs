// src/stun/auth.rs
//! Short-term-credential authentication for STUN messages (RFC 5389).
//!
//! MESSAGE-INTEGRITY is an HMAC-SHA1 over the message up to (but not
//! including) the MESSAGE-INTEGRITY attribute, with the header length field
//! adjusted to end just after that attribute. FINGERPRINT is the CRC-32 of
//! everything before the FINGERPRINT attribute, XOR'd with a fixed constant.
//!
//! Verification works on raw datagram bytes so a message can be checked
//! before any further decoding happens.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::message::{AttributeType, HEADER_SIZE};

/// XOR constant applied to the CRC-32 in FINGERPRINT (RFC 5389 Section 15.5).
pub const FINGERPRINT_XOR: u32 = 0x5354_554e;

/// Size of the HMAC-SHA1 output carried in MESSAGE-INTEGRITY.
pub const INTEGRITY_SIZE: usize = 20;

/// Size of a FINGERPRINT attribute on the wire (type + length + value).
pub const FINGERPRINT_ATTR_SIZE: usize = 8;

/// Size of a MESSAGE-INTEGRITY attribute on the wire (type + length + value).
pub const INTEGRITY_ATTR_SIZE: usize = 4 + INTEGRITY_SIZE;

type HmacSha1 = Hmac<Sha1>;

/// Compute the HMAC-SHA1 message integrity over already-adjusted input.
pub fn message_integrity(data: &[u8], key: &[u8]) -> [u8; INTEGRITY_SIZE] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; INTEGRITY_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Compute the FINGERPRINT value for a message prefix.
pub fn fingerprint(data: &[u8]) -> u32 {
    crc32fast::hash(data) ^ FINGERPRINT_XOR
}

/// Verify the MESSAGE-INTEGRITY attribute of a raw STUN datagram against a
/// short-term-credential key. Returns false when the attribute is absent.
pub fn verify_message_integrity(raw: &[u8], key: &[u8]) -> bool {
    let Some(offset) = find_attribute(raw, AttributeType::MessageIntegrity.value()) else {
        return false;
    };

    let value_start = offset + 4;
    if raw.len() < value_start + INTEGRITY_SIZE {
        return false;
    }

    // Input is everything before the attribute, with the length field
    // rewritten to end just past the MESSAGE-INTEGRITY attribute. This
    // strips a trailing FINGERPRINT from the covered length.
    let mut input = raw[..offset].to_vec();
    let adjusted_len = (offset + INTEGRITY_ATTR_SIZE - HEADER_SIZE) as u16;
    input[2..4].copy_from_slice(&adjusted_len.to_be_bytes());

    let expected = message_integrity(&input, key);
    constant_time_eq(&expected, &raw[value_start..value_start + INTEGRITY_SIZE])
}

/// Verify the FINGERPRINT attribute of a raw STUN datagram. Returns false
/// when the attribute is absent or not last.
pub fn verify_fingerprint(raw: &[u8]) -> bool {
    let Some(offset) = find_attribute(raw, AttributeType::Fingerprint.value()) else {
        return false;
    };

    // FINGERPRINT must be the final attribute.
    if raw.len() != offset + FINGERPRINT_ATTR_SIZE {
        return false;
    }

    let stored = u32::from_be_bytes([raw[offset + 4], raw[offset + 5], raw[offset + 6], raw[offset + 7]]);
    fingerprint(&raw[..offset]) == stored
}

/// Locate the byte offset of an attribute header within a raw message.
fn find_attribute(raw: &[u8], attr_type: u16) -> Option<usize> {
    if raw.len() < HEADER_SIZE {
        return None;
    }

    let mut pos = HEADER_SIZE;
    while pos + 4 <= raw.len() {
        let typ = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
        let len = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]) as usize;
        if typ == attr_type {
            return Some(pos);
        }
        // Advance past value and its 4-byte-alignment padding.
        pos += 4 + len + ((4 - len % 4) % 4);
    }
    None
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
