// src/stun/message.rs
//! STUN message wire codec (RFC 5389) with the ICE attribute set (RFC 8445).
//!
//! Only the Binding method is supported; that is all ICE connectivity checks
//! and server-reflexive gathering ever send. Integrity and fingerprint
//! verification live in [`super::auth`] and operate on raw datagram bytes.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

use super::auth;
use crate::error::StunError;

/// STUN magic cookie (RFC 5389 Section 6).
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size.
pub const HEADER_SIZE: usize = 20;

/// STUN error code for an ICE role conflict (RFC 8445 Section 7.3.1.1).
pub const ERROR_ROLE_CONFLICT: u16 = 487;

/// STUN message types for the Binding method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    BindingRequest = 0x0001,
    BindingIndication = 0x0011,
    BindingSuccess = 0x0101,
    BindingError = 0x0111,
}

impl MessageType {
    pub fn value(&self) -> u16 {
        *self as u16
    }

    pub fn from_value(value: u16) -> Result<Self, StunError> {
        match value {
            0x0001 => Ok(Self::BindingRequest),
            0x0011 => Ok(Self::BindingIndication),
            0x0101 => Ok(Self::BindingSuccess),
            0x0111 => Ok(Self::BindingError),
            other => Err(StunError::UnsupportedMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BindingRequest => "Binding Request",
            Self::BindingIndication => "Binding Indication",
            Self::BindingSuccess => "Binding Success",
            Self::BindingError => "Binding Error",
        };
        write!(f, "{}", name)
    }
}

/// STUN transaction ID (96 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a new random transaction ID.
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// STUN attribute types used by ICE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Username,
    MessageIntegrity,
    ErrorCode,
    XorMappedAddress,
    Priority,
    UseCandidate,
    Fingerprint,
    IceControlled,
    IceControlling,
    Unknown(u16),
}

impl AttributeType {
    pub fn value(&self) -> u16 {
        match self {
            Self::Username => 0x0006,
            Self::MessageIntegrity => 0x0008,
            Self::ErrorCode => 0x0009,
            Self::XorMappedAddress => 0x0020,
            Self::Priority => 0x0024,
            Self::UseCandidate => 0x0025,
            Self::Fingerprint => 0x8028,
            Self::IceControlled => 0x8029,
            Self::IceControlling => 0x802A,
            Self::Unknown(value) => *value,
        }
    }

    pub fn from_value(value: u16) -> Self {
        match value {
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x0020 => Self::XorMappedAddress,
            0x0024 => Self::Priority,
            0x0025 => Self::UseCandidate,
            0x8028 => Self::Fingerprint,
            0x8029 => Self::IceControlled,
            0x802A => Self::IceControlling,
            other => Self::Unknown(other),
        }
    }
}

/// Decoded STUN attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Username(String),
    MessageIntegrity(Vec<u8>),
    ErrorCode { code: u16, reason: String },
    XorMappedAddress(SocketAddr),
    Priority(u32),
    UseCandidate,
    Fingerprint(u32),
    IceControlled(u64),
    IceControlling(u64),
    Unknown { attr_type: u16, value: Vec<u8> },
}

impl Attribute {
    fn attr_type(&self) -> AttributeType {
        match self {
            Self::Username(_) => AttributeType::Username,
            Self::MessageIntegrity(_) => AttributeType::MessageIntegrity,
            Self::ErrorCode { .. } => AttributeType::ErrorCode,
            Self::XorMappedAddress(_) => AttributeType::XorMappedAddress,
            Self::Priority(_) => AttributeType::Priority,
            Self::UseCandidate => AttributeType::UseCandidate,
            Self::Fingerprint(_) => AttributeType::Fingerprint,
            Self::IceControlled(_) => AttributeType::IceControlled,
            Self::IceControlling(_) => AttributeType::IceControlling,
            Self::Unknown { attr_type, .. } => AttributeType::Unknown(*attr_type),
        }
    }

    fn encode(&self, buf: &mut BytesMut, tid: &TransactionId) {
        buf.put_u16(self.attr_type().value());
        let len_pos = buf.len();
        buf.put_u16(0); // length placeholder
        let value_start = buf.len();

        match self {
            Self::Username(username) => buf.put_slice(username.as_bytes()),
            Self::MessageIntegrity(mac) => buf.put_slice(mac),
            Self::ErrorCode { code, reason } => {
                buf.put_u16(0);
                buf.put_u8((code / 100) as u8);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            Self::XorMappedAddress(addr) => encode_xor_address(buf, addr, tid),
            Self::Priority(priority) => buf.put_u32(*priority),
            Self::UseCandidate => {}
            Self::Fingerprint(fp) => buf.put_u32(*fp),
            Self::IceControlled(tb) | Self::IceControlling(tb) => buf.put_u64(*tb),
            Self::Unknown { value, .. } => buf.put_slice(value),
        }

        let value_len = buf.len() - value_start;
        buf[len_pos..len_pos + 2].copy_from_slice(&(value_len as u16).to_be_bytes());

        let padding = (4 - value_len % 4) % 4;
        for _ in 0..padding {
            buf.put_u8(0);
        }
    }

    fn decode(
        attr_type: AttributeType,
        value: &[u8],
        tid: &TransactionId,
    ) -> Result<Self, StunError> {
        let attr = match attr_type {
            AttributeType::Username => Self::Username(
                String::from_utf8(value.to_vec())
                    .map_err(|_| StunError::Malformed("USERNAME is not UTF-8".into()))?,
            ),
            AttributeType::MessageIntegrity => {
                if value.len() != auth::INTEGRITY_SIZE {
                    return Err(StunError::Malformed("bad MESSAGE-INTEGRITY length".into()));
                }
                Self::MessageIntegrity(value.to_vec())
            }
            AttributeType::ErrorCode => {
                if value.len() < 4 {
                    return Err(StunError::Malformed("ERROR-CODE too short".into()));
                }
                let code = (value[2] as u16) * 100 + (value[3] as u16);
                let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                Self::ErrorCode { code, reason }
            }
            AttributeType::XorMappedAddress => {
                Self::XorMappedAddress(decode_xor_address(value, tid)?)
            }
            AttributeType::Priority => {
                if value.len() != 4 {
                    return Err(StunError::Malformed("bad PRIORITY length".into()));
                }
                Self::Priority(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
            }
            AttributeType::UseCandidate => Self::UseCandidate,
            AttributeType::Fingerprint => {
                if value.len() != 4 {
                    return Err(StunError::Malformed("bad FINGERPRINT length".into()));
                }
                Self::Fingerprint(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
            }
            AttributeType::IceControlled | AttributeType::IceControlling => {
                if value.len() != 8 {
                    return Err(StunError::Malformed("bad role attribute length".into()));
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(value);
                let tb = u64::from_be_bytes(bytes);
                if attr_type == AttributeType::IceControlled {
                    Self::IceControlled(tb)
                } else {
                    Self::IceControlling(tb)
                }
            }
            AttributeType::Unknown(raw) => Self::Unknown {
                attr_type: raw,
                value: value.to_vec(),
            },
        };
        Ok(attr)
    }
}

fn encode_xor_address(buf: &mut BytesMut, addr: &SocketAddr, tid: &TransactionId) {
    buf.put_u8(0);
    let xor_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_u16(xor_port);
            let xored = u32::from_be_bytes(ip.octets()) ^ MAGIC_COOKIE;
            buf.put_u32(xored);
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x02);
            buf.put_u16(xor_port);
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            key[4..].copy_from_slice(tid.as_bytes());
            let octets = ip.octets();
            for i in 0..16 {
                buf.put_u8(octets[i] ^ key[i]);
            }
        }
    }
}

fn decode_xor_address(value: &[u8], tid: &TransactionId) -> Result<SocketAddr, StunError> {
    if value.len() < 8 {
        return Err(StunError::Malformed("address attribute too short".into()));
    }

    let family = value[1];
    let xor_port = u16::from_be_bytes([value[2], value[3]]);
    let port = xor_port ^ (MAGIC_COOKIE >> 16) as u16;

    match family {
        0x01 => {
            let raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            let ip = Ipv4Addr::from(raw ^ MAGIC_COOKIE);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(StunError::Malformed("IPv6 address attribute too short".into()));
            }
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            key[4..].copy_from_slice(tid.as_bytes());
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ key[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(StunError::InvalidAddressFamily(other)),
    }
}

/// A decoded (or under-construction) STUN message.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl Message {
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn binding_request(tid: TransactionId) -> Self {
        Self::new(MessageType::BindingRequest, tid)
    }

    pub fn binding_success(tid: TransactionId) -> Self {
        Self::new(MessageType::BindingSuccess, tid)
    }

    pub fn binding_error(tid: TransactionId) -> Self {
        Self::new(MessageType::BindingError, tid)
    }

    pub fn binding_indication(tid: TransactionId) -> Self {
        Self::new(MessageType::BindingIndication, tid)
    }

    pub fn add_attribute(&mut self, attribute: Attribute) -> &mut Self {
        self.attributes.push(attribute);
        self
    }

    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Username(u) => Some(u.as_str()),
            _ => None,
        })
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn priority(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Priority(p) => Some(*p),
            _ => None,
        })
    }

    pub fn has_use_candidate(&self) -> bool {
        self.attributes.iter().any(|a| matches!(a, Attribute::UseCandidate))
    }

    pub fn ice_controlling(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::IceControlling(tb) => Some(*tb),
            _ => None,
        })
    }

    pub fn ice_controlled(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::IceControlled(tb) => Some(*tb),
            _ => None,
        })
    }

    pub fn error_code(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode { code, .. } => Some(*code),
            _ => None,
        })
    }

    /// Encode to wire form, optionally appending MESSAGE-INTEGRITY (computed
    /// with `integrity_key`) and FINGERPRINT, in that order.
    pub fn encode(&self, integrity_key: Option<&[u8]>, add_fingerprint: bool) -> Result<Bytes, StunError> {
        let mut buf = BytesMut::with_capacity(128);

        buf.put_u16(self.message_type.value());
        buf.put_u16(0); // length, fixed up below
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attribute in &self.attributes {
            attribute.encode(&mut buf, &self.transaction_id);
        }

        set_length(&mut buf);

        if let Some(key) = integrity_key {
            // Length covers the about-to-be-appended attribute.
            bump_length(&mut buf, auth::INTEGRITY_ATTR_SIZE as u16);
            let mac = auth::message_integrity(&buf, key);
            Attribute::MessageIntegrity(mac.to_vec()).encode(&mut buf, &self.transaction_id);
        }

        if add_fingerprint {
            bump_length(&mut buf, auth::FINGERPRINT_ATTR_SIZE as u16);
            let fp = auth::fingerprint(&buf);
            Attribute::Fingerprint(fp).encode(&mut buf, &self.transaction_id);
        }

        Ok(buf.freeze())
    }

    /// Decode a message from raw bytes. Integrity and fingerprint are *not*
    /// checked here; callers verify them against the raw datagram via
    /// [`super::auth`] before trusting the message.
    pub fn decode(raw: &[u8]) -> Result<Self, StunError> {
        if raw.len() < HEADER_SIZE {
            return Err(StunError::Malformed(format!(
                "message too short: {} bytes",
                raw.len()
            )));
        }

        let message_type = MessageType::from_value(u16::from_be_bytes([raw[0], raw[1]]))?;
        let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;

        let cookie = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(cookie));
        }

        if raw.len() != HEADER_SIZE + length {
            return Err(StunError::Malformed(format!(
                "length field {} disagrees with datagram size {}",
                length,
                raw.len()
            )));
        }

        let mut tid_bytes = [0u8; 12];
        tid_bytes.copy_from_slice(&raw[8..20]);
        let transaction_id = TransactionId::from_bytes(tid_bytes);

        let mut attributes = Vec::new();
        let mut body = &raw[HEADER_SIZE..];
        while body.remaining() >= 4 {
            let attr_type = AttributeType::from_value(body.get_u16());
            let attr_len = body.get_u16() as usize;
            if body.remaining() < attr_len {
                return Err(StunError::Malformed("truncated attribute".into()));
            }
            let value = body[..attr_len].to_vec();
            body.advance(attr_len);
            attributes.push(Attribute::decode(attr_type, &value, &transaction_id)?);

            let padding = (4 - attr_len % 4) % 4;
            if body.remaining() < padding {
                break;
            }
            body.advance(padding);
        }

        Ok(Self {
            message_type,
            transaction_id,
            attributes,
        })
    }
}

/// Cheap demux test: does this datagram look like STUN? (First two bits
/// zero, magic cookie present, length consistent.)
pub fn is_stun_datagram(raw: &[u8]) -> bool {
    raw.len() >= HEADER_SIZE
        && raw[0] & 0xC0 == 0
        && u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) == MAGIC_COOKIE
        && u16::from_be_bytes([raw[2], raw[3]]) as usize == raw.len() - HEADER_SIZE
}

fn set_length(buf: &mut BytesMut) {
    let len = (buf.len() - HEADER_SIZE) as u16;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
}

fn bump_length(buf: &mut BytesMut, extra: u16) {
    let len = (buf.len() - HEADER_SIZE) as u16 + extra;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for mt in [
            MessageType::BindingRequest,
            MessageType::BindingIndication,
            MessageType::BindingSuccess,
            MessageType::BindingError,
        ] {
            assert_eq!(MessageType::from_value(mt.value()).unwrap(), mt);
        }
        assert!(MessageType::from_value(0x0003).is_err());
    }

    #[test]
    fn test_transaction_id_unique() {
        assert_ne!(TransactionId::new().as_bytes(), TransactionId::new().as_bytes());
    }

    #[test]
    fn test_encode_decode_plain_request() {
        let tid = TransactionId::new();
        let mut msg = Message::binding_request(tid);
        msg.add_attribute(Attribute::Priority(0x6e00_1eff));
        msg.add_attribute(Attribute::Username("remote:local".into()));
        msg.add_attribute(Attribute::IceControlling(42));
        msg.add_attribute(Attribute::UseCandidate);

        let encoded = msg.encode(None, false).unwrap();
        assert!(is_stun_datagram(&encoded));

        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded.message_type, MessageType::BindingRequest);
        assert_eq!(decoded.transaction_id, tid);
        assert_eq!(decoded.priority(), Some(0x6e00_1eff));
        assert_eq!(decoded.username(), Some("remote:local"));
        assert_eq!(decoded.ice_controlling(), Some(42));
        assert!(decoded.has_use_candidate());
    }

    #[test]
    fn test_xor_mapped_address_v4() {
        let tid = TransactionId::new();
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let mut msg = Message::binding_success(tid);
        msg.add_attribute(Attribute::XorMappedAddress(addr));

        let decoded = Message::decode(&msg.encode(None, false).unwrap()).unwrap();
        assert_eq!(decoded.xor_mapped_address(), Some(addr));
    }

    #[test]
    fn test_xor_mapped_address_v6() {
        let tid = TransactionId::new();
        let addr: SocketAddr = "[2001:db8::1]:32853".parse().unwrap();
        let mut msg = Message::binding_success(tid);
        msg.add_attribute(Attribute::XorMappedAddress(addr));

        let decoded = Message::decode(&msg.encode(None, false).unwrap()).unwrap();
        assert_eq!(decoded.xor_mapped_address(), Some(addr));
    }

    #[test]
    fn test_error_code_roundtrip() {
        let tid = TransactionId::new();
        let mut msg = Message::binding_error(tid);
        msg.add_attribute(Attribute::ErrorCode {
            code: ERROR_ROLE_CONFLICT,
            reason: "Role Conflict".into(),
        });

        let decoded = Message::decode(&msg.encode(None, false).unwrap()).unwrap();
        assert_eq!(decoded.error_code(), Some(487));
    }

    #[test]
    fn test_decode_rejects_bad_cookie() {
        let msg = Message::binding_request(TransactionId::new());
        let mut raw = msg.encode(None, false).unwrap().to_vec();
        raw[4] = 0xff;
        assert!(matches!(
            Message::decode(&raw),
            Err(StunError::InvalidMagicCookie(_))
        ));
        assert!(!is_stun_datagram(&raw));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let msg = Message::binding_request(TransactionId::new());
        let raw = msg.encode(None, true).unwrap();
        assert!(Message::decode(&raw[..raw.len() - 3]).is_err());
    }

    #[test]
    fn test_unknown_attribute_preserved() {
        let tid = TransactionId::new();
        let mut msg = Message::binding_request(tid);
        msg.add_attribute(Attribute::Unknown {
            attr_type: 0x8022, // SOFTWARE
            value: b"test agent".to_vec(),
        });

        let decoded = Message::decode(&msg.encode(None, false).unwrap()).unwrap();
        assert!(matches!(
            decoded.attributes[0],
            Attribute::Unknown { attr_type: 0x8022, .. }
        ));
    }
}
