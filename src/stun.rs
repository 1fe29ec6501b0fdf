//! STUN (RFC 5389) message codec, extended with the ICE (RFC 5245) connectivity-check
//! attributes and a small set of custom attributes/methods for the RUDP channel-open
//! handshake.
//!
//! Grounded in `nyx-transport::stun`'s `StunMessage`/`encode`/`decode` shape (the
//! `bytes`/`BufMut`/`thiserror` idiom), extended with `PRIORITY`, `USE-CANDIDATE`,
//! `ICE-CONTROLLING`, `ICE-CONTROLLED`, `FINGERPRINT` and the `ERROR-CODE` classes
//! this spec needs, learned from `mycrl-turn-rs/stun`'s attribute and CRC-32
//! fingerprint handling (`util::fingerprint`, `crc` crate).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

/// STUN/ICE/RUDP codec errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    #[error("message parse error: {0}")]
    ParseError(String),
    #[error("message build error: {0}")]
    BuildError(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
    #[error("unsupported address family")]
    UnsupportedAddressFamily,
}

pub type StunResult<T> = Result<T, StunError>;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const FINGERPRINT_XOR: u32 = 0x5354_554e;

/// STUN message method × class (RFC 5389 §6), plus the custom RUDP channel methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    BindingRequest = 0x0001,
    BindingResponse = 0x0101,
    BindingErrorResponse = 0x0111,
    BindingIndication = 0x0011,

    /// RUDP channel-open request/response/error (custom method, non-standard class bits
    /// reused from the unallocated 0x7E?? range so as not to collide with RFC 5389/5766).
    ChannelOpenRequest = 0x7E01,
    ChannelOpenResponse = 0x7E02,
    ChannelOpenErrorResponse = 0x7E03,

    ChannelRefreshRequest = 0x7E11,
    ChannelRefreshResponse = 0x7E12,
    ChannelRefreshErrorResponse = 0x7E13,

    ChannelCloseRequest = 0x7E21,
    ChannelCloseResponse = 0x7E22,
    ChannelCloseErrorResponse = 0x7E23,
}

impl MessageType {
    fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0001 => Self::BindingRequest,
            0x0101 => Self::BindingResponse,
            0x0111 => Self::BindingErrorResponse,
            0x0011 => Self::BindingIndication,
            0x7E01 => Self::ChannelOpenRequest,
            0x7E02 => Self::ChannelOpenResponse,
            0x7E03 => Self::ChannelOpenErrorResponse,
            0x7E11 => Self::ChannelRefreshRequest,
            0x7E12 => Self::ChannelRefreshResponse,
            0x7E13 => Self::ChannelRefreshErrorResponse,
            0x7E21 => Self::ChannelCloseRequest,
            0x7E22 => Self::ChannelCloseResponse,
            0x7E23 => Self::ChannelCloseErrorResponse,
            _ => return None,
        })
    }

    /// True for request messages, which demand a response or error.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::BindingRequest
                | Self::ChannelOpenRequest
                | Self::ChannelRefreshRequest
                | Self::ChannelCloseRequest
        )
    }

    /// True for *ErrorResponse variants.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::BindingErrorResponse
                | Self::ChannelOpenErrorResponse
                | Self::ChannelRefreshErrorResponse
                | Self::ChannelCloseErrorResponse
        )
    }
}

/// STUN/ICE/RUDP attribute types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AttributeType {
    // RFC 5389
    MappedAddress = 0x0001,
    Username = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorMappedAddress = 0x0020,
    Software = 0x8022,
    Fingerprint = 0x8028,

    // RFC 5245 ICE
    Priority = 0x0024,
    UseCandidate = 0x0025,
    IceControlled = 0x8029,
    IceControlling = 0x802A,

    // Custom RUDP channel-open attributes (private-use range, RFC 5389 §18.2)
    ChannelNumber = 0xC001,
    SequenceNumber = 0xC002,
    MinimumRtt = 0xC003,
    Lifetime = 0xC004,
    ChannelInfo = 0xC005,
}

impl AttributeType {
    fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0001 => Self::MappedAddress,
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x0014 => Self::Realm,
            0x0015 => Self::Nonce,
            0x0020 => Self::XorMappedAddress,
            0x8022 => Self::Software,
            0x8028 => Self::Fingerprint,
            0x0024 => Self::Priority,
            0x0025 => Self::UseCandidate,
            0x8029 => Self::IceControlled,
            0x802A => Self::IceControlling,
            0xC001 => Self::ChannelNumber,
            0xC002 => Self::SequenceNumber,
            0xC003 => Self::MinimumRtt,
            0xC004 => Self::Lifetime,
            0xC005 => Self::ChannelInfo,
            _ => return None,
        })
    }
}

/// `ERROR-CODE` classes this spec surfaces (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    RoleConflict,
}

impl ErrorCode {
    fn code_and_reason(self) -> (u16, &'static str) {
        match self {
            ErrorCode::BadRequest => (400, "Bad Request"),
            ErrorCode::Unauthorized => (401, "Unauthorized"),
            ErrorCode::RoleConflict => (487, "Role Conflict"),
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            400 => Some(ErrorCode::BadRequest),
            401 => Some(ErrorCode::Unauthorized),
            487 => Some(ErrorCode::RoleConflict),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StunHeader {
    pub message_type: MessageType,
    pub transaction_id: [u8; 12],
}

#[derive(Debug, Clone)]
struct StunAttribute {
    attr_type: u16,
    value: Bytes,
}

/// A parsed or to-be-serialized STUN message.
#[derive(Debug, Clone)]
pub struct StunMessage {
    pub header: StunHeader,
    attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// New message with a fresh random 96-bit transaction id (spec §4.4).
    pub fn new(message_type: MessageType) -> Self {
        let mut transaction_id = [0u8; 12];
        for byte in &mut transaction_id {
            *byte = rand::random();
        }
        Self {
            header: StunHeader {
                message_type,
                transaction_id,
            },
            attributes: Vec::new(),
        }
    }

    /// Builds a response/error sharing the request's transaction id, as RFC 5389 requires.
    pub fn reply(&self, message_type: MessageType) -> Self {
        Self {
            header: StunHeader {
                message_type,
                transaction_id: self.header.transaction_id,
            },
            attributes: Vec::new(),
        }
    }

    fn add_attribute(&mut self, attr_type: AttributeType, value: Bytes) {
        self.attributes.push(StunAttribute {
            attr_type: attr_type as u16,
            value,
        });
    }

    fn get_raw(&self, attr_type: AttributeType) -> Option<&Bytes> {
        let want = attr_type as u16;
        self.attributes.iter().find(|a| a.attr_type == want).map(|a| &a.value)
    }

    pub fn has_attribute(&self, attr_type: AttributeType) -> bool {
        self.get_raw(attr_type).is_some()
    }

    // -- USERNAME / credentials -----------------------------------------------------

    pub fn add_username(&mut self, username: &str) {
        self.add_attribute(AttributeType::Username, Bytes::copy_from_slice(username.as_bytes()));
    }

    pub fn get_username(&self) -> Option<String> {
        self.get_raw(AttributeType::Username)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn add_realm(&mut self, realm: &str) {
        self.add_attribute(AttributeType::Realm, Bytes::copy_from_slice(realm.as_bytes()));
    }

    pub fn get_realm(&self) -> Option<String> {
        self.get_raw(AttributeType::Realm).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn add_nonce(&mut self, nonce: &str) {
        self.add_attribute(AttributeType::Nonce, Bytes::copy_from_slice(nonce.as_bytes()));
    }

    pub fn get_nonce(&self) -> Option<String> {
        self.get_raw(AttributeType::Nonce).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    // -- ICE attributes (spec §4.2.2) ------------------------------------------------

    pub fn add_priority(&mut self, priority: u32) {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(priority);
        self.add_attribute(AttributeType::Priority, buf.freeze());
    }

    pub fn get_priority(&self) -> StunResult<Option<u32>> {
        match self.get_raw(AttributeType::Priority) {
            Some(v) if v.len() == 4 => Ok(Some(u32::from_be_bytes(v[..4].try_into().unwrap_or_default()))),
            Some(_) => Err(StunError::InvalidAttribute("PRIORITY length".into())),
            None => Ok(None),
        }
    }

    pub fn add_use_candidate(&mut self) {
        self.add_attribute(AttributeType::UseCandidate, Bytes::new());
    }

    pub fn has_use_candidate(&self) -> bool {
        self.has_attribute(AttributeType::UseCandidate)
    }

    pub fn add_ice_controlling(&mut self, conflict_resolver: u64) {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(conflict_resolver);
        self.add_attribute(AttributeType::IceControlling, buf.freeze());
    }

    pub fn get_ice_controlling(&self) -> StunResult<Option<u64>> {
        self.get_qword(AttributeType::IceControlling)
    }

    pub fn add_ice_controlled(&mut self, conflict_resolver: u64) {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(conflict_resolver);
        self.add_attribute(AttributeType::IceControlled, buf.freeze());
    }

    pub fn get_ice_controlled(&self) -> StunResult<Option<u64>> {
        self.get_qword(AttributeType::IceControlled)
    }

    fn get_qword(&self, attr_type: AttributeType) -> StunResult<Option<u64>> {
        match self.get_raw(attr_type) {
            Some(v) if v.len() == 8 => Ok(Some(u64::from_be_bytes(v[..8].try_into().unwrap_or_default()))),
            Some(_) => Err(StunError::InvalidAttribute("64-bit attribute length".into())),
            None => Ok(None),
        }
    }

    // -- XOR-MAPPED-ADDRESS -----------------------------------------------------------

    pub fn add_xor_mapped_address(&mut self, addr: SocketAddr) {
        let value = encode_xor_address(addr, &self.header.transaction_id);
        self.add_attribute(AttributeType::XorMappedAddress, value);
    }

    pub fn get_xor_mapped_address(&self) -> StunResult<Option<SocketAddr>> {
        match self.get_raw(AttributeType::XorMappedAddress) {
            Some(v) => decode_xor_address(v, &self.header.transaction_id).map(Some),
            None => Ok(None),
        }
    }

    // -- ERROR-CODE ---------------------------------------------------------------

    pub fn add_error_code(&mut self, code: ErrorCode) {
        let (numeric, reason) = code.code_and_reason();
        let class = (numeric / 100) as u8;
        let number = (numeric % 100) as u8;
        let mut buf = BytesMut::with_capacity(4 + reason.len());
        buf.put_u16(0); // reserved
        buf.put_u8(class);
        buf.put_u8(number);
        buf.put_slice(reason.as_bytes());
        self.add_attribute(AttributeType::ErrorCode, buf.freeze());
    }

    pub fn get_error_code(&self) -> StunResult<Option<ErrorCode>> {
        match self.get_raw(AttributeType::ErrorCode) {
            Some(v) if v.len() >= 4 => {
                let numeric = (v[2] as u16) * 100 + v[3] as u16;
                Ok(ErrorCode::from_code(numeric))
            }
            Some(_) => Err(StunError::InvalidAttribute("ERROR-CODE length".into())),
            None => Ok(None),
        }
    }

    // -- RUDP channel-open attributes (spec §4.3.1) ---------------------------------

    pub fn add_channel_number(&mut self, channel: u16) {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u16(channel);
        self.add_attribute(AttributeType::ChannelNumber, buf.freeze());
    }

    pub fn get_channel_number(&self) -> StunResult<Option<u16>> {
        match self.get_raw(AttributeType::ChannelNumber) {
            Some(v) if v.len() == 2 => Ok(Some(u16::from_be_bytes(v[..2].try_into().unwrap_or_default()))),
            Some(_) => Err(StunError::InvalidAttribute("CHANNEL-NUMBER length".into())),
            None => Ok(None),
        }
    }

    pub fn add_sequence_number(&mut self, seq: u64) {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(seq);
        self.add_attribute(AttributeType::SequenceNumber, buf.freeze());
    }

    pub fn get_sequence_number(&self) -> StunResult<Option<u64>> {
        self.get_qword(AttributeType::SequenceNumber)
    }

    pub fn add_minimum_rtt(&mut self, millis: u32) {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(millis);
        self.add_attribute(AttributeType::MinimumRtt, buf.freeze());
    }

    pub fn get_minimum_rtt(&self) -> StunResult<Option<u32>> {
        match self.get_raw(AttributeType::MinimumRtt) {
            Some(v) if v.len() == 4 => Ok(Some(u32::from_be_bytes(v[..4].try_into().unwrap_or_default()))),
            Some(_) => Err(StunError::InvalidAttribute("MINIMUM-RTT length".into())),
            None => Ok(None),
        }
    }

    pub fn add_lifetime(&mut self, seconds: u32) {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(seconds);
        self.add_attribute(AttributeType::Lifetime, buf.freeze());
    }

    pub fn get_lifetime(&self) -> StunResult<Option<u32>> {
        match self.get_raw(AttributeType::Lifetime) {
            Some(v) if v.len() == 4 => Ok(Some(u32::from_be_bytes(v[..4].try_into().unwrap_or_default()))),
            Some(_) => Err(StunError::InvalidAttribute("LIFETIME length".into())),
            None => Ok(None),
        }
    }

    pub fn add_channel_info(&mut self, info: &str) {
        self.add_attribute(AttributeType::ChannelInfo, Bytes::copy_from_slice(info.as_bytes()));
    }

    pub fn get_channel_info(&self) -> Option<String> {
        self.get_raw(AttributeType::ChannelInfo)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    // -- wire format ------------------------------------------------------------------

    /// Serializes the message. `MESSAGE-INTEGRITY` and `FINGERPRINT`, if present, must
    /// already have been added last (integrity before fingerprint, per RFC 5389 §15.4).
    pub fn encode(&self) -> StunResult<Bytes> {
        let mut buf = BytesMut::with_capacity(256);
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_into(&self, buf: &mut BytesMut) -> StunResult<()> {
        buf.put_u16(self.header.message_type as u16);
        let attrs_len: usize = self
            .attributes
            .iter()
            .map(|a| 4 + align_to_4(a.value.len()))
            .sum();
        buf.put_u16(attrs_len as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.header.transaction_id);

        for attr in &self.attributes {
            buf.put_u16(attr.attr_type);
            buf.put_u16(attr.value.len() as u16);
            buf.put_slice(&attr.value);
            let padding = align_to_4(attr.value.len()) - attr.value.len();
            buf.put_bytes(0, padding);
        }
        Ok(())
    }

    /// Parses a message from raw bytes.
    pub fn decode(data: &[u8]) -> StunResult<Self> {
        if data.len() < 20 {
            return Err(StunError::ParseError("message too short".into()));
        }

        let mut cursor = data;
        let msg_type_raw = cursor.get_u16();
        let message_type = MessageType::from_u16(msg_type_raw)
            .ok_or_else(|| StunError::ParseError(format!("unknown message type: {msg_type_raw:#06x}")))?;

        let length = cursor.get_u16();
        let magic = cursor.get_u32();
        if magic != MAGIC_COOKIE {
            return Err(StunError::ParseError("invalid magic cookie".into()));
        }

        let mut transaction_id = [0u8; 12];
        cursor.copy_to_slice(&mut transaction_id);

        let mut attributes = Vec::new();
        let mut remaining = length as usize;
        while remaining > 0 {
            if cursor.len() < 4 {
                break;
            }
            let attr_type = cursor.get_u16();
            let attr_len = cursor.get_u16() as usize;
            if cursor.len() < attr_len {
                return Err(StunError::ParseError("truncated attribute".into()));
            }
            let value = Bytes::copy_from_slice(&cursor[..attr_len]);
            cursor.advance(attr_len);

            let padding = align_to_4(attr_len) - attr_len;
            if cursor.len() < padding {
                return Err(StunError::ParseError("truncated attribute padding".into()));
            }
            cursor.advance(padding);

            attributes.push(StunAttribute { attr_type, value });
            remaining = remaining.saturating_sub(4 + attr_len + padding);
        }

        Ok(Self {
            header: StunHeader {
                message_type,
                transaction_id,
            },
            attributes,
        })
    }

    /// Unrecognized attribute types, in wire order; used to know whether to answer
    /// with `ERROR-CODE 420 Unknown Attribute` (not currently surfaced by spec §6,
    /// kept available for callers that want stricter validation).
    pub fn unknown_attribute_types(&self) -> Vec<u16> {
        self.attributes
            .iter()
            .filter(|a| AttributeType::from_u16(a.attr_type).is_none())
            .map(|a| a.attr_type)
            .collect()
    }

    /// Adds `MESSAGE-INTEGRITY` (HMAC-SHA1 short-term credential, spec §4.4/§6).
    ///
    /// Per RFC 5389 §15.4, the integrity covers the message as if its length field
    /// already included this attribute (but not FINGERPRINT, which must come after).
    pub fn add_message_integrity(&mut self, password: &str) -> StunResult<()> {
        let mac_len = 20u16;
        let mut buf = BytesMut::with_capacity(256);
        self.encode_into_with_extra_length(&mut buf, 4 + mac_len)?;

        type HmacSha1 = Hmac<Sha1>;
        let mut mac = HmacSha1::new_from_slice(password.as_bytes())
            .map_err(|e| StunError::AuthenticationFailed(e.to_string()))?;
        mac.update(&buf);
        let integrity = mac.finalize().into_bytes();

        self.add_attribute(AttributeType::MessageIntegrity, Bytes::copy_from_slice(&integrity[..]));
        Ok(())
    }

    /// Verifies `MESSAGE-INTEGRITY` against `password`. Per spec §4.4/§8 ("integrity
    /// gate"), callers must not mutate pair/channel state on a `false` result except
    /// to send the appropriate error response.
    pub fn verify_message_integrity(&self, password: &str) -> StunResult<bool> {
        let integrity = self
            .get_raw(AttributeType::MessageIntegrity)
            .ok_or_else(|| StunError::AuthenticationFailed("no MESSAGE-INTEGRITY attribute".into()))?
            .clone();

        let mut without_integrity = self.clone();
        without_integrity
            .attributes
            .retain(|a| a.attr_type != AttributeType::MessageIntegrity as u16 && a.attr_type != AttributeType::Fingerprint as u16);

        let mut buf = BytesMut::with_capacity(256);
        without_integrity.encode_into_with_extra_length(&mut buf, 4 + integrity.len() as u16)?;

        type HmacSha1 = Hmac<Sha1>;
        let mut mac = HmacSha1::new_from_slice(password.as_bytes())
            .map_err(|e| StunError::AuthenticationFailed(e.to_string()))?;
        mac.update(&buf);

        Ok(mac.verify_slice(&integrity).is_ok())
    }

    fn encode_into_with_extra_length(&self, buf: &mut BytesMut, extra: u16) -> StunResult<()> {
        buf.put_u16(self.header.message_type as u16);
        let attrs_len: usize = self
            .attributes
            .iter()
            .map(|a| 4 + align_to_4(a.value.len()))
            .sum();
        buf.put_u16(attrs_len as u16 + extra);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.header.transaction_id);

        for attr in &self.attributes {
            buf.put_u16(attr.attr_type);
            buf.put_u16(attr.value.len() as u16);
            buf.put_slice(&attr.value);
            let padding = align_to_4(attr.value.len()) - attr.value.len();
            buf.put_bytes(0, padding);
        }
        Ok(())
    }

    /// Adds `FINGERPRINT` (CRC-32, XORed per RFC 5389 §15.5). Must be the last
    /// attribute added.
    pub fn add_fingerprint(&mut self) -> StunResult<()> {
        let mut buf = BytesMut::with_capacity(256);
        self.encode_into_with_extra_length(&mut buf, 8)?;
        let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&buf) ^ FINGERPRINT_XOR;
        let mut value = BytesMut::with_capacity(4);
        value.put_u32(crc);
        self.add_attribute(AttributeType::Fingerprint, value.freeze());
        Ok(())
    }

    /// Verifies a trailing `FINGERPRINT` attribute against the message bytes preceding it.
    pub fn verify_fingerprint(&self) -> StunResult<bool> {
        let stored = match self.get_raw(AttributeType::Fingerprint) {
            Some(v) if v.len() == 4 => u32::from_be_bytes(v[..4].try_into().unwrap_or_default()),
            Some(_) => return Err(StunError::InvalidAttribute("FINGERPRINT length".into())),
            None => return Ok(false),
        };

        let mut without_fp = self.clone();
        without_fp.attributes.retain(|a| a.attr_type != AttributeType::Fingerprint as u16);
        let mut buf = BytesMut::with_capacity(256);
        without_fp.encode_into_with_extra_length(&mut buf, 8)?;
        let computed = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&buf) ^ FINGERPRINT_XOR;

        Ok(computed == stored)
    }
}

/// Cheap classification of an inbound datagram as STUN vs. opaque data, the
/// way the socket layer (spec §1, out of scope here) is expected to dispatch
/// before handing bytes to [`crate::ice::IceSession`]: a STUN message's first
/// two bits are zero and bytes 4..8 carry the magic cookie (RFC 5389 §6).
pub fn looks_like_stun(data: &[u8]) -> bool {
    data.len() >= 20 && (data[0] & 0xC0) == 0 && data[4..8] == MAGIC_COOKIE.to_be_bytes()
}

fn align_to_4(value: usize) -> usize {
    (value + 3) & !3
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Bytes {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u8(0);
    match addr {
        SocketAddr::V4(_) => buf.put_u8(0x01),
        SocketAddr::V6(_) => buf.put_u8(0x02),
    }
    let xor_port = addr.port() ^ ((MAGIC_COOKIE >> 16) as u16);
    buf.put_u16(xor_port);

    match addr.ip() {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            let magic_bytes = MAGIC_COOKIE.to_be_bytes();
            for i in 0..4 {
                buf.put_u8(octets[i] ^ magic_bytes[i]);
            }
        }
        IpAddr::V6(ip) => {
            let octets = ip.octets();
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);
            for i in 0..16 {
                buf.put_u8(octets[i] ^ xor_key[i]);
            }
        }
    }
    buf.freeze()
}

fn decode_xor_address(data: &[u8], transaction_id: &[u8; 12]) -> StunResult<SocketAddr> {
    if data.len() < 4 {
        return Err(StunError::ParseError("XOR address too short".into()));
    }
    let mut cursor = data;
    cursor.advance(1);
    let family = cursor[0];
    cursor.advance(1);
    let xor_port = cursor.get_u16();
    let port = xor_port ^ ((MAGIC_COOKIE >> 16) as u16);

    match family {
        0x01 => {
            if cursor.len() < 4 {
                return Err(StunError::ParseError("IPv4 address truncated".into()));
            }
            let magic_bytes = MAGIC_COOKIE.to_be_bytes();
            let mut octets = [0u8; 4];
            for i in 0..4 {
                octets[i] = cursor[i] ^ magic_bytes[i];
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            if cursor.len() < 16 {
                return Err(StunError::ParseError("IPv6 address truncated".into()));
            }
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = cursor[i] ^ xor_key[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(StunError::UnsupportedAddressFamily),
    }
}
