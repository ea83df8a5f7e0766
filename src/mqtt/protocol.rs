//! MQTT 3.1 / 3.1.1 / 5 framing.
//!
//! [`decode_frame`] works on whatever the read loop has buffered so far: it returns `Ok(None)`
//! until a complete packet is available, then the frame and the number of bytes it consumed.
//! [`encode_frame`] appends one packet to an output buffer. Both directions are implemented so
//! the same codec serves the broker and test clients.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("unsupported protocol level {0}")]
    UnsupportedProtocol(u8),
    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("unexpected packet type {0}")]
    UnexpectedPacket(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ProtocolVersion {
    V3_1,
    V3_1_1,
    V5,
}

impl ProtocolVersion {
    pub fn level(self) -> u8 {
        match self {
            ProtocolVersion::V3_1 => 3,
            ProtocolVersion::V3_1_1 => 4,
            ProtocolVersion::V5 => 5,
        }
    }

    fn protocol_name(self) -> &'static str {
        match self {
            ProtocolVersion::V3_1 => "MQIsdp",
            ProtocolVersion::V3_1_1 | ProtocolVersion::V5 => "MQTT",
        }
    }

    pub fn is_v5(self) -> bool {
        matches!(self, ProtocolVersion::V5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    fn from_bits(bits: u8) -> Result<Self, CodecError> {
        match bits {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            _ => Err(CodecError::Malformed("invalid QoS")),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub max_packet_size: Option<u32>,
    pub topic_alias_max: Option<u16>,
    pub user_properties: Vec<(String, String)>,
}

/// Will message carried by CONNECT. Parsed so the rest of the packet can be read; never published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol: ProtocolVersion,
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_start: bool,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub properties: ConnectProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnAckProperties {
    pub server_keep_alive: Option<u16>,
    pub max_packet_size: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    /// Wire value; see [`map_reason`].
    pub reason: u8,
    pub properties: ConnAckProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub packet_id: Option<u16>,
    pub dup: bool,
    pub retain: bool,
    pub subscription_identifier: Option<u32>,
}

/// PUBACK, PUBREC, PUBREL and PUBCOMP share one layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub packet_id: u16,
    pub reason: u8,
}

impl Ack {
    pub fn success(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason: ReasonCodes::SUCCESS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub filter: String,
    pub qos: Qos,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

impl SubscriptionRequest {
    pub fn new(filter: impl Into<String>, qos: Qos) -> Self {
        Self {
            filter: filter.into(),
            qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<SubscriptionRequest>,
    pub subscription_identifier: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAckPacket {
    pub packet_id: u16,
    /// One code per filter; only written for MQTT 5.
    pub reason_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectPacket {
    pub reason: u8,
    pub reason_string: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect(ConnectPacket),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect(DisconnectPacket),
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Connect(_) => "CONNECT",
            Frame::ConnAck(_) => "CONNACK",
            Frame::Publish(_) => "PUBLISH",
            Frame::PubAck(_) => "PUBACK",
            Frame::PubRec(_) => "PUBREC",
            Frame::PubRel(_) => "PUBREL",
            Frame::PubComp(_) => "PUBCOMP",
            Frame::Subscribe(_) => "SUBSCRIBE",
            Frame::SubAck(_) => "SUBACK",
            Frame::Unsubscribe(_) => "UNSUBSCRIBE",
            Frame::UnsubAck(_) => "UNSUBACK",
            Frame::PingReq => "PINGREQ",
            Frame::PingResp => "PINGRESP",
            Frame::Disconnect(_) => "DISCONNECT",
        }
    }
}

/// Broker-side outcome, translated per protocol version by [`map_reason`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalCode {
    Success,
    UnsupportedProtocol,
    IdentifierRejected,
    BadCredentials,
    NotAuthorized,
    ServerUnavailable,
    ProtocolError,
    MalformedPacket,
    PacketTooLarge,
    KeepAliveTimeout,
    ServerShuttingDown,
    TopicInvalid,
    QuotaExceeded,
    NoSubscriptionExisted,
}

pub struct ReasonCodes;

impl ReasonCodes {
    pub const SUCCESS: u8 = 0x00;
    pub const NO_SUBSCRIPTION_EXISTED: u8 = 0x11;
    pub const UNSPECIFIED: u8 = 0x80;
    pub const MALFORMED_PACKET: u8 = 0x81;
    pub const PROTOCOL_ERROR: u8 = 0x82;
    pub const UNSUPPORTED_PROTOCOL_VERSION: u8 = 0x84;
    pub const CLIENT_ID_NOT_VALID: u8 = 0x85;
    pub const BAD_USERNAME_OR_PASSWORD: u8 = 0x86;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const SERVER_UNAVAILABLE: u8 = 0x88;
    pub const SERVER_SHUTTING_DOWN: u8 = 0x8B;
    pub const KEEP_ALIVE_TIMEOUT: u8 = 0x8D;
    pub const TOPIC_FILTER_INVALID: u8 = 0x8F;
    pub const PACKET_TOO_LARGE: u8 = 0x95;
    pub const QUOTA_EXCEEDED: u8 = 0x97;
}

/// Legacy CONNACK return codes used by 3.1 and 3.1.1.
pub struct LegacyConnAck;

impl LegacyConnAck {
    pub const ACCEPTED: u8 = 0x00;
    pub const UNACCEPTABLE_PROTOCOL: u8 = 0x01;
    pub const IDENTIFIER_REJECTED: u8 = 0x02;
    pub const SERVER_UNAVAILABLE: u8 = 0x03;
    pub const BAD_USERNAME_OR_PASSWORD: u8 = 0x04;
    pub const NOT_AUTHORIZED: u8 = 0x05;
}

/// SUBACK failure marker shared by every protocol version below 5.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Map internal outcomes to MQTT reason codes, downgrading to CONNACK return codes for 3.1/3.1.1.
pub fn map_reason(proto: ProtocolVersion, code: InternalCode) -> u8 {
    match proto {
        ProtocolVersion::V5 => match code {
            InternalCode::Success => ReasonCodes::SUCCESS,
            InternalCode::UnsupportedProtocol => ReasonCodes::UNSUPPORTED_PROTOCOL_VERSION,
            InternalCode::IdentifierRejected => ReasonCodes::CLIENT_ID_NOT_VALID,
            InternalCode::BadCredentials => ReasonCodes::BAD_USERNAME_OR_PASSWORD,
            InternalCode::NotAuthorized => ReasonCodes::NOT_AUTHORIZED,
            InternalCode::ServerUnavailable => ReasonCodes::SERVER_UNAVAILABLE,
            InternalCode::ProtocolError => ReasonCodes::PROTOCOL_ERROR,
            InternalCode::MalformedPacket => ReasonCodes::MALFORMED_PACKET,
            InternalCode::PacketTooLarge => ReasonCodes::PACKET_TOO_LARGE,
            InternalCode::KeepAliveTimeout => ReasonCodes::KEEP_ALIVE_TIMEOUT,
            InternalCode::ServerShuttingDown => ReasonCodes::SERVER_SHUTTING_DOWN,
            InternalCode::TopicInvalid => ReasonCodes::TOPIC_FILTER_INVALID,
            InternalCode::QuotaExceeded => ReasonCodes::QUOTA_EXCEEDED,
            InternalCode::NoSubscriptionExisted => ReasonCodes::NO_SUBSCRIPTION_EXISTED,
        },
        ProtocolVersion::V3_1 | ProtocolVersion::V3_1_1 => match code {
            InternalCode::Success | InternalCode::NoSubscriptionExisted => LegacyConnAck::ACCEPTED,
            InternalCode::UnsupportedProtocol => LegacyConnAck::UNACCEPTABLE_PROTOCOL,
            InternalCode::IdentifierRejected => LegacyConnAck::IDENTIFIER_REJECTED,
            InternalCode::BadCredentials => LegacyConnAck::BAD_USERNAME_OR_PASSWORD,
            InternalCode::NotAuthorized => LegacyConnAck::NOT_AUTHORIZED,
            _ => LegacyConnAck::SERVER_UNAVAILABLE,
        },
    }
}

/// Try to decode one packet from the front of `buf`.
///
/// `version` is `None` until CONNECT has been seen; in that state only CONNECT is accepted.
/// The remaining length is checked against `max_payload` as soon as the fixed header is
/// complete, before the body has arrived.
pub fn decode_frame(
    buf: &[u8],
    version: Option<ProtocolVersion>,
    max_payload: usize,
) -> Result<Option<(Frame, usize)>, CodecError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let Some((remaining, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };
    if remaining > max_payload {
        return Err(CodecError::PayloadTooLarge {
            size: remaining,
            max: max_payload,
        });
    }
    let header_len = 1 + len_bytes;
    let total = header_len + remaining;
    if buf.len() < total {
        return Ok(None);
    }
    let body = &buf[header_len..total];
    let packet_type = first >> 4;
    let flags = first & 0x0F;

    let frame = match (version, packet_type) {
        (None, 1) => Frame::Connect(parse_connect(body)?),
        (None, other) => return Err(CodecError::UnexpectedPacket(other)),
        (Some(_), 1) => return Err(CodecError::UnexpectedPacket(1)),
        (Some(proto), _) => parse_packet(packet_type, flags, body, proto)?,
    };
    Ok(Some((frame, total)))
}

fn parse_packet(
    packet_type: u8,
    flags: u8,
    body: &[u8],
    proto: ProtocolVersion,
) -> Result<Frame, CodecError> {
    let frame = match packet_type {
        2 => Frame::ConnAck(parse_connack(body, proto)?),
        3 => Frame::Publish(parse_publish(flags, body, proto)?),
        4 => Frame::PubAck(parse_ack(body, proto)?),
        5 => Frame::PubRec(parse_ack(body, proto)?),
        6 => {
            expect_flags(flags, 0b0010)?;
            Frame::PubRel(parse_ack(body, proto)?)
        }
        7 => Frame::PubComp(parse_ack(body, proto)?),
        8 => {
            expect_flags(flags, 0b0010)?;
            Frame::Subscribe(parse_subscribe(body, proto)?)
        }
        9 => Frame::SubAck(parse_suback(body, proto)?),
        10 => {
            expect_flags(flags, 0b0010)?;
            Frame::Unsubscribe(parse_unsubscribe(body, proto)?)
        }
        11 => Frame::UnsubAck(parse_unsuback(body, proto)?),
        12 => Frame::PingReq,
        13 => Frame::PingResp,
        14 => Frame::Disconnect(parse_disconnect(body, proto)?),
        other => return Err(CodecError::UnexpectedPacket(other)),
    };
    Ok(frame)
}

fn expect_flags(flags: u8, expected: u8) -> Result<(), CodecError> {
    if flags != expected {
        return Err(CodecError::Malformed("reserved header flags"));
    }
    Ok(())
}

fn parse_connect(buf: &[u8]) -> Result<ConnectPacket, CodecError> {
    let mut cursor = 0usize;
    let proto_name = read_string(buf, &mut cursor)?;
    let proto_level = read_u8(buf, &mut cursor)?;
    let protocol = match proto_level {
        3 => ProtocolVersion::V3_1,
        4 => ProtocolVersion::V3_1_1,
        5 => ProtocolVersion::V5,
        other => return Err(CodecError::UnsupportedProtocol(other)),
    };
    if proto_name != protocol.protocol_name() {
        return Err(CodecError::UnsupportedProtocol(proto_level));
    }
    let connect_flags = read_u8(buf, &mut cursor)?;
    if connect_flags & 0x01 != 0 {
        return Err(CodecError::Malformed("reserved connect flag set"));
    }
    let keep_alive = read_u16(buf, &mut cursor)?;

    let properties = if protocol.is_v5() {
        parse_connect_properties(buf, &mut cursor)?
    } else {
        ConnectProperties::default()
    };

    let client_id = read_string(buf, &mut cursor)?;
    let clean_start = (connect_flags & 0x02) != 0;
    let will = if (connect_flags & 0x04) != 0 {
        if protocol.is_v5() {
            let props_len = read_varint(buf, &mut cursor)?;
            skip(buf, &mut cursor, props_len)?;
        }
        let topic = read_string(buf, &mut cursor)?;
        let payload = read_binary(buf, &mut cursor)?;
        Some(Will {
            topic,
            payload,
            qos: Qos::from_bits((connect_flags >> 3) & 0x03)?,
            retain: (connect_flags & 0x20) != 0,
        })
    } else {
        None
    };
    let username = if (connect_flags & 0x80) != 0 {
        Some(read_string(buf, &mut cursor)?)
    } else {
        None
    };
    let password = if (connect_flags & 0x40) != 0 {
        Some(read_binary(buf, &mut cursor)?)
    } else {
        None
    };

    Ok(ConnectPacket {
        protocol,
        client_id,
        keep_alive,
        clean_start,
        will,
        username,
        password,
        properties,
    })
}

fn parse_connect_properties(
    buf: &[u8],
    cursor: &mut usize,
) -> Result<ConnectProperties, CodecError> {
    let props_end = properties_end(buf, cursor)?;
    let mut props = ConnectProperties::default();
    while *cursor < props_end {
        match read_u8(buf, cursor)? {
            0x11 => props.session_expiry_interval = Some(read_u32(buf, cursor)?),
            0x21 => props.receive_maximum = Some(read_u16(buf, cursor)?),
            0x27 => props.max_packet_size = Some(read_u32(buf, cursor)?),
            0x22 => props.topic_alias_max = Some(read_u16(buf, cursor)?),
            0x17 | 0x19 => {
                let _ = read_u8(buf, cursor)?;
            }
            0x15 => {
                let _ = read_string(buf, cursor)?;
            }
            0x16 => {
                let _ = read_binary(buf, cursor)?;
            }
            0x26 => {
                let key = read_string(buf, cursor)?;
                let value = read_string(buf, cursor)?;
                props.user_properties.push((key, value));
            }
            _ => return Err(CodecError::Malformed("unknown CONNECT property")),
        }
    }
    finish_properties(*cursor, props_end)?;
    Ok(props)
}

fn parse_connack(buf: &[u8], proto: ProtocolVersion) -> Result<ConnAckPacket, CodecError> {
    let mut cursor = 0usize;
    let session_present = read_u8(buf, &mut cursor)? & 0x01 != 0;
    let reason = read_u8(buf, &mut cursor)?;
    let mut properties = ConnAckProperties::default();
    if proto.is_v5() && cursor < buf.len() {
        let props_end = properties_end(buf, &mut cursor)?;
        while cursor < props_end {
            match read_u8(buf, &mut cursor)? {
                0x13 => properties.server_keep_alive = Some(read_u16(buf, &mut cursor)?),
                0x27 => properties.max_packet_size = Some(read_u32(buf, &mut cursor)?),
                0x12 => {
                    properties.assigned_client_identifier = Some(read_string(buf, &mut cursor)?)
                }
                0x1F => properties.reason_string = Some(read_string(buf, &mut cursor)?),
                0x26 => {
                    let key = read_string(buf, &mut cursor)?;
                    let value = read_string(buf, &mut cursor)?;
                    properties.user_properties.push((key, value));
                }
                0x11 => {
                    let _ = read_u32(buf, &mut cursor)?;
                }
                0x21 | 0x22 => {
                    let _ = read_u16(buf, &mut cursor)?;
                }
                0x24 | 0x25 | 0x28 | 0x29 | 0x2A => {
                    let _ = read_u8(buf, &mut cursor)?;
                }
                _ => return Err(CodecError::Malformed("unknown CONNACK property")),
            }
        }
        finish_properties(cursor, props_end)?;
    }
    Ok(ConnAckPacket {
        session_present,
        reason,
        properties,
    })
}

fn parse_publish(
    flags: u8,
    buf: &[u8],
    proto: ProtocolVersion,
) -> Result<PublishPacket, CodecError> {
    let dup = (flags & 0b0000_1000) != 0;
    let retain = (flags & 0b0000_0001) != 0;
    let qos = Qos::from_bits((flags & 0b0000_0110) >> 1)?;
    if matches!(qos, Qos::AtMostOnce) && dup {
        return Err(CodecError::Malformed("dup flag set for QoS 0 publish"));
    }
    let mut cursor = 0usize;
    let topic = read_string(buf, &mut cursor)?;
    let packet_id = match qos {
        Qos::AtMostOnce => None,
        _ => Some(read_u16(buf, &mut cursor)?),
    };
    let mut subscription_identifier = None;
    if proto.is_v5() {
        let props_end = properties_end(buf, &mut cursor)?;
        while cursor < props_end {
            match read_u8(buf, &mut cursor)? {
                0x0B => subscription_identifier = Some(read_varint(buf, &mut cursor)? as u32),
                0x01 => {
                    let _ = read_u8(buf, &mut cursor)?;
                }
                0x02 => {
                    let _ = read_u32(buf, &mut cursor)?;
                }
                0x23 => {
                    let _ = read_u16(buf, &mut cursor)?;
                }
                0x03 | 0x08 => {
                    let _ = read_string(buf, &mut cursor)?;
                }
                0x09 => {
                    let _ = read_binary(buf, &mut cursor)?;
                }
                0x26 => {
                    let _ = read_string(buf, &mut cursor)?;
                    let _ = read_string(buf, &mut cursor)?;
                }
                _ => return Err(CodecError::Malformed("unknown PUBLISH property")),
            }
        }
        finish_properties(cursor, props_end)?;
    }
    Ok(PublishPacket {
        topic,
        payload: Bytes::copy_from_slice(&buf[cursor..]),
        qos,
        packet_id,
        dup,
        retain,
        subscription_identifier,
    })
}

fn parse_ack(buf: &[u8], proto: ProtocolVersion) -> Result<Ack, CodecError> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    let reason = if proto.is_v5() && cursor < buf.len() {
        read_u8(buf, &mut cursor)?
    } else {
        ReasonCodes::SUCCESS
    };
    Ok(Ack { packet_id, reason })
}

fn parse_subscribe(buf: &[u8], proto: ProtocolVersion) -> Result<SubscribePacket, CodecError> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    let mut subscription_identifier = None;
    if proto.is_v5() {
        let props_end = properties_end(buf, &mut cursor)?;
        while cursor < props_end {
            match read_u8(buf, &mut cursor)? {
                0x0B => {
                    if subscription_identifier.is_some() {
                        return Err(CodecError::Malformed("duplicate subscription identifier"));
                    }
                    let id = read_varint(buf, &mut cursor)? as u32;
                    if id == 0 {
                        return Err(CodecError::Malformed("subscription identifier of 0"));
                    }
                    subscription_identifier = Some(id);
                }
                0x26 => {
                    let _ = read_string(buf, &mut cursor)?;
                    let _ = read_string(buf, &mut cursor)?;
                }
                _ => return Err(CodecError::Malformed("unknown SUBSCRIBE property")),
            }
        }
        finish_properties(cursor, props_end)?;
    }
    let mut filters = Vec::new();
    while cursor < buf.len() {
        let filter = read_string(buf, &mut cursor)?;
        let opts = read_u8(buf, &mut cursor)?;
        if opts & 0b1100_0000 != 0 {
            return Err(CodecError::Malformed("reserved subscription flags set"));
        }
        let retain_handling = (opts >> 4) & 0x03;
        if retain_handling > 2 {
            return Err(CodecError::Malformed("invalid retain handling"));
        }
        filters.push(SubscriptionRequest {
            filter,
            qos: Qos::from_bits(opts & 0x03)?,
            no_local: (opts & 0b0000_0100) != 0,
            retain_as_published: (opts & 0b0000_1000) != 0,
            retain_handling,
        });
    }
    if filters.is_empty() {
        return Err(CodecError::Malformed("SUBSCRIBE without filters"));
    }
    Ok(SubscribePacket {
        packet_id,
        filters,
        subscription_identifier,
    })
}

fn parse_suback(buf: &[u8], proto: ProtocolVersion) -> Result<SubAckPacket, CodecError> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    if proto.is_v5() {
        let props_len = read_varint(buf, &mut cursor)?;
        skip(buf, &mut cursor, props_len)?;
    }
    Ok(SubAckPacket {
        packet_id,
        return_codes: buf[cursor..].to_vec(),
    })
}

fn parse_unsubscribe(
    buf: &[u8],
    proto: ProtocolVersion,
) -> Result<UnsubscribePacket, CodecError> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    if proto.is_v5() {
        let props_len = read_varint(buf, &mut cursor)?;
        skip(buf, &mut cursor, props_len)?;
    }
    let mut filters = Vec::new();
    while cursor < buf.len() {
        filters.push(read_string(buf, &mut cursor)?);
    }
    if filters.is_empty() {
        return Err(CodecError::Malformed("UNSUBSCRIBE without filters"));
    }
    Ok(UnsubscribePacket { packet_id, filters })
}

fn parse_unsuback(buf: &[u8], proto: ProtocolVersion) -> Result<UnsubAckPacket, CodecError> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    let mut reason_codes = Vec::new();
    if proto.is_v5() {
        let props_len = read_varint(buf, &mut cursor)?;
        skip(buf, &mut cursor, props_len)?;
        reason_codes = buf[cursor..].to_vec();
    }
    Ok(UnsubAckPacket {
        packet_id,
        reason_codes,
    })
}

fn parse_disconnect(buf: &[u8], proto: ProtocolVersion) -> Result<DisconnectPacket, CodecError> {
    let mut cursor = 0usize;
    let mut reason = ReasonCodes::SUCCESS;
    let mut reason_string = None;
    if proto.is_v5() {
        if !buf.is_empty() {
            reason = read_u8(buf, &mut cursor)?;
        }
        if cursor < buf.len() {
            let props_end = properties_end(buf, &mut cursor)?;
            while cursor < props_end {
                match read_u8(buf, &mut cursor)? {
                    0x1F => reason_string = Some(read_string(buf, &mut cursor)?),
                    0x11 => {
                        let _ = read_u32(buf, &mut cursor)?;
                    }
                    0x1C => {
                        let _ = read_string(buf, &mut cursor)?;
                    }
                    0x26 => {
                        let _ = read_string(buf, &mut cursor)?;
                        let _ = read_string(buf, &mut cursor)?;
                    }
                    _ => return Err(CodecError::Malformed("unknown DISCONNECT property")),
                }
            }
            finish_properties(cursor, props_end)?;
        }
    }
    Ok(DisconnectPacket {
        reason,
        reason_string,
    })
}

/// Append `frame` to `out`, encoded for `proto`.
pub fn encode_frame(
    frame: &Frame,
    proto: ProtocolVersion,
    out: &mut BytesMut,
) -> Result<(), CodecError> {
    let mut body = BytesMut::new();
    let header = match frame {
        Frame::Connect(connect) => {
            encode_connect(connect, &mut body)?;
            0x10
        }
        Frame::ConnAck(connack) => {
            body.put_u8(u8::from(connack.session_present));
            body.put_u8(connack.reason);
            if proto.is_v5() {
                put_properties(&mut body, &encode_connack_properties(&connack.properties)?)?;
            }
            0x20
        }
        Frame::Publish(publish) => {
            put_string(&mut body, &publish.topic)?;
            if publish.qos != Qos::AtMostOnce {
                let id = publish
                    .packet_id
                    .ok_or(CodecError::Malformed("packet id required for QoS > 0"))?;
                body.put_u16(id);
            }
            if proto.is_v5() {
                let mut props = BytesMut::new();
                if let Some(id) = publish.subscription_identifier {
                    props.put_u8(0x0B);
                    put_varint(&mut props, id as usize)?;
                }
                put_properties(&mut body, &props)?;
            }
            body.extend_from_slice(&publish.payload);
            let dup = if publish.dup { 0x08 } else { 0x00 };
            0x30 | dup | (publish.qos.bits() << 1) | u8::from(publish.retain)
        }
        Frame::PubAck(ack) => {
            encode_ack(ack, proto, &mut body);
            0x40
        }
        Frame::PubRec(ack) => {
            encode_ack(ack, proto, &mut body);
            0x50
        }
        Frame::PubRel(ack) => {
            encode_ack(ack, proto, &mut body);
            0x62
        }
        Frame::PubComp(ack) => {
            encode_ack(ack, proto, &mut body);
            0x70
        }
        Frame::Subscribe(subscribe) => {
            body.put_u16(subscribe.packet_id);
            if proto.is_v5() {
                let mut props = BytesMut::new();
                if let Some(id) = subscribe.subscription_identifier {
                    props.put_u8(0x0B);
                    put_varint(&mut props, id as usize)?;
                }
                put_properties(&mut body, &props)?;
            }
            for request in &subscribe.filters {
                put_string(&mut body, &request.filter)?;
                let mut opts = request.qos.bits();
                if request.no_local {
                    opts |= 0b0000_0100;
                }
                if request.retain_as_published {
                    opts |= 0b0000_1000;
                }
                opts |= (request.retain_handling & 0x03) << 4;
                body.put_u8(opts);
            }
            0x82
        }
        Frame::SubAck(suback) => {
            body.put_u16(suback.packet_id);
            if proto.is_v5() {
                body.put_u8(0); // property length
            }
            body.extend_from_slice(&suback.return_codes);
            0x90
        }
        Frame::Unsubscribe(unsubscribe) => {
            body.put_u16(unsubscribe.packet_id);
            if proto.is_v5() {
                body.put_u8(0);
            }
            for filter in &unsubscribe.filters {
                put_string(&mut body, filter)?;
            }
            0xA2
        }
        Frame::UnsubAck(unsuback) => {
            body.put_u16(unsuback.packet_id);
            if proto.is_v5() {
                body.put_u8(0);
                body.extend_from_slice(&unsuback.reason_codes);
            }
            0xB0
        }
        Frame::PingReq => 0xC0,
        Frame::PingResp => 0xD0,
        Frame::Disconnect(disconnect) => {
            // 3.1/3.1.1 DISCONNECT has no variable header.
            if proto.is_v5() {
                body.put_u8(disconnect.reason);
                let mut props = BytesMut::new();
                if let Some(reason) = &disconnect.reason_string {
                    props.put_u8(0x1F);
                    put_string(&mut props, reason)?;
                }
                put_properties(&mut body, &props)?;
            }
            0xE0
        }
    };
    out.reserve(body.len() + 5);
    out.put_u8(header);
    put_varint(out, body.len())?;
    out.extend_from_slice(&body);
    Ok(())
}

fn encode_connect(connect: &ConnectPacket, body: &mut BytesMut) -> Result<(), CodecError> {
    let proto = connect.protocol;
    put_string(body, proto.protocol_name())?;
    body.put_u8(proto.level());
    let mut flags = 0u8;
    if connect.clean_start {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | (will.qos.bits() << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);
    if proto.is_v5() {
        let mut props = BytesMut::new();
        let p = &connect.properties;
        if let Some(expiry) = p.session_expiry_interval {
            props.put_u8(0x11);
            props.put_u32(expiry);
        }
        if let Some(receive_max) = p.receive_maximum {
            props.put_u8(0x21);
            props.put_u16(receive_max);
        }
        if let Some(max) = p.max_packet_size {
            props.put_u8(0x27);
            props.put_u32(max);
        }
        if let Some(alias_max) = p.topic_alias_max {
            props.put_u8(0x22);
            props.put_u16(alias_max);
        }
        put_user_properties(&mut props, &p.user_properties)?;
        put_properties(body, &props)?;
    }
    put_string(body, &connect.client_id)?;
    if let Some(will) = &connect.will {
        if proto.is_v5() {
            body.put_u8(0);
        }
        put_string(body, &will.topic)?;
        put_binary(body, &will.payload)?;
    }
    if let Some(username) = &connect.username {
        put_string(body, username)?;
    }
    if let Some(password) = &connect.password {
        put_binary(body, password)?;
    }
    Ok(())
}

fn encode_connack_properties(props: &ConnAckProperties) -> Result<BytesMut, CodecError> {
    let mut buf = BytesMut::new();
    if let Some(keep_alive) = props.server_keep_alive {
        buf.put_u8(0x13);
        buf.put_u16(keep_alive);
    }
    if let Some(max) = props.max_packet_size {
        buf.put_u8(0x27);
        buf.put_u32(max);
    }
    if let Some(assigned) = &props.assigned_client_identifier {
        buf.put_u8(0x12);
        put_string(&mut buf, assigned)?;
    }
    if let Some(reason) = &props.reason_string {
        buf.put_u8(0x1F);
        put_string(&mut buf, reason)?;
    }
    put_user_properties(&mut buf, &props.user_properties)?;
    Ok(buf)
}

fn encode_ack(ack: &Ack, proto: ProtocolVersion, body: &mut BytesMut) {
    body.put_u16(ack.packet_id);
    if proto.is_v5() {
        body.put_u8(ack.reason);
        body.put_u8(0); // property length
    }
}

fn put_user_properties(buf: &mut BytesMut, pairs: &[(String, String)]) -> Result<(), CodecError> {
    for (key, value) in pairs {
        buf.put_u8(0x26);
        put_string(buf, key)?;
        put_string(buf, value)?;
    }
    Ok(())
}

fn put_properties(body: &mut BytesMut, props: &[u8]) -> Result<(), CodecError> {
    put_varint(body, props.len())?;
    body.extend_from_slice(props);
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    put_binary(buf, value.as_bytes())
}

fn put_binary(buf: &mut BytesMut, value: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::Malformed("field too long"))?;
    buf.put_u16(len);
    buf.extend_from_slice(value);
    Ok(())
}

fn put_varint(buf: &mut BytesMut, mut len: usize) -> Result<(), CodecError> {
    if len > crate::config::MAX_PAYLOAD_LIMIT {
        return Err(CodecError::Malformed("remaining length overflow"));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// `Ok(None)` while the length bytes are still arriving; `(value, bytes used)` once complete.
fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    for (idx, byte) in buf.iter().take(4).enumerate() {
        value |= ((byte & 0x7F) as usize) << (7 * idx);
        if byte & 0x80 == 0 {
            return Ok(Some((value, idx + 1)));
        }
    }
    if buf.len() >= 4 {
        return Err(CodecError::Malformed("remaining length exceeds four bytes"));
    }
    Ok(None)
}

fn properties_end(buf: &[u8], cursor: &mut usize) -> Result<usize, CodecError> {
    let len = read_varint(buf, cursor)?;
    let end = cursor
        .checked_add(len)
        .ok_or(CodecError::Malformed("properties overflow"))?;
    if end > buf.len() {
        return Err(CodecError::Malformed("properties exceed packet"));
    }
    Ok(end)
}

fn finish_properties(cursor: usize, end: usize) -> Result<(), CodecError> {
    if cursor != end {
        return Err(CodecError::Malformed("properties length mismatch"));
    }
    Ok(())
}

fn skip(buf: &[u8], cursor: &mut usize, len: usize) -> Result<(), CodecError> {
    if *cursor + len > buf.len() {
        return Err(CodecError::Malformed("unexpected end of packet"));
    }
    *cursor += len;
    Ok(())
}

fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8, CodecError> {
    let v = *buf
        .get(*cursor)
        .ok_or(CodecError::Malformed("unexpected end of packet"))?;
    *cursor += 1;
    Ok(v)
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> Result<u16, CodecError> {
    let bytes = buf
        .get(*cursor..*cursor + 2)
        .ok_or(CodecError::Malformed("unexpected end of packet"))?;
    *cursor += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], cursor: &mut usize) -> Result<u32, CodecError> {
    let bytes = buf
        .get(*cursor..*cursor + 4)
        .ok_or(CodecError::Malformed("unexpected end of packet"))?;
    *cursor += 4;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String, CodecError> {
    let bytes = read_binary(buf, cursor)?;
    String::from_utf8(bytes).map_err(|_| CodecError::Malformed("invalid utf8 in mqtt string"))
}

fn read_binary(buf: &[u8], cursor: &mut usize) -> Result<Vec<u8>, CodecError> {
    let len = read_u16(buf, cursor)? as usize;
    let bytes = buf
        .get(*cursor..*cursor + len)
        .ok_or(CodecError::Malformed("unexpected end of packet"))?;
    *cursor += len;
    Ok(bytes.to_vec())
}

fn read_varint(buf: &[u8], cursor: &mut usize) -> Result<usize, CodecError> {
    match decode_remaining_length(&buf[(*cursor).min(buf.len())..])? {
        Some((value, used)) => {
            *cursor += used;
            Ok(value)
        }
        None => Err(CodecError::Malformed("truncated variable byte integer")),
    }
}
